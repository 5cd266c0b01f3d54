//! Minimal length-prefixed binary codec for map keys and values. Pages are
//! not subject to the ASCII header/footer grammar — that's specific to
//! chunk metadata — so a compact binary encoding is used here instead.

use crate::error::{PageMapError, Result};

pub trait PageCodec: Sized {
    fn encode_into(&self, out: &mut Vec<u8>);
    fn decode_from(input: &[u8]) -> Result<(Self, usize)>;
}

impl PageCodec for u64 {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn decode_from(input: &[u8]) -> Result<(Self, usize)> {
        let bytes: [u8; 8] = input
            .get(..8)
            .ok_or(PageMapError::Truncated("u64"))?
            .try_into()
            .unwrap();
        Ok((u64::from_le_bytes(bytes), 8))
    }
}

impl PageCodec for u32 {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn decode_from(input: &[u8]) -> Result<(Self, usize)> {
        let bytes: [u8; 4] = input
            .get(..4)
            .ok_or(PageMapError::Truncated("u32"))?
            .try_into()
            .unwrap();
        Ok((u32::from_le_bytes(bytes), 4))
    }
}

impl PageCodec for String {
    fn encode_into(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode_into(out);
        out.extend_from_slice(self.as_bytes());
    }

    fn decode_from(input: &[u8]) -> Result<(Self, usize)> {
        let (len, prefix) = u32::decode_from(input)?;
        let len = len as usize;
        let body = input
            .get(prefix..prefix + len)
            .ok_or(PageMapError::Truncated("String"))?;
        let s = std::str::from_utf8(body)
            .map_err(|_| PageMapError::InvalidUtf8)?
            .to_string();
        Ok((s, prefix + len))
    }
}

impl PageCodec for Vec<u8> {
    fn encode_into(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode_into(out);
        out.extend_from_slice(self);
    }

    fn decode_from(input: &[u8]) -> Result<(Self, usize)> {
        let (len, prefix) = u32::decode_from(input)?;
        let len = len as usize;
        let body = input
            .get(prefix..prefix + len)
            .ok_or(PageMapError::Truncated("Vec<u8>"))?;
        Ok((body.to_vec(), prefix + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips() {
        let mut buf = Vec::new();
        "hello".to_string().encode_into(&mut buf);
        let (decoded, used) = String::decode_from(&buf).unwrap();
        assert_eq!(decoded, "hello");
        assert_eq!(used, buf.len());
    }

    #[test]
    fn u64_round_trips() {
        let mut buf = Vec::new();
        42u64.encode_into(&mut buf);
        let (decoded, used) = u64::decode_from(&buf).unwrap();
        assert_eq!(decoded, 42);
        assert_eq!(used, 8);
    }
}
