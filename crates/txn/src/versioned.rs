//! A versioned value: `(committed_value, operation_id)`. A `None`
//! `operation_id` marks a committed value; `value: None` marks a pending
//! or committed deletion.

use pagemap::PageCodec;

use crate::operation_id::OperationId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    pub value: Option<V>,
    pub operation_id: Option<OperationId>,
}

impl<V> Versioned<V> {
    pub fn committed(value: Option<V>) -> Self {
        Self {
            value,
            operation_id: None,
        }
    }

    pub fn uncommitted(value: Option<V>, operation_id: OperationId) -> Self {
        Self {
            value,
            operation_id: Some(operation_id),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.operation_id.is_none()
    }

    /// Strips the operation id, turning an in-flight write into a
    /// committed value. Used by commit.
    pub fn into_committed(self) -> Self {
        Self {
            value: self.value,
            operation_id: None,
        }
    }
}

impl<V: PageCodec> PageCodec for Versioned<V> {
    fn encode_into(&self, out: &mut Vec<u8>) {
        let flags: u8 = (self.value.is_some() as u8) | ((self.operation_id.is_some() as u8) << 1);
        out.push(flags);
        if let Some(v) = &self.value {
            v.encode_into(out);
        }
        if let Some(op) = &self.operation_id {
            op.encode_into(out);
        }
    }

    fn decode_from(input: &[u8]) -> pagemap::Result<(Self, usize)> {
        let flags = *input
            .first()
            .ok_or(pagemap::PageMapError::Truncated("Versioned flags"))?;
        let mut pos = 1;
        let value = if flags & 0x01 != 0 {
            let (v, used) = V::decode_from(&input[pos..])?;
            pos += used;
            Some(v)
        } else {
            None
        };
        let operation_id = if flags & 0x02 != 0 {
            let (op, used) = OperationId::decode_from(&input[pos..])?;
            pos += used;
            Some(op)
        } else {
            None
        };
        Ok((Self { value, operation_id }, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_round_trips() {
        let vv: Versioned<String> = Versioned::committed(Some("x".to_string()));
        let mut buf = Vec::new();
        vv.encode_into(&mut buf);
        let (decoded, used) = Versioned::<String>::decode_from(&buf).unwrap();
        assert_eq!(decoded, vv);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn uncommitted_deletion_round_trips() {
        let op = OperationId::new(3, 9).unwrap();
        let vv: Versioned<String> = Versioned::uncommitted(None, op);
        let mut buf = Vec::new();
        vv.encode_into(&mut buf);
        let (decoded, _) = Versioned::<String>::decode_from(&buf).unwrap();
        assert_eq!(decoded, vv);
        assert!(!decoded.is_committed());
    }
}
