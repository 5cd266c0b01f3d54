//! Chunks are self-describing containers of serialized pages.
//!
//! A chunk is immutable once written: its bytes never change, only its
//! *liveness* does, as pages inside it are superseded by pages in later
//! chunks. [`Chunk`] tracks just the metadata — header/footer fields and
//! accounting counters — not the page bytes themselves, which live in the
//! chunk store's write buffer or on disk.

use bitvec::prelude::*;

use crate::data_util::{self, KvMap};
use crate::error::{Result, StorageError};

/// Sentinel `block` value for a chunk that has not yet been written.
pub const UNSAVED: u64 = u64::MAX;

/// Header is bounded to 1024 bytes, footer to 128, per the on-disk grammar.
pub const HEADER_MAX_LEN: usize = 1024;
pub const FOOTER_LEN: usize = 128;

/// Metadata for one chunk. Field names mirror the on-disk key names (see
/// [`Chunk::to_header_map`]) with the storage-engine's own casing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: u32,
    pub block: u64,
    pub len: u64,
    pub version: u64,
    pub page_count: u32,
    pub page_count_live: u32,
    pub max_len: u64,
    pub max_len_live: u64,
    pub toc_pos: u64,
    pub layout_root_pos: u64,
    pub occupancy: BitVec<u64, Lsb0>,
    pub map_id: u32,
    pub time: u64,
    pub unused: u64,
    pub unused_at_version: u64,
    pub pin_count: u32,
    pub next: u64,
    pub volume_id: u32,
}

impl Chunk {
    /// A brand-new, not-yet-saved chunk. `time` is milliseconds since the
    /// store's creation, supplied by the caller rather than read from the
    /// wall clock so chunk construction stays deterministic and testable.
    pub fn new(id: u32, version: u64, time: u64) -> Self {
        Self {
            id,
            block: UNSAVED,
            len: 0,
            version,
            page_count: 0,
            page_count_live: 0,
            max_len: 0,
            max_len_live: 0,
            toc_pos: 0,
            layout_root_pos: 0,
            occupancy: BitVec::new(),
            map_id: 0,
            time,
            unused: 0,
            unused_at_version: 0,
            pin_count: 0,
            next: 0,
            volume_id: 0,
        }
    }

    pub fn is_unsaved(&self) -> bool {
        self.block == UNSAVED
    }

    pub fn is_saved(&self) -> bool {
        !self.is_unsaved()
    }

    pub fn is_live(&self) -> bool {
        self.page_count_live > 0
    }

    /// A saved, live chunk that still has room to grow: not fully
    /// occupied and holding no pinned (append-only) pages.
    pub fn is_rewritable(&self) -> bool {
        self.is_saved() && self.is_live() && self.pin_count == 0 && !self.is_fully_occupied()
    }

    /// A rewritable chunk is evacuable when it additionally has at least
    /// one dead page to reclaim by copying its live pages elsewhere.
    pub fn is_evacuable(&self) -> bool {
        self.is_rewritable() && self.page_count_live < self.page_count
    }

    fn is_fully_occupied(&self) -> bool {
        self.page_count > 0 && self.page_count_live == self.page_count
    }

    /// Checked per the invariants in the data model. Callers run this after
    /// every mutation that touches page accounting; a failure here means a
    /// bookkeeping bug upstream, not a malformed input.
    pub fn check_invariants(&self) -> Result<()> {
        if self.toc_pos > 0 {
            let dead = (self.page_count - self.page_count_live) as usize;
            let marked = self.occupancy.count_ones();
            if dead != marked {
                return Err(StorageError::Internal(format!(
                    "chunk {}: page_count - page_count_live ({dead}) != popcount(occupancy) ({marked})",
                    self.id
                )));
            }
        }
        if self.pin_count > self.page_count_live {
            return Err(StorageError::Internal(format!(
                "chunk {}: pin_count {} exceeds page_count_live {}",
                self.id, self.pin_count, self.page_count_live
            )));
        }
        if self.max_len_live > self.max_len {
            return Err(StorageError::Internal(format!(
                "chunk {}: max_len_live {} exceeds max_len {}",
                self.id, self.max_len_live, self.max_len
            )));
        }
        let is_unused = self.unused != 0;
        let has_no_live_pages = self.page_count_live == 0;
        if is_unused != has_no_live_pages && self.is_saved() {
            return Err(StorageError::Internal(format!(
                "chunk {}: unused ({}) disagrees with page_count_live ({})",
                self.id, self.unused, self.page_count_live
            )));
        }
        Ok(())
    }

    /// Records that the last live page in this chunk has been superseded,
    /// moving it from Saved&Live to Saved&Dead.
    pub fn mark_unused(&mut self, at_version: u64, now_ms: u64) {
        debug_assert_eq!(self.page_count_live, 0);
        self.unused = now_ms.max(1);
        self.unused_at_version = at_version;
    }

    pub fn to_header_map(&self) -> KvMap {
        let mut map = KvMap::new();
        map.insert("chunk".into(), data_util::hex_u64(self.id as u64));
        map.insert("block".into(), data_util::hex_u64(self.block));
        map.insert("version".into(), data_util::hex_u64(self.version));
        map.insert("pages".into(), data_util::hex_u64(self.page_count as u64));
        if self.page_count_live != self.page_count {
            map.insert(
                "livePages".into(),
                data_util::hex_u64(self.page_count_live as u64),
            );
        }
        map.insert("maxLen".into(), data_util::hex_u64(self.max_len));
        if self.max_len_live != self.max_len {
            map.insert("maxLenLive".into(), data_util::hex_u64(self.max_len_live));
        }
        map.insert("tocPos".into(), data_util::hex_u64(self.toc_pos));
        map.insert(
            "rootPos".into(),
            data_util::hex_u64(self.layout_root_pos),
        );
        map.insert("mapId".into(), data_util::hex_u64(self.map_id as u64));
        map.insert("time".into(), data_util::hex_u64(self.time));
        if self.unused != 0 {
            map.insert("unused".into(), data_util::hex_u64(self.unused));
            map.insert(
                "unusedAtVersion".into(),
                data_util::hex_u64(self.unused_at_version),
            );
        }
        if self.pin_count != 0 {
            map.insert("pinCount".into(), data_util::hex_u64(self.pin_count as u64));
        }
        map.insert("next".into(), data_util::hex_u64(self.next));
        if self.volume_id != 0 {
            map.insert(
                "volumeId".into(),
                data_util::hex_u64(self.volume_id as u64),
            );
        }
        if !self.occupancy.is_empty() {
            let hex: String = self
                .occupancy
                .as_raw_slice()
                .iter()
                .map(|word| format!("{word:016x}"))
                .collect();
            map.insert("occupancy".into(), data_util::quote_str(&hex));
        }
        map
    }

    /// Writes the header line (terminated by `\n`, padded with spaces so
    /// the whole thing occupies exactly `min_len - 1` bytes before the
    /// newline). `Internal` if the encoded map alone overflows `min_len`.
    pub fn write_header(&self, min_len: usize) -> Result<Vec<u8>> {
        let encoded = data_util::encode_map(&self.to_header_map());
        if encoded.len() + 1 > min_len {
            return Err(StorageError::Internal(format!(
                "chunk {} header ({} bytes) overflows min_len {min_len}",
                self.id,
                encoded.len() + 1
            )));
        }
        let mut out = vec![b' '; min_len];
        out[..encoded.len()].copy_from_slice(encoded.as_bytes());
        out[min_len - 1] = b'\n';
        Ok(out)
    }

    /// Scans `buf[start..]` up to the first newline and parses it as a
    /// chunk header.
    pub fn read_header(buf: &[u8], start: usize) -> Result<Self> {
        let rest = &buf[start..];
        let newline = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| StorageError::Corrupt("chunk header has no terminating newline".into()))?;
        let line = std::str::from_utf8(&rest[..newline])
            .map_err(|_| StorageError::Corrupt("chunk header is not valid utf-8".into()))?
            .trim_end();
        let map = data_util::decode_map(line)?;
        Self::from_header_map(&map)
    }

    fn from_header_map(map: &KvMap) -> Result<Self> {
        let get_hex = |key: &str| -> Result<u64> {
            map.get(key)
                .ok_or_else(|| StorageError::Corrupt(format!("chunk header missing {key}")))
                .and_then(|v| data_util::parse_hex_u64(v))
        };
        let id = get_hex("chunk")? as u32;
        let block = get_hex("block")?;
        let version = get_hex("version")?;
        let page_count = get_hex("pages")? as u32;
        let page_count_live = match map.get("livePages") {
            Some(v) => data_util::parse_hex_u64(v)? as u32,
            None => page_count,
        };
        let max_len = get_hex("maxLen")?;
        let max_len_live = match map.get("maxLenLive") {
            Some(v) => data_util::parse_hex_u64(v)?,
            None => max_len,
        };
        let toc_pos = get_hex("tocPos")?;
        let layout_root_pos = get_hex("rootPos")?;
        let map_id = get_hex("mapId")? as u32;
        let time = get_hex("time")?;
        let unused = match map.get("unused") {
            Some(v) => data_util::parse_hex_u64(v)?,
            None => 0,
        };
        let unused_at_version = match map.get("unusedAtVersion") {
            Some(v) => data_util::parse_hex_u64(v)?,
            None => 0,
        };
        let pin_count = match map.get("pinCount") {
            Some(v) => data_util::parse_hex_u64(v)? as u32,
            None => 0,
        };
        let next = get_hex("next")?;
        let volume_id = match map.get("volumeId") {
            Some(v) => data_util::parse_hex_u64(v)? as u32,
            None => 0,
        };
        let occupancy = match map.get("occupancy") {
            Some(v) => {
                let hex = data_util::unquote_str(v)?;
                let mut bits = BitVec::<u64, Lsb0>::new();
                for chunk in hex.as_bytes().chunks(16) {
                    let word_str = std::str::from_utf8(chunk)
                        .map_err(|_| StorageError::Corrupt("bad occupancy encoding".into()))?;
                    let word = u64::from_str_radix(word_str, 16)
                        .map_err(|_| StorageError::Corrupt("bad occupancy encoding".into()))?;
                    bits.extend_from_raw_slice(&[word]);
                }
                bits
            }
            None => BitVec::new(),
        };

        Ok(Self {
            id,
            block,
            len: 0,
            version,
            page_count,
            page_count_live,
            max_len,
            max_len_live,
            toc_pos,
            layout_root_pos,
            occupancy,
            map_id,
            time,
            unused,
            unused_at_version,
            pin_count,
            next,
            volume_id,
        })
    }

    /// The footer carries only the identity fields plus a checksum over
    /// everything preceding it in the chunk, padded to exactly
    /// [`FOOTER_LEN`] bytes and terminated by a newline.
    pub fn write_footer(&self, preceding: &[u8]) -> Vec<u8> {
        let mut map = KvMap::new();
        map.insert("chunk".into(), data_util::hex_u64(self.id as u64));
        map.insert("block".into(), data_util::hex_u64(self.block));
        map.insert("version".into(), data_util::hex_u64(self.version));
        let checksum = data_util::get_fletcher32(preceding, 0, preceding.len());
        map.insert("fletcher".into(), data_util::hex_u64(checksum as u64));
        let encoded = data_util::encode_map(&map);
        let mut out = vec![b' '; FOOTER_LEN];
        out[..encoded.len()].copy_from_slice(encoded.as_bytes());
        out[FOOTER_LEN - 1] = b'\n';
        out
    }

    /// Validates a footer against the header it claims to belong to and
    /// the bytes it's supposed to checksum. Any disagreement is corruption.
    pub fn verify_footer(&self, footer: &[u8], preceding: &[u8]) -> Result<()> {
        if footer.len() != FOOTER_LEN {
            return Err(StorageError::Corrupt(format!(
                "chunk {} footer has length {}, expected {FOOTER_LEN}",
                self.id,
                footer.len()
            )));
        }
        let line = std::str::from_utf8(footer)
            .map_err(|_| StorageError::Corrupt("chunk footer is not valid utf-8".into()))?
            .trim_end();
        let map = data_util::decode_map(line)?;
        let id = data_util::parse_hex_u64(
            map.get("chunk")
                .ok_or_else(|| StorageError::Corrupt("chunk footer missing chunk id".into()))?,
        )? as u32;
        let block = data_util::parse_hex_u64(
            map.get("block")
                .ok_or_else(|| StorageError::Corrupt("chunk footer missing block".into()))?,
        )?;
        let version = data_util::parse_hex_u64(
            map.get("version")
                .ok_or_else(|| StorageError::Corrupt("chunk footer missing version".into()))?,
        )?;
        if id != self.id || block != self.block || version != self.version {
            return Err(StorageError::Corrupt(format!(
                "chunk {} footer disagrees with header (footer: chunk={id} block={block} version={version})",
                self.id
            )));
        }
        let expected = data_util::parse_hex_u64(
            map.get("fletcher")
                .ok_or_else(|| StorageError::Corrupt("chunk footer missing checksum".into()))?,
        )? as u32;
        let actual = data_util::get_fletcher32(preceding, 0, preceding.len());
        if expected != actual {
            return Err(StorageError::Corrupt(format!(
                "chunk {} footer checksum mismatch (expected {expected:#x}, got {actual:#x})",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_defaults() {
        let chunk = Chunk::new(7, 3, 1000);
        let bytes = chunk.write_header(256).unwrap();
        let parsed = Chunk::read_header(&bytes, 0).unwrap();
        assert_eq!(parsed.id, chunk.id);
        assert_eq!(parsed.version, chunk.version);
        assert_eq!(parsed.page_count_live, parsed.page_count);
        assert_eq!(parsed.max_len_live, parsed.max_len);
    }

    #[test]
    fn header_round_trips_with_dead_pages() {
        let mut chunk = Chunk::new(2, 5, 2000);
        chunk.page_count = 10;
        chunk.page_count_live = 4;
        chunk.max_len = 4096;
        chunk.max_len_live = 1024;
        chunk.pin_count = 1;
        let bytes = chunk.write_header(512).unwrap();
        let parsed = Chunk::read_header(&bytes, 0).unwrap();
        assert_eq!(parsed.page_count_live, 4);
        assert_eq!(parsed.max_len_live, 1024);
        assert_eq!(parsed.pin_count, 1);
    }

    #[test]
    fn header_overflow_is_internal() {
        let chunk = Chunk::new(1, 1, 1);
        assert!(matches!(
            chunk.write_header(4),
            Err(StorageError::Internal(_))
        ));
    }

    #[test]
    fn footer_round_trips_and_detects_bit_flip() {
        let chunk = Chunk {
            block: 5,
            ..Chunk::new(9, 1, 1)
        };
        let preceding = b"some preceding chunk bytes";
        let mut footer = chunk.write_footer(preceding);
        chunk.verify_footer(&footer, preceding).unwrap();

        footer[0] ^= 0x01;
        assert!(chunk.verify_footer(&footer, preceding).is_err());
    }

    #[test]
    fn state_predicates_match_lifecycle() {
        let mut chunk = Chunk::new(1, 1, 1);
        assert!(chunk.is_unsaved());
        assert!(!chunk.is_live());

        chunk.block = 4;
        chunk.page_count = 3;
        chunk.page_count_live = 3;
        assert!(chunk.is_saved());
        assert!(chunk.is_live());
        assert!(chunk.is_rewritable());
        assert!(!chunk.is_evacuable());

        chunk.page_count_live = 1;
        assert!(chunk.is_evacuable());

        chunk.page_count_live = 0;
        chunk.mark_unused(4, 10);
        assert!(!chunk.is_live());
        assert_eq!(chunk.unused_at_version, 4);
    }

    #[test]
    fn invariants_catch_occupancy_mismatch() {
        let mut chunk = Chunk::new(1, 1, 1);
        chunk.toc_pos = 10;
        chunk.page_count = 5;
        chunk.page_count_live = 2;
        // occupancy left empty: 3 dead pages claimed but 0 marked.
        assert!(chunk.check_invariants().is_err());
    }

    #[test]
    fn invariants_catch_pin_count_overflow() {
        let mut chunk = Chunk::new(1, 1, 1);
        chunk.page_count_live = 1;
        chunk.pin_count = 2;
        assert!(chunk.check_invariants().is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn header_round_trips_for_any_valid_counters(
            id in any::<u32>(),
            version in any::<u64>(),
            time in any::<u64>(),
            page_count in 0u32..1000,
            live_deficit in 0u32..1000,
            max_len in 0u64..(1 << 40),
            live_deficit_len in 0u64..(1 << 40),
            pin_count in 0u32..1000,
        ) {
            let page_count_live = page_count.saturating_sub(live_deficit);
            let max_len_live = max_len.saturating_sub(live_deficit_len);
            let pin_count = pin_count.min(page_count_live);

            let mut chunk = Chunk::new(id, version, time);
            chunk.page_count = page_count;
            chunk.page_count_live = page_count_live;
            chunk.max_len = max_len;
            chunk.max_len_live = max_len_live;
            chunk.pin_count = pin_count;

            let bytes = chunk.write_header(HEADER_MAX_LEN).unwrap();
            let parsed = Chunk::read_header(&bytes, 0).unwrap();
            prop_assert_eq!(parsed.id, chunk.id);
            prop_assert_eq!(parsed.version, chunk.version);
            prop_assert_eq!(parsed.page_count, chunk.page_count);
            prop_assert_eq!(parsed.page_count_live, chunk.page_count_live);
            prop_assert_eq!(parsed.max_len, chunk.max_len);
            prop_assert_eq!(parsed.max_len_live, chunk.max_len_live);
            prop_assert_eq!(parsed.pin_count, chunk.pin_count);
        }

        #[test]
        fn footer_round_trips_for_any_preceding_bytes(
            id in any::<u32>(),
            version in any::<u64>(),
            block in any::<u64>(),
            preceding in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let chunk = Chunk { block, ..Chunk::new(id, version, 1) };
            let footer = chunk.write_footer(&preceding);
            prop_assert!(chunk.verify_footer(&footer, &preceding).is_ok());
        }
    }
}
