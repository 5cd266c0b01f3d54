//! The undo log: a persistent map keyed by `(slot_id, log_id)` holding
//! pre-images for in-flight transactions, plus the registry that lets
//! [`crate::transaction_store::TransactionStore`] finalize commits and
//! rollbacks against whichever [`UndoableMap`] a logged entry belongs to
//! without knowing its key/value types.

use pagemap::PageCodec;

use crate::operation_id::OperationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UndoKey {
    pub slot_id: u16,
    pub log_id: u64,
}

impl PageCodec for UndoKey {
    fn encode_into(&self, out: &mut Vec<u8>) {
        (self.slot_id as u64).encode_into(out);
        self.log_id.encode_into(out);
    }

    fn decode_from(input: &[u8]) -> pagemap::Result<(Self, usize)> {
        let (slot, used1) = u64::decode_from(input)?;
        let (log_id, used2) = u64::decode_from(&input[used1..])?;
        Ok((
            Self {
                slot_id: slot as u16,
                log_id,
            },
            used1 + used2,
        ))
    }
}

/// `(map_id, key, old_versioned_value)`, the pre-image a rollback
/// restores and a commit discards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub map_id: u32,
    pub key: Vec<u8>,
    pub old_value: Option<Vec<u8>>,
    pub old_operation_id: Option<OperationId>,
}

impl PageCodec for UndoEntry {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.map_id.encode_into(out);
        self.key.encode_into(out);
        let flags: u8 =
            (self.old_value.is_some() as u8) | ((self.old_operation_id.is_some() as u8) << 1);
        out.push(flags);
        if let Some(v) = &self.old_value {
            v.encode_into(out);
        }
        if let Some(op) = &self.old_operation_id {
            op.encode_into(out);
        }
    }

    fn decode_from(input: &[u8]) -> pagemap::Result<(Self, usize)> {
        let (map_id, mut pos) = u32::decode_from(input)?;
        let (key, used) = Vec::<u8>::decode_from(&input[pos..])?;
        pos += used;
        let flags = *input
            .get(pos)
            .ok_or(pagemap::PageMapError::Truncated("UndoEntry flags"))?;
        pos += 1;
        let old_value = if flags & 0x01 != 0 {
            let (v, used) = Vec::<u8>::decode_from(&input[pos..])?;
            pos += used;
            Some(v)
        } else {
            None
        };
        let old_operation_id = if flags & 0x02 != 0 {
            let (op, used) = OperationId::decode_from(&input[pos..])?;
            pos += used;
            Some(op)
        } else {
            None
        };
        Ok((
            Self {
                map_id,
                key,
                old_value,
                old_operation_id,
            },
            pos,
        ))
    }
}

/// Implemented by a transactional map so the transaction store can finalize
/// commits and replay rollbacks against it without being generic over the
/// map's key/value types — dispatch happens by `map_id` through a registry.
pub trait UndoableMap: Send + Sync {
    fn map_id(&self) -> u32;

    /// The write at `key` owned by `(slot, op_id.log_id)` is now committed:
    /// strip its operation id, or remove the entry entirely if its value
    /// was a deletion.
    fn finalize_commit(&self, key: &[u8], op_id: OperationId);

    /// Restore the pre-image at `key`, undoing an uncommitted write.
    fn rollback_entry(&self, key: &[u8], old_value: Option<Vec<u8>>, old_operation_id: Option<OperationId>);
}
