//! A single transaction's identity and live state: its slot, sequence
//! number, packed status word, and the version snapshot it pins.

use parking_lot::Mutex;
use storage::versioning::TxCounter;

use crate::status::{StatusWord, TxStatus};

pub struct Transaction {
    pub slot_id: u16,
    pub sequence_num: u64,
    pub name: Mutex<Option<String>>,
    pub timeout_ms: u64,
    pub owner_id: u64,
    pub tx_counter: TxCounter,
    pub(crate) status: StatusWord,
    /// Slot this transaction is currently blocked on, if any. Consulted by
    /// the deadlock cycle check when another transaction considers
    /// waiting on this one.
    pub(crate) waiting_for: Mutex<Option<u16>>,
}

impl Transaction {
    pub fn status(&self) -> TxStatus {
        self.status.status()
    }

    pub fn log_id(&self) -> u64 {
        self.status.log_id()
    }

    pub fn has_rollback(&self) -> bool {
        self.status.has_rollback()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = Some(name.into());
    }
}
