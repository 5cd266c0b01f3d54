//! Status, log-id and the has-rolled-back-once flag packed into one atomic
//! word: `status(4) | has_rollback(1) | log_id(40)`, with the remaining
//! high bits reserved. CAS is used for every mutation; no mutex guards
//! this word.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, TxnError};
use crate::operation_id::MAX_LOG_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Closed = 0,
    Open = 1,
    Prepared = 2,
    Committing = 3,
    Committed = 4,
    RollingBack = 5,
    RolledBack = 6,
}

impl TxStatus {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => TxStatus::Closed,
            1 => TxStatus::Open,
            2 => TxStatus::Prepared,
            3 => TxStatus::Committing,
            4 => TxStatus::Committed,
            5 => TxStatus::RollingBack,
            6 => TxStatus::RolledBack,
            other => unreachable!("corrupt status bits {other}"),
        }
    }
}

/// Whether `from -> to` appears in the valid-transitions table.
fn is_valid_transition(from: TxStatus, to: TxStatus) -> bool {
    use TxStatus::*;
    matches!(
        (from, to),
        (Closed, Open)
            | (RollingBack, Open)
            | (Open, RollingBack)
            | (Open, Prepared)
            | (Open, Committing)
            | (Open, RolledBack)
            | (Prepared, Committing)
            | (Prepared, RolledBack)
            | (Committing, Committing)
            | (Committing, Committed)
            | (Committed, Closed)
            | (RolledBack, Closed)
            | (Committing, Closed)
    )
}

const STATUS_BITS: u64 = 4;
const ROLLBACK_BITS: u64 = 1;
const LOG_ID_BITS: u64 = 40;
const STATUS_MASK: u64 = (1 << STATUS_BITS) - 1;
const LOG_ID_MASK: u64 = (1 << LOG_ID_BITS) - 1;

fn pack(status: TxStatus, has_rollback: bool, log_id: u64) -> u64 {
    (status as u64)
        | ((has_rollback as u64) << STATUS_BITS)
        | (log_id << (STATUS_BITS + ROLLBACK_BITS))
}

fn unpack(word: u64) -> (TxStatus, bool, u64) {
    let status = TxStatus::from_bits((word & STATUS_MASK) as u8);
    let has_rollback = (word >> STATUS_BITS) & 1 != 0;
    let log_id = (word >> (STATUS_BITS + ROLLBACK_BITS)) & LOG_ID_MASK;
    (status, has_rollback, log_id)
}

pub struct StatusWord {
    word: AtomicU64,
}

impl StatusWord {
    pub fn new(status: TxStatus) -> Self {
        Self {
            word: AtomicU64::new(pack(status, false, 0)),
        }
    }

    pub fn load(&self) -> (TxStatus, bool, u64) {
        unpack(self.word.load(Ordering::Acquire))
    }

    pub fn status(&self) -> TxStatus {
        self.load().0
    }

    pub fn log_id(&self) -> u64 {
        self.load().2
    }

    pub fn has_rollback(&self) -> bool {
        self.load().1
    }

    /// Validates and applies `to`, retrying the CAS if another thread
    /// concurrently bumped `log_id`. The `has_rollback` flag is sticky and
    /// never cleared here — only [`StatusWord::mark_has_rollback`] sets it.
    pub fn transition(&self, to: TxStatus) -> Result<()> {
        loop {
            let current = self.word.load(Ordering::Acquire);
            let (from, has_rollback, log_id) = unpack(current);
            if !is_valid_transition(from, to) {
                return Err(TxnError::IllegalState(format!(
                    "{from:?} -> {to:?} is not a valid transition"
                )));
            }
            let next = pack(to, has_rollback, log_id);
            if self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub fn mark_has_rollback(&self) {
        loop {
            let current = self.word.load(Ordering::Acquire);
            let (status, _, log_id) = unpack(current);
            let next = pack(status, true, log_id);
            if self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Atomically increments `log_id`, returning the new value. Fails
    /// with `TooBig` once the 2^40 ceiling is reached.
    pub fn increment_log_id(&self) -> Result<u64> {
        loop {
            let current = self.word.load(Ordering::Acquire);
            let (status, has_rollback, log_id) = unpack(current);
            if log_id + 1 >= MAX_LOG_ID {
                return Err(TxnError::TooBig);
            }
            let next = pack(status, has_rollback, log_id + 1);
            if self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(log_id + 1);
            }
        }
    }

    /// Used when a write aborts locally right after logging its undo
    /// entry, to avoid leaving a gap in the log-id sequence.
    pub fn decrement_log_id(&self) {
        loop {
            let current = self.word.load(Ordering::Acquire);
            let (status, has_rollback, log_id) = unpack(current);
            let next = pack(status, has_rollback, log_id.saturating_sub(1));
            if self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions_succeed() {
        let word = StatusWord::new(TxStatus::Closed);
        word.transition(TxStatus::Open).unwrap();
        word.transition(TxStatus::Committing).unwrap();
        word.transition(TxStatus::Committed).unwrap();
        word.transition(TxStatus::Closed).unwrap();
    }

    #[test]
    fn invalid_transition_is_illegal_state() {
        let word = StatusWord::new(TxStatus::Closed);
        assert!(matches!(
            word.transition(TxStatus::Committed),
            Err(TxnError::IllegalState(_))
        ));
    }

    #[test]
    fn log_id_increments_and_enforces_ceiling() {
        let word = StatusWord::new(TxStatus::Open);
        assert_eq!(word.increment_log_id().unwrap(), 1);
        assert_eq!(word.log_id(), 1);
    }

    #[test]
    fn has_rollback_is_sticky() {
        let word = StatusWord::new(TxStatus::Open);
        word.mark_has_rollback();
        word.transition(TxStatus::Committing).unwrap();
        assert!(word.has_rollback());
    }
}
