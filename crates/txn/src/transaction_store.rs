//! Allocates transaction slots, maintains the undo log, and drives
//! commit/rollback/prepare/deadlock-detection. Mirrors §4.6: a bit set of
//! open slots, a persistent undo log keyed by `(slot, log_id)`, a persistent
//! `prepared_transactions` map for two-phase-commit participants, a global
//! sequence counter, and condition-variable-based waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitvec::prelude::*;
use pagemap::{PageCodec, PersistentMap};
use parking_lot::{Condvar, Mutex, RwLock};
use storage::chunk_store::ChunkStore;
use storage::page_ref::PageType;
use storage::versioning::VersionTracker;
use tracing::{debug, warn};

use crate::error::{Result, TxnError};
use crate::operation_id::OperationId;
use crate::status::{StatusWord, TxStatus};
use crate::transaction::Transaction;
use crate::undo::{UndoEntry, UndoKey, UndoableMap};

const MAX_SLOTS: usize = 1 << 16;

/// Reserved `map_id`s for the store's own persistent maps. Chosen from the
/// top of the `u32` range so they never collide with `db::store::map_id_for`'s
/// FNV-1a hash of a user-visible map name (the same assumption already
/// accepted for hash-based map identity in general).
pub const UNDO_LOG_MAP_ID: u32 = u32::MAX;
pub const PREPARED_TX_MAP_ID: u32 = u32::MAX - 1;

/// What's recorded for a transaction that has entered the `Prepared` state:
/// enough to report it back to a two-phase-commit coordinator after a
/// restart, without needing the live `Transaction` to still be in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedEntry {
    pub sequence_num: u64,
    pub owner_id: u64,
}

impl PageCodec for PreparedEntry {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.sequence_num.encode_into(out);
        self.owner_id.encode_into(out);
    }

    fn decode_from(input: &[u8]) -> pagemap::Result<(Self, usize)> {
        let (sequence_num, used1) = u64::decode_from(input)?;
        let (owner_id, used2) = u64::decode_from(&input[used1..])?;
        Ok((
            Self {
                sequence_num,
                owner_id,
            },
            used1 + used2,
        ))
    }
}

struct Waiter {
    waiting_for: Mutex<Option<u16>>,
    cv: Condvar,
}

pub struct TransactionStore {
    open_slots: Mutex<BitVec<u64, Lsb0>>,
    slots: RwLock<HashMap<u16, Arc<Transaction>>>,
    waiters: RwLock<HashMap<u16, Arc<Waiter>>>,
    undo_log: PersistentMap<UndoKey, UndoEntry>,
    prepared_transactions: PersistentMap<u32, PreparedEntry>,
    registry: RwLock<HashMap<u32, Arc<dyn UndoableMap>>>,
    sequence_num: AtomicU64,
    versions: VersionTracker,
}

impl TransactionStore {
    pub fn new(versions: VersionTracker) -> Self {
        let mut open_slots = BitVec::new();
        open_slots.resize(MAX_SLOTS, false);
        Self {
            open_slots: Mutex::new(open_slots),
            slots: RwLock::new(HashMap::new()),
            waiters: RwLock::new(HashMap::new()),
            undo_log: PersistentMap::empty(UNDO_LOG_MAP_ID),
            prepared_transactions: PersistentMap::empty(PREPARED_TX_MAP_ID),
            registry: RwLock::new(HashMap::new()),
            sequence_num: AtomicU64::new(0),
            versions,
        }
    }

    /// Like [`TransactionStore::new`], but restores the undo log and any
    /// transactions a prior run left in `Prepared` from their last saved
    /// roots, so a crash between prepare and commit/rollback is still
    /// resolvable after reopening the store.
    pub fn load(versions: VersionTracker, store: &ChunkStore) -> Result<Self> {
        let undo_root = store.layout_root(UNDO_LOG_MAP_ID)?;
        let prepared_root = store.layout_root(PREPARED_TX_MAP_ID)?;
        let mut open_slots = BitVec::new();
        open_slots.resize(MAX_SLOTS, false);
        Ok(Self {
            open_slots: Mutex::new(open_slots),
            slots: RwLock::new(HashMap::new()),
            waiters: RwLock::new(HashMap::new()),
            undo_log: PersistentMap::load(UNDO_LOG_MAP_ID, store, undo_root)?,
            prepared_transactions: PersistentMap::load(PREPARED_TX_MAP_ID, store, prepared_root)?,
            registry: RwLock::new(HashMap::new()),
            sequence_num: AtomicU64::new(0),
            versions,
        })
    }

    pub fn register_map(&self, map: Arc<dyn UndoableMap>) {
        self.registry.write().insert(map.map_id(), map);
    }

    /// Allocates a slot by first-zero scan, pins the current store
    /// version for snapshot reads, and opens the transaction.
    pub fn begin(&self, timeout_ms: u64, owner_id: u64) -> Result<Arc<Transaction>> {
        let slot_id = {
            let mut open_slots = self.open_slots.lock();
            let free = open_slots
                .iter()
                .position(|b| !*b)
                .ok_or_else(|| TxnError::IllegalState("no free transaction slots".into()))?;
            open_slots.set(free, true);
            free as u16
        };
        let sequence_num = self.sequence_num.fetch_add(1, Ordering::AcqRel);
        let tx_counter = self.versions.open_snapshot();
        let status = StatusWord::new(TxStatus::Closed);
        status.transition(TxStatus::Open)?;
        let tx = Arc::new(Transaction {
            slot_id,
            sequence_num,
            name: Mutex::new(None),
            timeout_ms,
            owner_id,
            tx_counter,
            status,
            waiting_for: Mutex::new(None),
        });
        self.slots.write().insert(slot_id, tx.clone());
        self.waiters.write().insert(
            slot_id,
            Arc::new(Waiter {
                waiting_for: Mutex::new(None),
                cv: Condvar::new(),
            }),
        );
        debug!(slot_id, sequence_num, "transaction began");
        Ok(tx)
    }

    /// Appends an undo entry and returns its key, bumping `log_id`.
    pub fn log(
        &self,
        tx: &Transaction,
        map_id: u32,
        key: Vec<u8>,
        old_value: Option<Vec<u8>>,
        old_operation_id: Option<OperationId>,
    ) -> Result<UndoKey> {
        let log_id = tx.status.increment_log_id()?;
        let undo_key = UndoKey {
            slot_id: tx.slot_id,
            log_id,
        };
        self.undo_log.apply([(
            undo_key,
            Some(UndoEntry {
                map_id,
                key,
                old_value,
                old_operation_id,
            }),
        )]);
        Ok(undo_key)
    }

    /// Called when a write that was just logged aborts locally before
    /// taking effect, so the log-id sequence has no gap and no
    /// now-irrelevant entry lingers in the log.
    pub fn log_undo(&self, tx: &Transaction) {
        let log_id = tx.status.log_id();
        self.undo_log.apply([(
            UndoKey {
                slot_id: tx.slot_id,
                log_id,
            },
            None,
        )]);
        tx.status.decrement_log_id();
    }

    /// Transitions an open transaction into `Prepared` for two-phase
    /// commit, recording it in the persistent `prepared_transactions` map
    /// so a coordinator can find it again after a restart.
    pub fn prepare(&self, tx: &Transaction) -> Result<()> {
        tx.status.transition(TxStatus::Prepared)?;
        self.prepared_transactions.apply([(
            tx.slot_id as u32,
            Some(PreparedEntry {
                sequence_num: tx.sequence_num,
                owner_id: tx.owner_id,
            }),
        )]);
        Ok(())
    }

    /// The recorded prepared-transaction entry for `slot_id`, if any —
    /// including one left over from before a restart.
    pub fn prepared_transaction(&self, slot_id: u16) -> Option<PreparedEntry> {
        self.prepared_transactions.get(&(slot_id as u32))
    }

    /// Strips operation ids from this transaction's writes (or removes
    /// deletions), discards its undo entries, and closes the slot.
    pub fn commit(&self, tx: &Transaction) -> Result<()> {
        tx.status.transition(TxStatus::Committing)?;
        let entries = self.drain_entries(tx.slot_id);
        let registry = self.registry.read();
        for (undo_key, entry) in &entries {
            if let Some(map) = registry.get(&entry.map_id) {
                let op_id = OperationId {
                    slot: undo_key.slot_id,
                    log_id: undo_key.log_id,
                };
                map.finalize_commit(&entry.key, op_id);
            } else {
                warn!(map_id = entry.map_id, "commit referenced unregistered map");
            }
        }
        tx.status.transition(TxStatus::Committed)?;
        tx.status.transition(TxStatus::Closed)?;
        self.prepared_transactions.apply([(tx.slot_id as u32, None)]);
        self.end_transaction(tx, !entries.is_empty());
        Ok(())
    }

    /// Restores pre-images for undo entries in `(to_log_id, from_log_id]`,
    /// in reverse order, and removes each as it is applied. A rollback to
    /// a savepoint (`to_log_id > 0`) passes through `RollingBack` and
    /// returns to `Open`; a full rollback (`to_log_id == 0`) goes straight
    /// to `RolledBack`, since the status table has no `RollingBack ->
    /// RolledBack` edge.
    pub fn rollback_to(&self, tx: &Transaction, from_log_id: u64, to_log_id: u64) -> Result<()> {
        let is_full_rollback = to_log_id == 0;
        if !is_full_rollback {
            tx.status.transition(TxStatus::RollingBack)?;
        }
        tx.status.mark_has_rollback();
        let registry = self.registry.read();
        let mut to_remove = Vec::new();
        for log_id in (to_log_id + 1..=from_log_id).rev() {
            let undo_key = UndoKey {
                slot_id: tx.slot_id,
                log_id,
            };
            if let Some(entry) = self.undo_log.get(&undo_key) {
                if let Some(map) = registry.get(&entry.map_id) {
                    map.rollback_entry(&entry.key, entry.old_value, entry.old_operation_id);
                }
                to_remove.push(undo_key);
            }
        }
        drop(registry);
        if !to_remove.is_empty() {
            self.undo_log.apply(to_remove.into_iter().map(|k| (k, None)));
        }
        if is_full_rollback {
            tx.status.transition(TxStatus::RolledBack)?;
            tx.status.transition(TxStatus::Closed)?;
            self.prepared_transactions.apply([(tx.slot_id as u32, None)]);
            self.end_transaction(tx, true);
        } else {
            tx.status.transition(TxStatus::Open)?;
        }
        Ok(())
    }

    fn drain_entries(&self, slot_id: u16) -> Vec<(UndoKey, UndoEntry)> {
        let snapshot = self.undo_log.snapshot();
        let entries: Vec<(UndoKey, UndoEntry)> = snapshot
            .iter()
            .filter(|(k, _)| k.slot_id == slot_id)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        if !entries.is_empty() {
            self.undo_log
                .apply(entries.iter().map(|(k, _)| (*k, None)));
        }
        entries
    }

    /// Pages ready to be folded into the coordinator's save, for whichever
    /// system maps changed since the last save. Empty if neither did.
    pub fn system_maps_to_save(&self) -> Vec<(u32, PageType, Vec<u8>)> {
        let mut pages = Vec::new();
        if self.undo_log.is_dirty() {
            pages.push((UNDO_LOG_MAP_ID, PageType::Undo, self.undo_log.to_page_bytes()));
        }
        if self.prepared_transactions.is_dirty() {
            pages.push((
                PREPARED_TX_MAP_ID,
                PageType::Prepared,
                self.prepared_transactions.to_page_bytes(),
            ));
        }
        pages
    }

    pub fn mark_system_maps_clean(&self) {
        self.undo_log.mark_clean();
        self.prepared_transactions.mark_clean();
    }

    /// Releases the slot and wakes anything waiting on this transaction.
    pub fn end_transaction(&self, tx: &Transaction, _had_changes: bool) {
        self.open_slots.lock().set(tx.slot_id as usize, false);
        self.slots.write().remove(&tx.slot_id);
        if let Some(waiter) = self.waiters.read().get(&tx.slot_id) {
            waiter.cv.notify_all();
        }
    }

    pub fn status_of(&self, slot_id: u16) -> Option<TxStatus> {
        self.slots.read().get(&slot_id).map(|tx| tx.status())
    }

    pub fn undo_entry(&self, slot_id: u16, log_id: u64) -> Option<UndoEntry> {
        self.undo_log.get(&UndoKey { slot_id, log_id })
    }

    fn blocking_slot_of(&self, slot_id: u16) -> Option<u16> {
        self.slots
            .read()
            .get(&slot_id)
            .and_then(|tx| *tx.waiting_for.lock())
    }

    /// Walks `blocking_tx` pointers starting at `start`; finds a cycle
    /// back to `self_slot` if one exists.
    fn has_cycle_to(&self, self_slot: u16, start: u16) -> bool {
        let mut current = start;
        let mut steps = 0;
        loop {
            if current == self_slot {
                return true;
            }
            steps += 1;
            if steps > MAX_SLOTS {
                return false;
            }
            match self.blocking_slot_of(current) {
                Some(next) => current = next,
                None => return false,
            }
        }
    }

    /// Blocks the caller on `blocking_slot` until it closes or starts
    /// rolling back, or until `tx.timeout_ms` elapses. Runs a deadlock
    /// cycle check first, making `tx` the victim if one is found.
    pub fn wait_for(&self, tx: &Transaction, blocking_slot: u16) -> Result<bool> {
        if self.has_cycle_to(tx.slot_id, blocking_slot) {
            return Err(TxnError::Deadlock);
        }
        *tx.waiting_for.lock() = Some(blocking_slot);

        let waiter = self.waiters.read().get(&blocking_slot).cloned();
        let result = if let Some(waiter) = waiter {
            let deadline = Instant::now() + Duration::from_millis(tx.timeout_ms);
            let mut guard = waiter.waiting_for.lock();
            loop {
                if self.slots.read().get(&blocking_slot).map_or(true, |other| {
                    matches!(other.status(), TxStatus::Closed | TxStatus::RollingBack)
                }) {
                    break true;
                }
                let now = Instant::now();
                if now >= deadline {
                    break false;
                }
                let timeout_result = waiter.cv.wait_for(&mut guard, deadline - now);
                if timeout_result.timed_out() {
                    break false;
                }
            }
        } else {
            true
        };

        *tx.waiting_for.lock() = None;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_store() -> TransactionStore {
        TransactionStore::new(VersionTracker::new(0))
    }

    #[test]
    fn begin_assigns_slots_and_log_grows() {
        let store = new_store();
        let tx = store.begin(1000, 1).unwrap();
        assert_eq!(tx.status(), TxStatus::Open);
        let key = store
            .log(&tx, 1, b"k".to_vec(), None, None)
            .unwrap();
        assert_eq!(key.log_id, 1);
    }

    #[test]
    fn log_undo_removes_entry_and_rewinds_log_id() {
        let store = new_store();
        let tx = store.begin(1000, 1).unwrap();
        store.log(&tx, 1, b"k".to_vec(), None, None).unwrap();
        store.log_undo(&tx);
        assert_eq!(tx.log_id(), 0);
        assert!(store.undo_log.snapshot().is_empty());
    }

    #[test]
    fn commit_without_registered_map_still_closes() {
        let store = new_store();
        let tx = store.begin(1000, 1).unwrap();
        store.log(&tx, 1, b"k".to_vec(), None, None).unwrap();
        store.commit(&tx).unwrap();
        assert_eq!(tx.status(), TxStatus::Closed);
    }

    #[test]
    fn rollback_to_start_closes_transaction() {
        let store = new_store();
        let tx = store.begin(1000, 1).unwrap();
        store.log(&tx, 1, b"a".to_vec(), None, None).unwrap();
        store.log(&tx, 1, b"b".to_vec(), None, None).unwrap();
        store.rollback_to(&tx, 2, 0).unwrap();
        assert_eq!(tx.status(), TxStatus::Closed);
        assert!(tx.has_rollback());
    }

    #[test]
    fn rollback_to_savepoint_reopens_transaction() {
        let store = new_store();
        let tx = store.begin(1000, 1).unwrap();
        store.log(&tx, 1, b"a".to_vec(), None, None).unwrap();
        let savepoint = tx.log_id();
        store.log(&tx, 1, b"b".to_vec(), None, None).unwrap();
        store.rollback_to(&tx, tx.log_id(), savepoint).unwrap();
        assert_eq!(tx.status(), TxStatus::Open);
    }

    #[test]
    fn waiting_on_a_closed_transaction_returns_immediately() {
        let store = new_store();
        let tx = store.begin(100, 1).unwrap();
        let result = store.wait_for(&tx, 999).unwrap();
        assert!(result);
    }

    #[test]
    fn prepare_records_entry_and_commit_clears_it() {
        let store = new_store();
        let tx = store.begin(1000, 7).unwrap();
        store.prepare(&tx).unwrap();
        assert_eq!(tx.status(), TxStatus::Prepared);
        let entry = store.prepared_transaction(tx.slot_id).unwrap();
        assert_eq!(entry.owner_id, 7);
        store.commit(&tx).unwrap();
        assert!(store.prepared_transaction(tx.slot_id).is_none());
    }

    #[test]
    fn prepare_then_full_rollback_clears_entry() {
        let store = new_store();
        let tx = store.begin(1000, 3).unwrap();
        store.prepare(&tx).unwrap();
        store.rollback_to(&tx, 0, 0).unwrap();
        assert!(store.prepared_transaction(tx.slot_id).is_none());
    }
}
