//! Wraps a [`PersistentMap`] of [`Versioned`] values with ACID semantics:
//! read-your-writes, snapshot reads, and write-write conflict detection via
//! CAS against the base map.

use std::collections::BTreeMap;
use std::sync::Arc;

use pagemap::{PageCodec, PersistentMap};

use crate::error::{Result, TxnError};
use crate::operation_id::OperationId;
use crate::transaction::Transaction;
use crate::transaction_store::TransactionStore;
use crate::undo::UndoableMap;
use crate::versioned::Versioned;

pub struct TransactionalMap<K, V> {
    map_id: u32,
    base: PersistentMap<K, Versioned<V>>,
    store: Arc<TransactionStore>,
}

impl<K, V> TransactionalMap<K, V>
where
    K: Ord + Clone + PageCodec + 'static,
    V: Clone + PageCodec + 'static,
{
    pub fn new(map_id: u32, base: PersistentMap<K, Versioned<V>>, store: Arc<TransactionStore>) -> Arc<Self> {
        Arc::new(Self { map_id, base, store })
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn is_dirty(&self) -> bool {
        self.base.is_dirty()
    }

    pub fn to_page_bytes(&self) -> Vec<u8> {
        self.base.to_page_bytes()
    }

    pub fn mark_clean(&self) {
        self.base.mark_clean()
    }

    /// The value this transaction should see at `key`: its own
    /// uncommitted write if it owns the lock, the committed value if
    /// none is held, the pre-image from the other transaction's undo log
    /// if it's still in flight, or the new value if that other
    /// transaction is already committed/committing.
    pub fn get(&self, tx: &Transaction, key: &K) -> Option<V> {
        let vv = self.base.get(key)?;
        self.visible_value(tx, &vv)
    }

    fn visible_value(&self, tx: &Transaction, vv: &Versioned<V>) -> Option<V> {
        let Some(op_id) = vv.operation_id else {
            return vv.value.clone();
        };
        if op_id.slot == tx.slot_id {
            return vv.value.clone();
        }
        // Locked by another transaction. If it has already moved past
        // Open (committed or in the process of committing), its new
        // value applies; otherwise the pre-image in its undo log is what
        // every other snapshot must see.
        match self.store.status_of(op_id.slot) {
            Some(crate::status::TxStatus::Committed) | Some(crate::status::TxStatus::Committing) => {
                vv.value.clone()
            }
            _ => match self.store.undo_entry(op_id.slot, op_id.log_id) {
                Some(entry) => entry
                    .old_value
                    .and_then(|bytes| V::decode_from(&bytes).ok())
                    .map(|(v, _)| v),
                None => vv.value.clone(),
            },
        }
    }

    /// A snapshot of every key visible under `tx`, taken at the current
    /// moment and stable for the rest of this iterator's lifetime even as
    /// other transactions keep committing.
    pub fn snapshot(&self, tx: &Transaction) -> BTreeMap<K, V> {
        let raw = self.base.snapshot();
        let mut visible = BTreeMap::new();
        for (k, vv) in raw.iter() {
            if let Some(v) = self.visible_value(tx, vv) {
                visible.insert(k.clone(), v);
            }
        }
        visible
    }

    /// CAS-based write: reads the current versioned value, and either
    /// takes the lock (no one else holds it, or `tx` already does) or
    /// waits for the holder to finish, retrying after a successful wait.
    /// Fails with `WriteConflict` if the wait times out.
    pub fn put(&self, tx: &Transaction, key: K, value: Option<V>) -> Result<()> {
        loop {
            let current = self.base.get(&key);
            let (old_value, old_op_id, can_write) = match &current {
                None => (None, None, true),
                Some(vv) => match vv.operation_id {
                    None => (vv.value.clone(), None, true),
                    Some(op_id) if op_id.slot == tx.slot_id => (vv.value.clone(), Some(op_id), true),
                    Some(_) => (vv.value.clone(), vv.operation_id, false),
                },
            };

            if !can_write {
                let blocking_slot = old_op_id.expect("locked value always carries an op id").slot;
                let resolved = self.store.wait_for(tx, blocking_slot)?;
                if !resolved {
                    return Err(TxnError::WriteConflict);
                }
                continue;
            }

            let key_bytes = encode_key(&key);
            let old_value_bytes = old_value_for_log(&current);
            let undo_key = self
                .store
                .log(tx, self.map_id, key_bytes, old_value_bytes, old_op_id_for_log(&current))?;
            let new_op_id = OperationId {
                slot: tx.slot_id,
                log_id: undo_key.log_id,
            };
            self.base.apply([(key, Some(Versioned::uncommitted(value, new_op_id)))]);
            return Ok(());
        }
    }
}

fn encode_key<K: PageCodec>(key: &K) -> Vec<u8> {
    let mut out = Vec::new();
    key.encode_into(&mut out);
    out
}

fn old_value_for_log<V: PageCodec>(current: &Option<Versioned<V>>) -> Option<Vec<u8>> {
    current.as_ref().and_then(|vv| {
        vv.value.as_ref().map(|v| {
            let mut out = Vec::new();
            v.encode_into(&mut out);
            out
        })
    })
}

fn old_op_id_for_log<V>(current: &Option<Versioned<V>>) -> Option<OperationId> {
    current.as_ref().and_then(|vv| vv.operation_id)
}

impl<K, V> UndoableMap for TransactionalMap<K, V>
where
    K: Ord + Clone + PageCodec + 'static,
    V: Clone + PageCodec + 'static,
{
    fn map_id(&self) -> u32 {
        self.map_id
    }

    fn finalize_commit(&self, key: &[u8], op_id: OperationId) {
        let Ok((decoded_key, _)) = K::decode_from(key) else {
            return;
        };
        if let Some(vv) = self.base.get(&decoded_key) {
            if vv.operation_id == Some(op_id) {
                self.base.apply([(decoded_key, Some(vv.into_committed()))]);
            }
        }
    }

    fn rollback_entry(&self, key: &[u8], old_value: Option<Vec<u8>>, old_operation_id: Option<OperationId>) {
        let Ok((decoded_key, _)) = K::decode_from(key) else {
            return;
        };
        let old_value = old_value.and_then(|bytes| V::decode_from(&bytes).ok()).map(|(v, _)| v);
        let restored = Versioned {
            value: old_value,
            operation_id: old_operation_id,
        };
        self.base.apply([(decoded_key, Some(restored))]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::versioning::VersionTracker;

    fn new_store() -> Arc<TransactionStore> {
        Arc::new(TransactionStore::new(VersionTracker::new(0)))
    }

    #[test]
    fn read_your_own_write() {
        let store = new_store();
        let map = TransactionalMap::<String, String>::new(
            1,
            PersistentMap::empty(1),
            store.clone(),
        );
        store.register_map(map.clone());
        let tx = store.begin(1000, 1).unwrap();
        map.put(&tx, "a".to_string(), Some("1".to_string())).unwrap();
        assert_eq!(map.get(&tx, &"a".to_string()), Some("1".to_string()));
    }

    #[test]
    fn commit_makes_value_visible_to_fresh_transaction() {
        let store = new_store();
        let map = TransactionalMap::<String, String>::new(
            1,
            PersistentMap::empty(1),
            store.clone(),
        );
        store.register_map(map.clone());
        let t1 = store.begin(1000, 1).unwrap();
        map.put(&t1, "a".to_string(), Some("1".to_string())).unwrap();
        store.commit(&t1).unwrap();

        let t2 = store.begin(1000, 2).unwrap();
        assert_eq!(map.get(&t2, &"a".to_string()), Some("1".to_string()));
    }

    #[test]
    fn rollback_restores_previous_value() {
        let store = new_store();
        let map = TransactionalMap::<String, String>::new(
            1,
            PersistentMap::empty(1),
            store.clone(),
        );
        store.register_map(map.clone());

        let t1 = store.begin(1000, 1).unwrap();
        map.put(&t1, "a".to_string(), Some("1".to_string())).unwrap();
        store.commit(&t1).unwrap();

        let t2 = store.begin(1000, 2).unwrap();
        map.put(&t2, "a".to_string(), Some("2".to_string())).unwrap();
        store.rollback_to(&t2, t2.log_id(), 0).unwrap();

        let t3 = store.begin(1000, 3).unwrap();
        assert_eq!(map.get(&t3, &"a".to_string()), Some("1".to_string()));
    }
}
