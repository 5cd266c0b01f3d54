//! The top-level facade: opens a [`ChunkStore`], keeps a cache of the
//! [`TransactionalMap`]s built on top of it, and coordinates save so that
//! every dirty map's root lands in the same chunk's layout blob.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use storage::chunk_store::{ChunkStore, PendingPage, StoreConfig};
use storage::data_util;
use storage::page_ref::{page_on_disk_len, PageType};
use storage::versioning::VersionTracker;
use tracing::info;
use txn::{PreparedEntry, Transaction, TransactionStore, TransactionalMap};

use crate::error::Result;
use crate::options::parse_options;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

/// Every named map a caller opens is a `TransactionalMap<String, String>`.
/// Generic key/value types would need a type-erased registry entry per
/// concrete instantiation; for the scope this store covers, string keys and
/// values are what every caller needs, and `UndoableMap` dispatch in `txn`
/// is already type-erased at the `Arc<dyn UndoableMap>` boundary.
pub type Map = TransactionalMap<String, String>;

fn map_id_for(name: &str) -> u32 {
    // FNV-1a, truncated to 32 bits. Deterministic across opens so a map's
    // identity survives a restart without a separate name registry page.
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub struct Store {
    chunk_store: Arc<ChunkStore>,
    txn_store: Arc<TransactionStore>,
    maps: RwLock<HashMap<u32, Arc<Map>>>,
    save_guard: Mutex<()>,
}

impl Store {
    pub fn create(path: impl AsRef<Path>, options: &str) -> Result<Arc<Self>> {
        let config = parse_options(options, StoreConfig::default().block_size)?;
        let chunk_store = ChunkStore::create(path, config, now_ms())?;
        Self::wrap(chunk_store)
    }

    pub fn open(path: impl AsRef<Path>, options: &str) -> Result<Arc<Self>> {
        let config = parse_options(options, StoreConfig::default().block_size)?;
        let chunk_store = ChunkStore::open(path, config)?;
        Self::wrap(chunk_store)
    }

    fn wrap(chunk_store: ChunkStore) -> Result<Arc<Self>> {
        let versions = chunk_store.versions().clone();
        let txn_store = TransactionStore::load(versions, &chunk_store)?;
        Ok(Arc::new(Self {
            chunk_store: Arc::new(chunk_store),
            txn_store: Arc::new(txn_store),
            maps: RwLock::new(HashMap::new()),
            save_guard: Mutex::new(()),
        }))
    }

    pub fn versions(&self) -> &VersionTracker {
        self.chunk_store.versions()
    }

    /// Opens (loading from its last saved root, if any) or returns the
    /// cached handle for the map named `name`.
    pub fn open_map(&self, name: &str) -> Result<Arc<Map>> {
        let map_id = map_id_for(name);
        if let Some(existing) = self.maps.read().get(&map_id) {
            return Ok(existing.clone());
        }
        let root_ref = self.chunk_store.layout_root(map_id)?;
        let base = pagemap::PersistentMap::load(map_id, &self.chunk_store, root_ref)?;
        let map = TransactionalMap::new(map_id, base, self.txn_store.clone());
        self.txn_store.register_map(map.clone());
        self.maps.write().insert(map_id, map.clone());
        info!(name, map_id, "map opened");
        Ok(map)
    }

    pub fn begin(&self, timeout_ms: u64, owner_id: u64) -> Result<Arc<Transaction>> {
        Ok(self.txn_store.begin(timeout_ms, owner_id)?)
    }

    pub fn commit(&self, tx: &Transaction) -> Result<()> {
        Ok(self.txn_store.commit(tx)?)
    }

    /// Marks `tx` prepared for two-phase commit; a coordinator that crashes
    /// before following up with `commit`/`rollback` can still find it again
    /// via [`Store::prepared_transaction`] after reopening the store.
    pub fn prepare(&self, tx: &Transaction) -> Result<()> {
        Ok(self.txn_store.prepare(tx)?)
    }

    pub fn prepared_transaction(&self, slot_id: u16) -> Option<PreparedEntry> {
        self.txn_store.prepared_transaction(slot_id)
    }

    pub fn rollback(&self, tx: &Transaction, from_log_id: u64, to_log_id: u64) -> Result<()> {
        Ok(self.txn_store.rollback_to(tx, from_log_id, to_log_id)?)
    }

    /// Serializes every dirty map's current snapshot into one new chunk and
    /// publishes each map's new root. A no-op if nothing is dirty. Callers
    /// drive this directly, or on whatever `autoCommitBufferKB`-style
    /// policy they implement on top.
    pub fn save(&self) -> Result<Option<u32>> {
        let _guard = self.save_guard.lock();
        let maps = self.maps.read();
        let dirty: Vec<Arc<Map>> = maps.values().filter(|m| m.is_dirty()).cloned().collect();
        drop(maps);

        let system_pages = self.txn_store.system_maps_to_save();
        if dirty.is_empty() && system_pages.is_empty() {
            return Ok(None);
        }

        let mut entries: Vec<(u32, PageType, Vec<u8>)> = dirty
            .iter()
            .map(|m| (m.map_id(), PageType::Layout, m.to_page_bytes()))
            .collect();
        entries.extend(system_pages);

        let predicted_chunk_id = self.chunk_store.peek_next_chunk_id();
        let mut predicted_offset = 0u32;
        let mut root_updates = Vec::with_capacity(entries.len());
        for (map_id, _page_type, bytes) in &entries {
            let packed = pagemap::pack_root_reference(predicted_chunk_id, predicted_offset, bytes.len());
            root_updates.push((
                format!("root.{}", data_util::hex_u64(*map_id as u64)),
                data_util::hex_u64(packed),
            ));
            predicted_offset += page_on_disk_len(bytes.len()) as u32;
        }

        let pages: Vec<PendingPage> = entries
            .into_iter()
            .map(|(map_id, page_type, bytes)| PendingPage {
                map_id,
                page_type,
                bytes,
            })
            .collect();
        let page_count = pages.len();

        let (chunk_id, _offsets) = self.chunk_store.save(pages, root_updates, now_ms())?;
        debug_assert_eq!(chunk_id, predicted_chunk_id, "save ran concurrently with another save");
        for map in &dirty {
            map.mark_clean();
        }
        self.txn_store.mark_system_maps_clean();
        info!(chunk_id, maps = dirty.len(), pages = page_count, "store saved");
        Ok(Some(chunk_id))
    }

    pub fn collect_garbage(&self) -> Result<Vec<u32>> {
        Ok(self.chunk_store.collect_garbage(now_ms())?)
    }

    pub fn fill_rate(&self) -> u32 {
        self.chunk_store.fill_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_commit_save_and_reopen_round_trips_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = Store::create(&path, "").unwrap();
            let map = store.open_map("widgets").unwrap();
            let tx = store.begin(1000, 1).unwrap();
            map.put(&tx, "a".to_string(), Some("1".to_string())).unwrap();
            store.commit(&tx).unwrap();
            store.save().unwrap().expect("a dirty map should produce a chunk");
        }

        let store = Store::open(&path, "").unwrap();
        let map = store.open_map("widgets").unwrap();
        let tx = store.begin(1000, 2).unwrap();
        assert_eq!(map.get(&tx, &"a".to_string()), Some("1".to_string()));
    }

    #[test]
    fn save_with_no_dirty_maps_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(dir.path().join("store.db"), "").unwrap();
        assert_eq!(store.save().unwrap(), None);
    }

    #[test]
    fn read_only_option_forbids_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = Store::create(&path, "").unwrap();
            let map = store.open_map("widgets").unwrap();
            let tx = store.begin(1000, 1).unwrap();
            map.put(&tx, "a".to_string(), Some("1".to_string())).unwrap();
            store.commit(&tx).unwrap();
            store.save().unwrap();
        }

        let store = Store::open(&path, "readOnly:true").unwrap();
        let map = store.open_map("widgets").unwrap();
        let tx = store.begin(1000, 2).unwrap();
        map.put(&tx, "b".to_string(), Some("2".to_string())).unwrap();
        store.commit(&tx).unwrap();
        assert!(store.save().is_err());
    }

    #[test]
    fn prepared_transaction_survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let slot_id;

        {
            let store = Store::create(&path, "").unwrap();
            let map = store.open_map("widgets").unwrap();
            let tx = store.begin(1000, 9).unwrap();
            map.put(&tx, "a".to_string(), Some("1".to_string())).unwrap();
            store.prepare(&tx).unwrap();
            slot_id = tx.slot_id;
            store.save().unwrap().expect("a prepared transaction should dirty the prepared map");
        }

        let store = Store::open(&path, "").unwrap();
        let recovered = store
            .prepared_transaction(slot_id)
            .expect("prepared entry should survive a reopen");
        assert_eq!(recovered.owner_id, 9);
    }
}
