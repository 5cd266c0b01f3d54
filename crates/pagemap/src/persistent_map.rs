//! A persistent, versioned key-value map built directly on the storage
//! core's page interface, without a real B-tree's node splitting — the
//! whole map is (de)serialized as a single page per save. That's a
//! deliberate simplification: concrete B-tree/page traversal is treated as
//! an external collaborator upstream of this crate, so there is nothing
//! here keying off page size or forcing node splits. What's preserved is
//! the contract a map abstraction must honor: `read_page`/`write_page`
//! addressing, stable snapshots for iteration, and copy-on-write commits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use storage::chunk_store::ChunkStore;
use storage::page_ref::{PageReference, PageType};

use crate::codec::PageCodec;
use crate::error::Result;

/// A map identified by its `map_id`, whose current root is a page
/// reference recorded in the layout map under `root.<hex map_id>`.
pub struct PersistentMap<K, V> {
    map_id: u32,
    snapshot: RwLock<Arc<BTreeMap<K, V>>>,
    dirty: AtomicBool,
}

impl<K, V> PersistentMap<K, V>
where
    K: Ord + Clone + PageCodec,
    V: Clone + PageCodec,
{
    pub fn empty(map_id: u32) -> Self {
        Self {
            map_id,
            snapshot: RwLock::new(Arc::new(BTreeMap::new())),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    /// Loads a map's full contents from its root page, or starts empty if
    /// the map has never been saved (`root_ref` is `None`).
    pub fn load(map_id: u32, store: &ChunkStore, root_ref: Option<u64>) -> Result<Self> {
        let Some(packed) = root_ref else {
            return Ok(Self::empty(map_id));
        };
        let bytes = store.read_page(packed)?;
        let map = Self::decode(&bytes)?;
        Ok(Self {
            map_id,
            snapshot: RwLock::new(Arc::new(map)),
            dirty: AtomicBool::new(false),
        })
    }

    /// A stable view for iteration: cloning the `Arc` is O(1) and the
    /// contents will never mutate underneath the caller, even if the map
    /// is written to again immediately after.
    pub fn snapshot(&self) -> Arc<BTreeMap<K, V>> {
        self.snapshot.read().clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot.read().get(key).cloned()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Applies a batch of writes as one copy-on-write commit: `None`
    /// removes a key, `Some(v)` inserts/overwrites it. Readers holding an
    /// older snapshot are unaffected.
    pub fn apply(&self, writes: impl IntoIterator<Item = (K, Option<V>)>) {
        let mut next = (**self.snapshot.read()).clone();
        let mut changed = false;
        for (key, value) in writes {
            changed = true;
            match value {
                Some(v) => {
                    next.insert(key, v);
                }
                None => {
                    next.remove(&key);
                }
            }
        }
        if changed {
            *self.snapshot.write() = Arc::new(next);
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Serializes the current snapshot for inclusion in a save. The
    /// coordinator (not this type) decides which chunk this lands in and
    /// what page type/offset it gets.
    pub fn to_page_bytes(&self) -> Vec<u8> {
        let snapshot = self.snapshot.read();
        Self::encode(&snapshot)
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    fn encode(map: &BTreeMap<K, V>) -> Vec<u8> {
        let mut out = Vec::new();
        (map.len() as u32).encode_into(&mut out);
        for (k, v) in map.iter() {
            k.encode_into(&mut out);
            v.encode_into(&mut out);
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<BTreeMap<K, V>> {
        let (count, mut pos) = u32::decode_from(bytes)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let (key, used) = K::decode_from(&bytes[pos..])?;
            pos += used;
            let (value, used) = V::decode_from(&bytes[pos..])?;
            pos += used;
            map.insert(key, value);
        }
        Ok(map)
    }
}

/// Packs a reference to a freshly saved map root, given where the
/// coordinator placed its serialized bytes.
pub fn pack_root_reference(chunk_id: u32, offset: u32, byte_len: usize) -> u64 {
    PageReference::new(PageType::Layout, chunk_id, offset, byte_len).pack()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_then_encode_decode_round_trips() {
        let map: PersistentMap<String, String> = PersistentMap::empty(1);
        map.apply([
            ("a".to_string(), Some("1".to_string())),
            ("b".to_string(), Some("2".to_string())),
        ]);
        let bytes = map.to_page_bytes();
        let decoded = PersistentMap::<String, String>::decode(&bytes).unwrap();
        assert_eq!(decoded.get("a").unwrap(), "1");
        assert_eq!(decoded.get("b").unwrap(), "2");
    }

    #[test]
    fn removal_drops_key() {
        let map: PersistentMap<String, String> = PersistentMap::empty(1);
        map.apply([("a".to_string(), Some("1".to_string()))]);
        map.apply([("a".to_string(), None)]);
        assert!(map.get(&"a".to_string()).is_none());
    }

    #[test]
    fn snapshot_is_stable_across_later_writes() {
        let map: PersistentMap<String, String> = PersistentMap::empty(1);
        map.apply([("a".to_string(), Some("1".to_string()))]);
        let snap = map.snapshot();
        map.apply([("a".to_string(), Some("2".to_string()))]);
        assert_eq!(snap.get("a").unwrap(), "1");
        assert_eq!(map.get(&"a".to_string()).unwrap(), "2");
    }

    #[test]
    fn empty_map_starts_clean_and_apply_marks_dirty() {
        let map: PersistentMap<String, String> = PersistentMap::empty(1);
        assert!(!map.is_dirty());
        map.apply([("a".to_string(), Some("1".to_string()))]);
        assert!(map.is_dirty());
        map.mark_clean();
        assert!(!map.is_dirty());
    }
}
