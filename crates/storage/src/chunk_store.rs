//! Chunk lifecycle, layout-map maintenance, crash recovery and compaction
//! bookkeeping.
//!
//! `ChunkStore` owns the free-space map, the chunk table, and the
//! in-memory layout map. It does not know what a page's bytes *mean* — the
//! map layer above it (out of scope for this crate) decides which pages
//! are live and drives compaction by re-saving them; `ChunkStore` only
//! tracks accounting and picks candidates.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::block_io::FileStore;
use crate::chunk::{Chunk, FOOTER_LEN, HEADER_MAX_LEN};
use crate::data_util::{self, KvMap};
use crate::error::{Result, StorageError};
use crate::free_space::{FreeSpaceMap, RESERVED_TO_END};
use crate::page_ref::{self, PageReference, PageType};
use crate::versioning::VersionTracker;

/// Options consumed at open, mirroring the external configuration surface.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub block_size: u64,
    pub read_only: bool,
    pub auto_commit_buffer_kb: u32,
    pub retention_time_ms: u64,
    pub max_file_count: u32,
    pub compress: u8,
    pub page_split_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            read_only: false,
            auto_commit_buffer_kb: 1024,
            retention_time_ms: 45_000,
            max_file_count: 16,
            compress: 0,
            page_split_size: 4 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct StoreHeader {
    format: u64,
    created: u64,
    block_size: u64,
}

impl StoreHeader {
    fn encode(&self) -> Vec<u8> {
        let mut map = KvMap::new();
        map.insert("H".into(), data_util::quote_str("vaultstore"));
        map.insert("format".into(), data_util::hex_u64(self.format));
        map.insert("created".into(), data_util::hex_u64(self.created));
        map.insert("blockSize".into(), data_util::hex_u64(self.block_size));
        let body = data_util::encode_map(&map);
        let checksum = data_util::get_fletcher32(body.as_bytes(), 0, body.len());
        let line = format!("{body},fletcher:{}", data_util::hex_u64(checksum as u64));
        line.into_bytes()
    }

    fn decode(buf: &[u8], block_size: u64) -> Result<Self> {
        let newline = buf
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(buf.len());
        let line = std::str::from_utf8(&buf[..newline])
            .map_err(|_| StorageError::Corrupt("store header is not valid utf-8".into()))?
            .trim_end();
        let (body, checksum_field) = line
            .rsplit_once(",fletcher:")
            .ok_or_else(|| StorageError::Corrupt("store header missing checksum".into()))?;
        let expected = data_util::parse_hex_u64(checksum_field)? as u32;
        let actual = data_util::get_fletcher32(body.as_bytes(), 0, body.len());
        if expected != actual {
            return Err(StorageError::Corrupt(
                "store header checksum mismatch".into(),
            ));
        }
        let map = data_util::decode_map(body)?;
        let format = match map.get("format") {
            Some(v) => data_util::parse_hex_u64(v)?,
            None => 1,
        };
        let created = match map.get("created") {
            Some(v) => data_util::parse_hex_u64(v)?,
            None => 0,
        };
        let header_block_size = match map.get("blockSize") {
            Some(v) => data_util::parse_hex_u64(v)?,
            None => block_size,
        };
        Ok(Self {
            format,
            created,
            block_size: header_block_size,
        })
    }
}

/// One page to be written in a save, along with which map it belongs to.
pub struct PendingPage {
    pub map_id: u32,
    pub page_type: PageType,
    pub bytes: Vec<u8>,
}

struct TocEntry {
    map_id: u32,
    offset: u32,
    page_type: PageType,
}

impl TocEntry {
    fn pack(&self) -> u64 {
        let mut bits = (self.map_id as u64) << 32;
        bits |= (self.offset as u64) << 8;
        bits |= self.page_type as u64;
        bits
    }
}

pub struct ChunkStore {
    file: FileStore,
    config: StoreConfig,
    header: StoreHeader,
    chunks: RwLock<HashMap<u32, Chunk>>,
    layout: Mutex<KvMap>,
    free_space: Mutex<FreeSpaceMap>,
    versions: VersionTracker,
    save_lock: Mutex<()>,
    next_chunk_id: AtomicU32,
}

impl ChunkStore {
    /// Creates a brand-new store: writes block 0 and nothing else.
    pub fn create(path: impl AsRef<Path>, config: StoreConfig, now_ms: u64) -> Result<Self> {
        let mut file = FileStore::open(path, false)?;
        file.acquire_lock()?;
        let header = StoreHeader {
            format: 1,
            created: now_ms,
            block_size: config.block_size,
        };
        let mut block0 = vec![0u8; config.block_size as usize];
        let encoded = header.encode();
        block0[..encoded.len()].copy_from_slice(&encoded);
        file.write_fully(0, &block0)?;
        file.sync()?;
        let mut free_space = FreeSpaceMap::new(config.block_size);
        free_space.mark_used(0, config.block_size)?;
        Ok(Self {
            file,
            config,
            header,
            chunks: RwLock::new(HashMap::new()),
            layout: Mutex::new(KvMap::new()),
            free_space: Mutex::new(free_space),
            versions: VersionTracker::new(0),
            save_lock: Mutex::new(()),
            next_chunk_id: AtomicU32::new(1),
        })
    }

    /// Opens an existing store: validates block 0, discovers the last
    /// valid chunk by scanning backward, and loads the layout map it
    /// references.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let mut file = FileStore::open(&path, config.read_only)?;
        file.acquire_lock()?;

        let block0 = file.read_fully(0, config.block_size as usize)?;
        let header = StoreHeader::decode(&block0, config.block_size)?;

        let file_size = file.size()?;
        let mut free_space = FreeSpaceMap::new(header.block_size);
        free_space.mark_used(0, header.block_size)?;

        let last_chunk = Self::discover_last_chunk(&file, header.block_size, file_size)?;

        let mut chunks = HashMap::new();
        let mut layout = KvMap::new();
        let mut next_chunk_id = 1u32;
        let mut current_version = 0u64;

        if let Some(chunk) = last_chunk {
            let pos = chunk.block * header.block_size;
            free_space.mark_used(pos, chunk.len)?;
            next_chunk_id = chunk.id + 1;
            current_version = chunk.version;
            if chunk.layout_root_pos > 0 {
                layout = Self::load_layout_blob(&file, chunk.layout_root_pos)?;
            }
            chunks.insert(chunk.id, chunk);

            for (key, value) in layout.iter() {
                if let Some(hex_id) = key.strip_prefix("chunk.") {
                    let id = data_util::parse_hex_u64(hex_id)? as u32;
                    if chunks.contains_key(&id) {
                        continue;
                    }
                    let referenced = Chunk::read_header(format!("{value}\n").as_bytes(), 0)?;
                    if referenced.block != crate::chunk::UNSAVED {
                        free_space.mark_used(
                            referenced.block * header.block_size,
                            referenced.len,
                        )?;
                    }
                    if !referenced.is_live() {
                        debug!(chunk_id = id, "registered dead chunk from layout map");
                    }
                    chunks.insert(id, referenced);
                }
            }
        }

        Ok(Self {
            file,
            config,
            header,
            chunks: RwLock::new(chunks),
            layout: Mutex::new(layout),
            free_space: Mutex::new(free_space),
            versions: VersionTracker::new(current_version),
            save_lock: Mutex::new(()),
            next_chunk_id: AtomicU32::new(next_chunk_id),
        })
    }

    fn discover_last_chunk(file: &FileStore, block_size: u64, file_size: u64) -> Result<Option<Chunk>> {
        if file_size <= block_size {
            return Ok(None);
        }
        let mut end_candidate = file_size - (file_size % block_size);
        while end_candidate > block_size + FOOTER_LEN as u64 {
            let footer_pos = end_candidate - FOOTER_LEN as u64;
            let Ok(footer) = file.read_fully(footer_pos, FOOTER_LEN) else {
                end_candidate -= block_size;
                continue;
            };
            // A footer region is all-zero padding unless it genuinely ends a chunk here.
            if footer.iter().all(|&b| b == 0) {
                end_candidate -= block_size;
                continue;
            }
            match Self::try_validate_chunk_ending_at(file, block_size, end_candidate) {
                Ok(Some(chunk)) => return Ok(Some(chunk)),
                _ => {
                    end_candidate -= block_size;
                    continue;
                }
            }
        }
        warn!("no valid chunk footer found during recovery scan");
        Ok(None)
    }

    fn try_validate_chunk_ending_at(
        file: &FileStore,
        block_size: u64,
        end_pos: u64,
    ) -> Result<Option<Chunk>> {
        let footer_pos = end_pos - FOOTER_LEN as u64;
        let footer = file.read_fully(footer_pos, FOOTER_LEN)?;
        let line = std::str::from_utf8(&footer)
            .map_err(|_| StorageError::Corrupt("footer not utf-8".into()))?
            .trim_end();
        let footer_fields = data_util::decode_map(line)?;
        let id = data_util::parse_hex_u64(
            footer_fields
                .get("chunk")
                .ok_or_else(|| StorageError::Corrupt("footer missing chunk id".into()))?,
        )? as u32;
        let block = data_util::parse_hex_u64(
            footer_fields
                .get("block")
                .ok_or_else(|| StorageError::Corrupt("footer missing block".into()))?,
        )?;
        let header_pos = block * block_size;
        if header_pos >= footer_pos {
            return Ok(None);
        }
        let header_region_len = (footer_pos - header_pos) as usize;
        let header_buf = file.read_fully(header_pos, HEADER_MAX_LEN.min(header_region_len))?;
        let chunk = Chunk::read_header(&header_buf, 0)?;
        if chunk.id != id {
            return Ok(None);
        }
        let full_chunk_len = (footer_pos + FOOTER_LEN as u64 - header_pos) as usize;
        let whole = file.read_fully(header_pos, full_chunk_len)?;
        let preceding = &whole[..whole.len() - FOOTER_LEN];
        chunk.verify_footer(&footer, preceding)?;
        Ok(Some(chunk))
    }

    fn load_layout_blob(file: &FileStore, pos: u64) -> Result<KvMap> {
        let len_prefix = file.read_fully(pos, 4)?;
        let len = u32::from_le_bytes(len_prefix.try_into().unwrap()) as usize;
        let body = file.read_fully(pos + 4, len)?;
        let text = std::str::from_utf8(&body)
            .map_err(|_| StorageError::Corrupt("layout map blob is not utf-8".into()))?;
        data_util::decode_map(text)
    }

    pub fn current_version(&self) -> u64 {
        self.versions.current_version()
    }

    /// The id the next call to [`ChunkStore::save`] will assign, without
    /// reserving it. Only safe to rely on under external single-writer
    /// discipline (the map layer's own save coordination) — two overlapping
    /// callers would both see the same value.
    pub fn peek_next_chunk_id(&self) -> u32 {
        self.next_chunk_id.load(Ordering::Acquire)
    }

    pub fn versions(&self) -> &VersionTracker {
        &self.versions
    }

    /// Flushes `pages` into one new chunk, updates the layout map with
    /// `root_updates`, and publishes the new version. Mirrors the append
    /// path: serialize pages, append TOC, header, footer; allocate;
    /// write; update layout; bump version.
    pub fn save(
        &self,
        pages: Vec<PendingPage>,
        root_updates: impl IntoIterator<Item = (String, String)>,
        now_ms: u64,
    ) -> Result<(u32, Vec<u32>)> {
        if self.config.read_only {
            return Err(StorageError::ReadOnly);
        }
        let _guard = self.save_lock.lock();

        let chunk_id = self.next_chunk_id.fetch_add(1, Ordering::AcqRel);
        let next_version = self.versions.current_version() + 1;

        let mut buffer = Vec::new();
        let mut toc = Vec::with_capacity(pages.len());
        let mut offsets = Vec::with_capacity(pages.len());
        let mut max_len = 0u64;
        for page in &pages {
            let offset = buffer.len() as u32;
            offsets.push(offset);
            if page_ref::is_large_class(page.bytes.len()) {
                buffer.extend_from_slice(&(page.bytes.len() as u32).to_le_bytes());
            }
            buffer.extend_from_slice(&page.bytes);
            max_len += page.bytes.len() as u64;
            toc.push(TocEntry {
                map_id: page.map_id,
                offset,
                page_type: page.page_type,
            });
        }
        let toc_pos = buffer.len() as u64;
        for entry in &toc {
            buffer.extend_from_slice(&entry.pack().to_le_bytes());
        }

        let mut layout = self.layout.lock();
        for (key, value) in root_updates {
            layout.insert(key, value);
        }
        let layout_blob = data_util::encode_map(&layout);
        let layout_root_pos = buffer.len() as u64;
        buffer.extend_from_slice(&(layout_blob.len() as u32).to_le_bytes());
        buffer.extend_from_slice(layout_blob.as_bytes());

        let mut chunk = Chunk::new(chunk_id, next_version, now_ms);
        chunk.page_count = pages.len() as u32;
        chunk.page_count_live = pages.len() as u32;
        chunk.max_len = max_len;
        chunk.max_len_live = max_len;
        chunk.toc_pos = toc_pos;
        chunk.layout_root_pos = layout_root_pos;

        let min_header_len = HEADER_MAX_LEN.min(256);
        let header_bytes = chunk.write_header(min_header_len)?;

        let total_len = (header_bytes.len() + buffer.len() + FOOTER_LEN) as u64;
        let reserved_high = RESERVED_TO_END;
        let pos = {
            let mut free_space = self.free_space.lock();
            free_space.allocate(total_len, 0, reserved_high)
        };
        chunk.block = pos / self.header.block_size;
        chunk.len = total_len.div_ceil(self.header.block_size) * self.header.block_size;

        // Header embeds `block`, so re-render now that allocation picked a position.
        let header_bytes = chunk.write_header(min_header_len)?;
        let mut whole = header_bytes;
        whole.extend_from_slice(&buffer);
        let footer = chunk.write_footer(&whole);
        whole.extend_from_slice(&footer);

        self.file.write_fully(pos, &whole)?;
        self.file.sync()?;

        layout.insert(
            format!("chunk.{}", data_util::hex_u64(chunk_id as u64)),
            data_util::encode_map(&chunk.to_header_map()),
        );

        self.chunks.write().insert(chunk_id, chunk);
        self.versions.bump_version();

        info!(chunk_id, version = next_version, "chunk saved");
        Ok((chunk_id, offsets))
    }

    /// Looks up `root.<hex map_id>` in the layout map, if this map has
    /// ever been saved.
    pub fn layout_root(&self, map_id: u32) -> Result<Option<u64>> {
        let layout = self.layout.lock();
        match layout.get(&format!("root.{}", data_util::hex_u64(map_id as u64))) {
            Some(v) => Ok(Some(data_util::parse_hex_u64(v)?)),
            None => Ok(None),
        }
    }

    /// Resolves a packed page reference to bytes, retrying if the owning
    /// chunk was relocated by a concurrent compaction between decoding the
    /// reference and performing the read.
    pub fn read_page(&self, packed: u64) -> Result<Vec<u8>> {
        let reference = PageReference::unpack(packed)?;
        loop {
            let block_before = self.chunk_block(reference.chunk_id)?;
            let file_pos = block_before * self.header.block_size + reference.offset as u64;
            let (read_pos, read_len) = if reference.is_large() {
                (file_pos + 4, self.read_large_len(file_pos)? as usize)
            } else {
                (file_pos, decode_class_len(reference.length_class))
            };
            let bytes = self.file.read_fully(read_pos, read_len)?;
            let block_after = self.chunk_block(reference.chunk_id)?;
            if block_before == block_after {
                return Ok(bytes);
            }
        }
    }

    fn read_large_len(&self, pos: u64) -> Result<u32> {
        let prefix = self.file.read_fully(pos, 4)?;
        Ok(u32::from_le_bytes(prefix.try_into().unwrap()))
    }

    fn chunk_block(&self, chunk_id: u32) -> Result<u64> {
        self.chunks
            .read()
            .get(&chunk_id)
            .map(|c| c.block)
            .ok_or_else(|| StorageError::Corrupt(format!("no such chunk {chunk_id}")))
    }

    /// Called by the map layer once a page in `chunk_id` has been
    /// superseded by a newer write. Transitions the chunk to Saved & Dead
    /// once its last live page is gone.
    pub fn record_page_superseded(&self, chunk_id: u32, byte_len: u64, now_ms: u64) -> Result<()> {
        let mut chunks = self.chunks.write();
        let chunk = chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| StorageError::Corrupt(format!("no such chunk {chunk_id}")))?;
        chunk.page_count_live = chunk.page_count_live.saturating_sub(1);
        chunk.max_len_live = chunk.max_len_live.saturating_sub(byte_len);
        if chunk.page_count_live == 0 {
            chunk.mark_unused(self.versions.current_version(), now_ms);
        }
        chunk.check_invariants()
    }

    /// Rewritable, non-pinned chunks with at least one dead page, ordered
    /// by ascending fill ratio (`max_len_live / max_len`) so the emptiest
    /// chunks are evacuated first.
    pub fn pick_compaction_candidates(&self) -> Vec<u32> {
        let chunks = self.chunks.read();
        let mut candidates: Vec<(u32, u64, u64)> = chunks
            .values()
            .filter(|c| c.is_evacuable())
            .map(|c| (c.id, c.max_len_live, c.max_len.max(1)))
            .collect();
        candidates.sort_by(|a, b| (a.1 * b.2).cmp(&(b.1 * a.2)));
        candidates.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Frees the blocks of any Saved & Dead chunk whose retention window
    /// has elapsed and that no live snapshot still depends on. Returns the
    /// ids collected. Running this twice with no intervening saves is a
    /// no-op, since a chunk removed from the table the first time is no
    /// longer a candidate the second time.
    pub fn collect_garbage(&self, now_ms: u64) -> Result<Vec<u32>> {
        let _guard = self.save_lock.lock();
        let mut collected = Vec::new();
        let mut chunks = self.chunks.write();
        let mut free_space = self.free_space.lock();
        let mut layout = self.layout.lock();

        let dead_ids: Vec<u32> = chunks
            .values()
            .filter(|c| {
                c.is_saved()
                    && !c.is_live()
                    && c.unused != 0
                    && now_ms.saturating_sub(c.unused) >= self.config.retention_time_ms
                    && self.versions.is_collectable(c.unused_at_version)
            })
            .map(|c| c.id)
            .collect();

        for id in dead_ids {
            if let Some(chunk) = chunks.remove(&id) {
                free_space.free(chunk.block * self.header.block_size, chunk.len)?;
                layout.remove(&format!("chunk.{}", data_util::hex_u64(id as u64)));
                collected.push(id);
            }
        }
        Ok(collected)
    }

    pub fn chunk(&self, chunk_id: u32) -> Option<Chunk> {
        self.chunks.read().get(&chunk_id).cloned()
    }

    pub fn fill_rate(&self) -> u32 {
        self.free_space.lock().fill_rate()
    }
}

fn decode_class_len(length_class: u8) -> usize {
    const BASE: usize = 32;
    if length_class == 0 {
        BASE
    } else {
        BASE << length_class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_fresh(dir: &tempfile::TempDir) -> ChunkStore {
        let path = dir.path().join("store.db");
        ChunkStore::create(&path, StoreConfig::default(), 1_000).unwrap()
    }

    #[test]
    fn save_then_read_round_trips_a_page() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_fresh(&dir);
        let page_bytes = b"hello page".to_vec();
        let (chunk_id, _offsets) = store
            .save(
                vec![PendingPage {
                    map_id: 1,
                    page_type: PageType::Leaf,
                    bytes: page_bytes.clone(),
                }],
                [("root.1".to_string(), "ref".to_string())],
                2_000,
            )
            .unwrap();

        let reference = PageReference::new(PageType::Leaf, chunk_id, 0, page_bytes.len());
        let read_back = store.read_page(reference.pack()).unwrap();
        assert_eq!(read_back, page_bytes);
    }

    #[test]
    fn superseding_all_pages_marks_chunk_dead() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_fresh(&dir);
        let (chunk_id, _offsets) = store
            .save(
                vec![PendingPage {
                    map_id: 1,
                    page_type: PageType::Leaf,
                    bytes: b"x".to_vec(),
                }],
                [],
                2_000,
            )
            .unwrap();
        store.record_page_superseded(chunk_id, 1, 3_000).unwrap();
        let chunk = store.chunk(chunk_id).unwrap();
        assert!(!chunk.is_live());
        assert_eq!(chunk.unused, 3_000);
    }

    #[test]
    fn garbage_collection_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_fresh(&dir);
        let (chunk_id, _offsets) = store
            .save(
                vec![PendingPage {
                    map_id: 1,
                    page_type: PageType::Leaf,
                    bytes: b"x".to_vec(),
                }],
                [],
                2_000,
            )
            .unwrap();
        store.record_page_superseded(chunk_id, 1, 3_000).unwrap();

        let far_future = 3_000 + 60_000;
        let first = store.collect_garbage(far_future).unwrap();
        assert_eq!(first, vec![chunk_id]);
        let second = store.collect_garbage(far_future).unwrap();
        assert!(second.is_empty());
    }
}

#[cfg(test)]
mod save_read_proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Sizes range well past LARGE_CLASS's threshold so this exercises both
        // the bucketed and length-prefixed encodings save()/read_page() use.
        #[test]
        fn save_then_read_round_trips_pages_of_any_size(byte_len in 1usize..6000) {
            let dir = tempfile::tempdir().unwrap();
            let store = ChunkStore::create(dir.path().join("store.db"), StoreConfig::default(), 1_000).unwrap();
            let bytes: Vec<u8> = (0..byte_len).map(|i| (i % 256) as u8).collect();
            let (chunk_id, _offsets) = store
                .save(
                    vec![PendingPage {
                        map_id: 1,
                        page_type: PageType::Leaf,
                        bytes: bytes.clone(),
                    }],
                    [],
                    2_000,
                )
                .unwrap();
            let reference = PageReference::new(PageType::Leaf, chunk_id, 0, bytes.len());
            let read_back = store.read_page(reference.pack()).unwrap();
            prop_assert_eq!(read_back, bytes);
        }
    }
}
