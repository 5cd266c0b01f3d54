//! Bit set over block indices: bit `i` set means block `i` is occupied.
//!
//! Allocation is first-fit. A 4-bit sliding `failure_flags` register tracks
//! whether recent allocations had to skip past the highest used block
//! because no hole was large enough, which [`FreeSpaceMap::is_fragmented`]
//! turns into a coarse fragmentation signal for the compaction picker.

use bitvec::prelude::*;

use crate::error::{Result, StorageError};

pub const RESERVED_TO_END: u64 = u64::MAX;

#[derive(Debug)]
pub struct FreeSpaceMap {
    used: BitVec<u64, Lsb0>,
    block_size: u64,
    failure_flags: u8,
}

impl FreeSpaceMap {
    pub fn new(block_size: u64) -> Self {
        Self {
            used: BitVec::new(),
            block_size,
            failure_flags: 0,
        }
    }

    fn blocks_for(&self, byte_len: u64) -> u64 {
        byte_len.div_ceil(self.block_size)
    }

    fn ensure_len(&mut self, blocks: u64) {
        if (blocks as usize) > self.used.len() {
            self.used.resize(blocks as usize, false);
        }
    }

    fn last_used_block(&self) -> Option<u64> {
        self.used.iter().rposition(|b| *b).map(|i| i as u64)
    }

    /// First-fit scan for a clear run of `blocks` blocks that does not
    /// overlap `[reserved_low, reserved_high)`. `reserved_high ==
    /// RESERVED_TO_END` means "reserved through end of file".
    fn scan(&self, blocks: u64, reserved_low: u64, reserved_high: u64) -> u64 {
        let mut candidate = 0u64;
        loop {
            let window_end = candidate + blocks;
            let overlaps_reserved = candidate < reserved_high && window_end > reserved_low;
            if overlaps_reserved {
                candidate = reserved_high;
                continue;
            }
            let clear = (candidate..window_end).all(|b| {
                (b as usize) >= self.used.len() || !self.used[b as usize]
            });
            if clear {
                return candidate;
            }
            candidate += 1;
        }
    }

    fn update_failure_flags(&mut self, start_block: u64) {
        let fell_past_last_used = match self.last_used_block() {
            Some(last) => start_block > last + 1,
            None => false,
        };
        self.failure_flags = (self.failure_flags << 1) | (fell_past_last_used as u8);
    }

    /// `reserved_low`/`reserved_high` are byte positions; `RESERVED_TO_END`
    /// in `reserved_high` protects everything past `reserved_low`.
    fn reserved_blocks(&self, reserved_low: u64, reserved_high: u64) -> (u64, u64) {
        let low = reserved_low / self.block_size;
        let high = if reserved_high == RESERVED_TO_END {
            u64::MAX
        } else {
            reserved_high.div_ceil(self.block_size)
        };
        (low, high)
    }

    /// Finds and marks used a run of blocks; returns the byte position of
    /// the first block.
    pub fn allocate(&mut self, byte_len: u64, reserved_low: u64, reserved_high: u64) -> u64 {
        let blocks = self.blocks_for(byte_len);
        let (low, high) = self.reserved_blocks(reserved_low, reserved_high);
        let start = self.scan(blocks, low, high);
        self.update_failure_flags(start);
        self.ensure_len(start + blocks);
        for b in start..start + blocks {
            self.used.set(b as usize, true);
        }
        start * self.block_size
    }

    /// Same scan as [`Self::allocate`] but without mutating occupancy —
    /// used by compaction to estimate where a rewrite would land. Still
    /// updates `failure_flags`, matching the non-mutating "predict" still
    /// being allocation pressure.
    pub fn predict_allocation(&mut self, byte_len: u64, reserved_low: u64, reserved_high: u64) -> u64 {
        let blocks = self.blocks_for(byte_len);
        let (low, high) = self.reserved_blocks(reserved_low, reserved_high);
        let start = self.scan(blocks, low, high);
        self.update_failure_flags(start);
        start * self.block_size
    }

    pub fn mark_used(&mut self, pos: u64, len: u64) -> Result<()> {
        let start = pos / self.block_size;
        let blocks = self.blocks_for(len);
        self.ensure_len(start + blocks);
        for b in start..start + blocks {
            if self.used[b as usize] {
                return Err(StorageError::Internal(format!(
                    "double-allocation of block {b}"
                )));
            }
            self.used.set(b as usize, true);
        }
        Ok(())
    }

    pub fn free(&mut self, pos: u64, len: u64) -> Result<()> {
        let start = pos / self.block_size;
        let blocks = self.blocks_for(len);
        for b in start..start + blocks {
            let idx = b as usize;
            if idx >= self.used.len() || !self.used[idx] {
                return Err(StorageError::Internal(format!(
                    "double-free of block {b}"
                )));
            }
            self.used.set(idx, false);
        }
        Ok(())
    }

    /// Percentage (0..=100) of addressed blocks currently in use.
    pub fn fill_rate(&self) -> u32 {
        if self.used.is_empty() {
            return 0;
        }
        let used = self.used.count_ones() as u64;
        ((used * 100) / self.used.len() as u64) as u32
    }

    /// Fill rate after hypothetically freeing `vacated_blocks` and keeping
    /// only `live_bytes` worth of occupied space.
    pub fn projected_fill_rate(&self, live_bytes: u64, vacated_blocks: u64) -> u32 {
        let total_blocks = self.used.len() as u64;
        if total_blocks <= vacated_blocks {
            return 0;
        }
        let remaining_total = total_blocks - vacated_blocks;
        let live_blocks = self.blocks_for(live_bytes).min(remaining_total);
        ((live_blocks * 100) / remaining_total) as u32
    }

    pub fn first_free(&self) -> u64 {
        let block = self
            .used
            .iter()
            .position(|b| !*b)
            .unwrap_or(self.used.len());
        block as u64 * self.block_size
    }

    pub fn last_free(&self) -> u64 {
        match self.last_used_block() {
            Some(last) => (last + 1) * self.block_size,
            None => 0,
        }
    }

    /// More than one bit set in the low 4 bits of the sliding register
    /// means recent allocations repeatedly skipped past the last used
    /// block looking for room — a fragmentation signal.
    pub fn is_fragmented(&self) -> bool {
        (self.failure_flags & 0x0F).count_ones() > 1
    }

    pub fn failure_flags(&self) -> u8 {
        self.failure_flags & 0x0F
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_restores_state() {
        let mut map = FreeSpaceMap::new(4096);
        let before = map.used.clone();
        let pos = map.allocate(8192, 0, RESERVED_TO_END);
        map.free(pos, 8192).unwrap();
        assert_eq!(map.used, before);
    }

    #[test]
    fn first_fit_reuses_holes() {
        let mut map = FreeSpaceMap::new(4096);
        let a = map.allocate(4096, 0, RESERVED_TO_END);
        let b = map.allocate(4096, 0, RESERVED_TO_END);
        map.free(a, 4096).unwrap();
        let c = map.allocate(4096, 0, RESERVED_TO_END);
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn reserved_window_is_skipped() {
        let mut map = FreeSpaceMap::new(4096);
        // Reserve blocks [0, 2) so allocation must skip to block 2.
        let pos = map.allocate(4096, 0, 2 * 4096);
        assert_eq!(pos, 2 * 4096);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut map = FreeSpaceMap::new(4096);
        let pos = map.allocate(4096, 0, RESERVED_TO_END);
        map.free(pos, 4096).unwrap();
        assert!(map.free(pos, 4096).is_err());
    }

    #[test]
    fn double_mark_used_is_rejected() {
        let mut map = FreeSpaceMap::new(4096);
        map.mark_used(0, 4096).unwrap();
        assert!(map.mark_used(0, 4096).is_err());
    }

    #[test]
    fn fill_rate_tracks_occupancy() {
        let mut map = FreeSpaceMap::new(4096);
        assert_eq!(map.fill_rate(), 0);
        map.allocate(4096, 0, RESERVED_TO_END);
        map.allocate(4096, 0, RESERVED_TO_END);
        assert_eq!(map.fill_rate(), 100);
    }

    #[test]
    fn fragmentation_flag_responds_to_skips() {
        let mut map = FreeSpaceMap::new(4096);
        map.allocate(4096, 0, RESERVED_TO_END); // block 0, contiguous, no skip
        assert!(!map.is_fragmented());
        // Force several allocations that must skip ahead of the last used block.
        for _ in 0..3 {
            map.predict_allocation(4096, 2 * 4096, RESERVED_TO_END);
        }
        assert!(map.is_fragmented());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Any sequence of allocate-then-immediately-free calls must leave
        // the bitmap exactly as it started, regardless of how many holes
        // the scan has to skip along the way.
        #[test]
        fn allocate_then_free_round_trips_for_any_sequence(
            sizes in prop::collection::vec(1u64..=(8 * 4096), 1..20),
        ) {
            let mut map = FreeSpaceMap::new(4096);
            let before = map.used.clone();
            for size in sizes {
                let pos = map.allocate(size, 0, RESERVED_TO_END);
                map.free(pos, size).unwrap();
            }
            prop_assert_eq!(map.used, before);
        }
    }
}
