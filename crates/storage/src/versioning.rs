//! Monotonic store version counter and reference-counted snapshot retention.
//!
//! Every snapshot (read transaction, iterator, pending commit) holds a
//! [`TxCounter`] for the version it was opened at. The retention collector
//! consults [`VersionTracker::oldest_live_version`] before reclaiming a
//! dead chunk: nothing whose `unused_at_version` is still visible to a
//! live counter can be collected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A handle pinning one store version alive. Cloning increments the
/// refcount for that version; dropping the last clone releases it. Holding
/// one guarantees the retention collector will not reclaim any chunk whose
/// `unused_at_version` is `>= ` this counter's version.
#[derive(Clone)]
pub struct TxCounter {
    version: u64,
    tracker: Arc<VersionTrackerInner>,
}

impl TxCounter {
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for TxCounter {
    fn drop(&mut self) {
        self.tracker.release(self.version);
    }
}

struct VersionTrackerInner {
    current_version: AtomicU64,
    refcounts: Mutex<BTreeMap<u64, u64>>,
}

impl VersionTrackerInner {
    fn release(&self, version: u64) {
        let mut refcounts = self.refcounts.lock();
        if let Some(count) = refcounts.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                refcounts.remove(&version);
            }
        }
    }
}

/// Owns the process-wide `current_version` and the live set of pinned
/// versions. Registration/deregistration only ever take a short-lived
/// mutex over the refcount map; the version counter itself is a plain
/// atomic so readers never block behind it.
#[derive(Clone)]
pub struct VersionTracker {
    inner: Arc<VersionTrackerInner>,
}

impl VersionTracker {
    pub fn new(initial_version: u64) -> Self {
        Self {
            inner: Arc::new(VersionTrackerInner {
                current_version: AtomicU64::new(initial_version),
                refcounts: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn current_version(&self) -> u64 {
        self.inner.current_version.load(Ordering::Acquire)
    }

    /// Publishes a new version, to be called once under the save lock
    /// after a chunk has been fully written.
    pub fn bump_version(&self) -> u64 {
        self.inner.current_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Pins the current version for a new snapshot. Safe to race with a
    /// concurrent `bump_version`: whichever version is read here is
    /// guaranteed live until this counter (or a later one observing the
    /// same version) is dropped, because retention only ever looks at the
    /// minimum of currently registered versions.
    pub fn open_snapshot(&self) -> TxCounter {
        let version = self.current_version();
        self.pin(version)
    }

    pub fn pin(&self, version: u64) -> TxCounter {
        let mut refcounts = self.inner.refcounts.lock();
        *refcounts.entry(version).or_insert(0) += 1;
        TxCounter {
            version,
            tracker: self.inner.clone(),
        }
    }

    /// The oldest version some live snapshot still depends on, or `None`
    /// if nothing is pinned (in which case everything up to the current
    /// version is collectable).
    pub fn oldest_live_version(&self) -> Option<u64> {
        self.inner.refcounts.lock().keys().next().copied()
    }

    /// A chunk retired at `unused_at_version` is safe to collect once no
    /// live snapshot has a version `<= unused_at_version`.
    pub fn is_collectable(&self, unused_at_version: u64) -> bool {
        match self.oldest_live_version() {
            Some(oldest) => oldest > unused_at_version,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_version_blocks_collection() {
        let tracker = VersionTracker::new(0);
        tracker.bump_version();
        let counter = tracker.open_snapshot();
        assert!(!tracker.is_collectable(counter.version()));
        drop(counter);
        assert!(tracker.is_collectable(1));
    }

    #[test]
    fn no_live_snapshots_means_collectable() {
        let tracker = VersionTracker::new(5);
        assert!(tracker.is_collectable(5));
    }

    #[test]
    fn multiple_holders_of_same_version_both_must_drop() {
        let tracker = VersionTracker::new(0);
        let a = tracker.open_snapshot();
        let b = tracker.pin(a.version());
        drop(a);
        assert!(!tracker.is_collectable(0));
        drop(b);
        assert!(tracker.is_collectable(0));
    }

    #[test]
    fn version_bump_is_monotonic() {
        let tracker = VersionTracker::new(0);
        assert_eq!(tracker.bump_version(), 1);
        assert_eq!(tracker.bump_version(), 2);
        assert_eq!(tracker.current_version(), 2);
    }
}
