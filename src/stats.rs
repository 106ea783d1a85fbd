//! Statistics and diagnostics types.

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-segment lock statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOps {
    /// Number of times the segment lock was requested (0 when metrics
    /// feature disabled).
    pub acquisitions: u64,
    /// Number of times a requester had to park (0 when metrics feature
    /// disabled).
    pub contended: u64,
    /// Cumulative wait time of contended acquisitions in nanoseconds (0 when
    /// lock-timing disabled).
    pub lock_wait_nanos: u64,
}

/// Thread-safe lock statistics tracker for a single segment.
#[cfg(feature = "metrics")]
pub(crate) struct LockStats {
    acquisitions: AtomicU64,
    contended: AtomicU64,
    #[cfg(feature = "lock-timing")]
    lock_wait_nanos: AtomicU64,
}

#[cfg(feature = "metrics")]
impl LockStats {
    pub fn new() -> Self {
        Self {
            acquisitions: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            #[cfg(feature = "lock-timing")]
            lock_wait_nanos: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_contended(&self) {
        self.contended.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(feature = "lock-timing")]
    #[inline]
    pub fn record_lock_wait(&self, nanos: u64) {
        self.lock_wait_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockOps {
        LockOps {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            #[cfg(feature = "lock-timing")]
            lock_wait_nanos: self.lock_wait_nanos.load(Ordering::Relaxed),
            #[cfg(not(feature = "lock-timing"))]
            lock_wait_nanos: 0,
        }
    }
}

/// Zero-sized placeholder when metrics are disabled.
#[cfg(not(feature = "metrics"))]
pub(crate) struct LockStats;

#[cfg(not(feature = "metrics"))]
impl LockStats {
    pub fn new() -> Self {
        LockStats
    }

    #[inline]
    pub fn record_acquisition(&self) {}

    #[inline]
    pub fn record_contended(&self) {}

    pub fn snapshot(&self) -> LockOps {
        LockOps::default()
    }
}

/// Snapshot of one segment of a [`SegmentedHashMap`](crate::SegmentedHashMap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    /// Entries counted against this segment (synthetic entries excluded).
    pub entries: usize,
    /// Whether a thread was parked on this segment's lock.
    pub contended: bool,
    /// Lock operation counters.
    pub lock: LockOps,
}

/// Aggregate statistics for a map instance.
///
/// Counts are read without locking and may be momentarily stale under
/// concurrent modification.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    /// Number of entries.
    pub len: usize,
    /// Length of the current bucket array.
    pub bucket_count: usize,
    /// Number of completed resizes.
    pub resizes: u64,
    /// Number of iterators currently registered with the map.
    pub active_iterators: usize,
    /// Per-segment breakdown (empty for [`SafeHashMap`](crate::SafeHashMap)).
    pub segments: Vec<SegmentStats>,
}

impl Stats {
    /// Entries per bucket.
    pub fn load(&self) -> f64 {
        if self.bucket_count == 0 {
            return 0.0;
        }
        self.len as f64 / self.bucket_count as f64
    }

    /// Largest segment load divided by the average segment load. `None` for
    /// maps without segments or with no entries.
    pub fn max_segment_ratio(&self) -> Option<f64> {
        let max = self.segments.iter().map(|s| s.entries).max()?;
        if self.len == 0 {
            return None;
        }
        let avg = self.len as f64 / self.segments.len() as f64;
        Some(max as f64 / avg)
    }
}
