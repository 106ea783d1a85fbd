//! Segment locks packed into a single 64-bit word.
//!
//! Bits `0..61` are exclusive locks, one per segment. Bit 61 is the
//! lock-all intention flag: while it is set no new segment lock can be
//! acquired, so a thread that wants the whole table only has to wait for the
//! segment locks that were already held when it raised the flag.
//!
//! Acquisition spins with a [`Backoff`] first and then parks on a per-segment
//! monitor. Parking is bounded by [`PARK_TIMEOUT`] so a missed wakeup costs a
//! retry, not a hang.

use crate::stats::{LockOps, LockStats};
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
#[cfg(feature = "lock-timing")]
use std::time::Instant;

/// Number of segments a [`SegmentedHashMap`](crate::SegmentedHashMap) is
/// partitioned into.
pub const SEGMENT_COUNT: usize = 61;

/// Every segment bit.
pub(crate) const ALL_SEGMENTS: u64 = (1 << SEGMENT_COUNT) - 1;

const LOCK_ALL_PENDING: u64 = 1 << SEGMENT_COUNT;

/// Upper bound on a single park before the waiter re-checks the lock word.
pub(crate) const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Condition variable with a waiter count, so releasers only take the mutex
/// when somebody is actually parked.
#[derive(Default)]
pub(crate) struct Monitor {
    waiters: AtomicUsize,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Monitor {
    /// Park for at most [`PARK_TIMEOUT`] if `blocked` still holds once the
    /// monitor is locked.
    pub fn park_while<F>(&self, blocked: F)
    where
        F: Fn() -> bool,
    {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.mutex.lock();
        if blocked() {
            self.cond.wait_for(&mut guard, PARK_TIMEOUT);
        }
        drop(guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn notify_all(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.mutex.lock();
            self.cond.notify_all();
        }
    }

    pub fn is_contended(&self) -> bool {
        self.waiters.load(Ordering::Relaxed) > 0
    }
}

pub(crate) struct SegmentLock {
    word: CachePadded<AtomicU64>,
    segments: Box<[Monitor]>,
    lock_all: Monitor,
    stats: Box<[LockStats]>,
}

impl SegmentLock {
    pub fn new() -> Self {
        Self {
            word: CachePadded::new(AtomicU64::new(0)),
            segments: (0..SEGMENT_COUNT).map(|_| Monitor::default()).collect(),
            lock_all: Monitor::default(),
            stats: (0..SEGMENT_COUNT).map(|_| LockStats::new()).collect(),
        }
    }

    /// Lock a single segment.
    pub fn lock(&self, segment: usize) -> SegmentGuard<'_> {
        let bit = 1u64 << segment;
        let stats = &self.stats[segment];
        stats.record_acquisition();
        if self.try_acquire(bit) {
            return SegmentGuard { lock: self, segment };
        }

        #[cfg(feature = "lock-timing")]
        let started = Instant::now();
        let backoff = Backoff::new();
        while !self.try_acquire(bit) {
            if backoff.is_completed() {
                stats.record_contended();
                self.segments[segment].park_while(|| {
                    self.word.load(Ordering::SeqCst) & (bit | LOCK_ALL_PENDING) != 0
                });
            } else {
                backoff.snooze();
            }
        }
        #[cfg(feature = "lock-timing")]
        stats.record_lock_wait(started.elapsed().as_nanos() as u64);

        SegmentGuard { lock: self, segment }
    }

    /// Lock every segment.
    ///
    /// Must not be called while holding a segment lock; use
    /// [`SegmentGuard::upgrade`] for that.
    pub fn lock_all(&self) -> AllSegmentsGuard<'_> {
        let backoff = Backoff::new();
        while !self.try_raise_intention() {
            if backoff.is_completed() {
                self.lock_all
                    .park_while(|| self.word.load(Ordering::SeqCst) & LOCK_ALL_PENDING != 0);
            } else {
                backoff.snooze();
            }
        }
        self.collect_segments(0);
        AllSegmentsGuard { lock: self, keep: 0 }
    }

    /// Whether any segment or lock-all operation currently holds the word.
    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != 0
    }

    pub fn segment_ops(&self, segment: usize) -> LockOps {
        self.stats[segment].snapshot()
    }

    pub fn is_contended(&self, segment: usize) -> bool {
        self.segments[segment].is_contended()
    }

    fn try_acquire(&self, bit: u64) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            if current & (bit | LOCK_ALL_PENDING) != 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                current | bit,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn try_raise_intention(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            if current & LOCK_ALL_PENDING != 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                current | LOCK_ALL_PENDING,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// With the intention flag raised, take every segment bit not in `held`
    /// as its current owner lets go.
    fn collect_segments(&self, held: u64) {
        let mut owned = held;
        let backoff = Backoff::new();
        loop {
            let current = self.word.load(Ordering::SeqCst);
            let free = ALL_SEGMENTS & !current;
            if free != 0 {
                if self
                    .word
                    .compare_exchange(current, current | free, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                owned |= free;
            }
            if owned == ALL_SEGMENTS {
                return;
            }
            if backoff.is_completed() {
                self.lock_all
                    .park_while(|| ALL_SEGMENTS & !self.word.load(Ordering::SeqCst) == 0);
            } else {
                backoff.snooze();
            }
        }
    }

    fn unlock(&self, segment: usize) {
        self.word.fetch_and(!(1u64 << segment), Ordering::SeqCst);
        self.segments[segment].notify_all();
        self.lock_all.notify_all();
    }

    /// Release everything except the segments in `keep`, including the
    /// intention flag. Waiters on free segments were blocked by the flag, so
    /// every parked segment waiter is woken, not just those on released bits.
    fn unlock_all(&self, keep: u64) {
        self.word.store(keep, Ordering::SeqCst);
        for monitor in self.segments.iter() {
            monitor.notify_all();
        }
        self.lock_all.notify_all();
    }
}

/// Holds one segment lock until dropped.
#[must_use = "the segment is unlocked as soon as the guard is dropped"]
pub(crate) struct SegmentGuard<'a> {
    lock: &'a SegmentLock,
    segment: usize,
}

impl<'a> SegmentGuard<'a> {
    /// Trade this segment lock for all of them.
    ///
    /// If no other lock-all is pending the segment stays held while the rest
    /// are collected. Otherwise the segment is released first so the pending
    /// operation can finish, then every segment is acquired from scratch.
    pub fn upgrade(self) -> AllSegmentsGuard<'a> {
        let this = ManuallyDrop::new(self);
        let lock = this.lock;
        if lock.try_raise_intention() {
            lock.collect_segments(1u64 << this.segment);
            AllSegmentsGuard { lock, keep: 0 }
        } else {
            lock.unlock(this.segment);
            lock.lock_all()
        }
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.segment);
    }
}

/// Holds every segment lock until dropped.
#[must_use = "the segments are unlocked as soon as the guard is dropped"]
pub(crate) struct AllSegmentsGuard<'a> {
    lock: &'a SegmentLock,
    keep: u64,
}

impl<'a> AllSegmentsGuard<'a> {
    /// Hand back every segment except `segment`, which stays locked.
    pub fn downgrade(self, segment: usize) -> SegmentGuard<'a> {
        let mut this = ManuallyDrop::new(self);
        this.keep = 1u64 << segment;
        this.lock.unlock_all(this.keep);
        SegmentGuard {
            lock: this.lock,
            segment,
        }
    }
}

impl Drop for AllSegmentsGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_all(self.keep);
    }
}
