use crate::config::Config;
use crate::entry::{Entry, EntryState};
use crate::error::Error;
use crate::hash::{hash_key, DefaultHashBuilder};
use crate::iter::{Keys, SegmentedIter, Values};
use crate::lock::{SegmentGuard, SegmentLock, SEGMENT_COUNT};
use crate::primes;
use crate::registry::IteratorRegistry;
use crate::stats::{SegmentStats, Stats};
use crate::table::{retire_chain, Table, GROWING};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};
use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Fewest new keys a segment takes before it can trigger growth.
const MIN_SEGMENT_CAPACITY: usize = 4;

/// Segment owning bucket `index`.
#[inline]
fn segment_of(index: usize) -> usize {
    index % SEGMENT_COUNT
}

/// Concurrent hash map with 61 independently locked segments.
///
/// Bucket `i` belongs to segment `i % 61`. Inserting a new key or removing
/// one locks only the owning segment, so writers on unrelated keys do not
/// contend. Lookups and updates of existing values never lock. Whole-table
/// operations (growth, [`clear`](Self::clear), large
/// [`insert_all`](Self::insert_all) batches) take every segment at once.
///
/// The map grows when a segment holds more than its share of the table's
/// capacity, or the whole table more than its capacity. Growth is deferred while any iterator is live, so iterators
/// always walk a single, stable bucket array.
///
/// Keys can also be [reserved](Self::reserve) without a value. A reservation
/// takes the key's slot but is invisible to lookups, [`len`](Self::len) and
/// iteration until the key is inserted.
///
/// # Example
///
/// ```rust
/// use stablemap::SegmentedHashMap;
/// use std::sync::Arc;
/// use std::thread;
///
/// let map = Arc::new(SegmentedHashMap::new());
/// let handles: Vec<_> = (0..4)
///     .map(|t| {
///         let map = Arc::clone(&map);
///         thread::spawn(move || {
///             for i in 0..100 {
///                 map.insert(t * 100 + i, i);
///             }
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(map.len(), 400);
/// ```
pub struct SegmentedHashMap<K, V, S = DefaultHashBuilder> {
    pub(crate) table: Atomic<Table<K, V>>,
    /// Stored mappings per segment. Only changed under the segment's lock.
    counts: Box<[CachePadded<AtomicUsize>]>,
    segment_capacity: AtomicUsize,
    locks: SegmentLock,
    resizes: AtomicU64,
    pub(crate) iterators: IteratorRegistry,
    config: Config,
    hash_builder: S,
}

impl<K, V> SegmentedHashMap<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a new map with the default config.
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }

    /// Create a map sized for `capacity` evenly spread entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let config = Config::default();
        let buckets = config.buckets_for(capacity).max(1);
        Self::build(config, DefaultHashBuilder::default(), buckets)
    }

    /// Create a new map with custom config.
    pub fn with_config(config: Config) -> Result<Self, Error> {
        Self::with_config_and_hasher(config, DefaultHashBuilder::default())
    }
}

impl<K, V, S> SegmentedHashMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    /// Create a new map with the default config, hashing with `hash_builder`.
    pub fn with_hasher(hash_builder: S) -> Self {
        let config = Config::default();
        let buckets = config.initial_buckets;
        Self::build(config, hash_builder, buckets)
    }

    /// Create a new map with custom config and hash builder.
    pub fn with_config_and_hasher(config: Config, hash_builder: S) -> Result<Self, Error> {
        config.validate()?;
        let buckets = config.initial_buckets;
        Ok(Self::build(config, hash_builder, buckets))
    }

    fn build(config: Config, hash_builder: S, buckets: usize) -> Self {
        let buckets = primes::ceil_prime(buckets);
        let map = Self {
            table: Atomic::new(Table::with_len(buckets)),
            counts: (0..SEGMENT_COUNT)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
            segment_capacity: AtomicUsize::new(0),
            locks: SegmentLock::new(),
            resizes: AtomicU64::new(0),
            iterators: IteratorRegistry::new(),
            config,
            hash_builder,
        };
        map.segment_capacity
            .store(map.capacity_per_segment(buckets), Ordering::Relaxed);
        map
    }

    /// The table's capacity split evenly over the segments that own buckets.
    fn capacity_per_segment(&self, buckets: usize) -> usize {
        let used = buckets.min(SEGMENT_COUNT);
        self.config
            .capacity_for(buckets)
            .div_ceil(used)
            .max(MIN_SEGMENT_CAPACITY)
    }

    #[inline]
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        hash_key(&self.hash_builder, key)
    }

    /// The live bucket array, spinning while a resize is in progress.
    pub(crate) fn stable_table<'g>(&self, guard: &'g Guard) -> Shared<'g, Table<K, V>> {
        let backoff = Backoff::new();
        loop {
            let table = self.table.load(Ordering::Acquire, guard);
            if table.tag() != GROWING {
                return table;
            }
            backoff.snooze();
        }
    }

    fn find_entry<'g, Q>(&'g self, hash: u64, key: &Q, guard: &'g Guard) -> Option<&'g Entry<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        loop {
            let table = self.stable_table(guard);
            // safety: tables are retired through the epoch collector.
            let found = unsafe { table.deref() }.find(hash, key, guard);
            if self.table.load(Ordering::Acquire, guard) == table {
                return found;
            }
        }
    }

    /// The live bucket array while every segment is locked.
    fn locked_table<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        let table = self.table.load(Ordering::Acquire, guard);
        debug_assert_eq!(table.tag(), 0);
        // safety: the table is only replaced under every segment lock.
        unsafe { table.deref() }
    }

    /// Lock the segment owning `hash` in the live table. Returns the table
    /// the segment index was computed against, which cannot be replaced
    /// while the guard is held.
    fn lock_owner<'g>(
        &'g self,
        hash: u64,
        guard: &'g Guard,
    ) -> (SegmentGuard<'g>, Shared<'g, Table<K, V>>, usize) {
        loop {
            let shared = self.stable_table(guard);
            // safety: tables are retired through the epoch collector.
            let segment = segment_of(unsafe { shared.deref() }.index(hash));
            let held = self.locks.lock(segment);
            if self.table.load(Ordering::Acquire, guard) == shared {
                return (held, shared, segment);
            }
            // grown while we waited; the key may live in another segment now
        }
    }

    /// Get the value for `key`. Never locks.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let guard = &epoch::pin();
        self.find_entry(hash, key, guard)?.mapping(guard)
    }

    /// Get a copy of the stored key together with its value.
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(K, Arc<V>)>
    where
        K: Borrow<Q> + Clone,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let guard = &epoch::pin();
        let entry = self.find_entry(hash, key, guard)?;
        Some((entry.key.clone(), entry.mapping(guard)?))
    }

    /// Check whether `key` has a value. Reserved keys do not.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Check whether any key maps to `value`. Walks the whole map.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let mut found = false;
        self.scan(guard, |entry| match entry.mapping(guard) {
            Some(v) if *v == *value => {
                found = true;
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        });
        found
    }

    fn scan<'g, F>(&'g self, guard: &'g Guard, mut visit: F)
    where
        F: FnMut(&'g Entry<K, V>) -> ControlFlow<()>,
    {
        loop {
            let shared = self.stable_table(guard);
            // safety: tables are retired through the epoch collector.
            let table = unsafe { shared.deref() };
            for index in 0..table.len() {
                for entry in table.chain(index, guard) {
                    if visit(entry).is_break() {
                        return;
                    }
                }
            }
            if self.table.load(Ordering::Acquire, guard) == shared {
                return;
            }
        }
    }

    /// Insert a key-value pair. Returns the old value if the key existed.
    ///
    /// Replacing the value of an existing key never locks. Inserting a new
    /// key locks its segment and may grow the map first; a failed growth is
    /// logged and the pair is stored anyway.
    pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        let (previous, grown) = self.put(key, Arc::new(value), false);
        if let Err(err) = grown {
            log::warn!("segmented map kept its bucket array: {}", err);
        }
        previous
    }

    /// Like [`insert`](Self::insert), but reports a failed growth. The pair
    /// is stored either way.
    pub fn try_insert(&self, key: K, value: V) -> Result<Option<Arc<V>>, Error> {
        let (previous, grown) = self.put(key, Arc::new(value), false);
        grown.map(|()| previous)
    }

    /// Insert only if `key` has no value. Returns the existing value if it
    /// had one, in which case the map is unchanged. A reservation of `key`
    /// is turned into a stored mapping.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let (existing, grown) = self.put(key, Arc::new(value), true);
        if let Err(err) = grown {
            log::warn!("segmented map kept its bucket array: {}", err);
        }
        existing
    }

    fn put(
        &self,
        key: K,
        value: Arc<V>,
        only_if_absent: bool,
    ) -> (Option<Arc<V>>, Result<(), Error>) {
        let hash = self.hash(&key);
        let guard = &epoch::pin();
        let mut value = value;

        if let Some(entry) = self.find_entry(hash, &key, guard) {
            if only_if_absent {
                if let Some(existing) = entry.mapping(guard) {
                    return (Some(existing), Ok(()));
                }
            } else if !entry.is_synthetic() {
                match entry.value.replace_present(value, guard) {
                    Ok(previous) => return (Some(previous), Ok(())),
                    // removed under us
                    Err(rejected) => value = rejected,
                }
            }
        }

        let (held, shared, segment) = self.lock_owner(hash, guard);
        // safety: the table cannot be replaced while `held` is alive.
        let table = unsafe { shared.deref() };
        let absent = table.find(hash, &key, guard).is_none();

        let (held, table, segment, grown) = if absent && self.needs_growth(segment, table.len()) {
            if self.iterators.is_active() {
                log::trace!("segmented map deferring growth: iterators are live");
                (held, table, segment, Ok(()))
            } else {
                let all = held.upgrade();
                let grown = self.grow_locked(shared.as_raw(), guard);
                let table = self.locked_table(guard);
                let segment = segment_of(table.index(hash));
                (all.downgrade(segment), table, segment, grown)
            }
        } else {
            (held, table, segment, Ok(()))
        };

        let previous = self.store_locked(table, segment, hash, key, value, only_if_absent, guard);
        drop(held);
        (previous, grown)
    }

    /// Whether one more key in `segment` would overfill it or the table.
    fn needs_growth(&self, segment: usize, buckets: usize) -> bool {
        self.counts[segment].load(Ordering::Relaxed) >= self.segment_capacity.load(Ordering::Relaxed)
            || self.len() >= self.config.capacity_for(buckets)
    }

    /// Store a mapping with the owning segment locked.
    #[allow(clippy::too_many_arguments)]
    fn store_locked(
        &self,
        table: &Table<K, V>,
        segment: usize,
        hash: u64,
        key: K,
        value: Arc<V>,
        only_if_absent: bool,
        guard: &Guard,
    ) -> Option<Arc<V>> {
        match table.find(hash, &key, guard) {
            Some(entry) if entry.is_synthetic() => {
                entry.promote(value, guard);
                self.counts[segment].fetch_add(1, Ordering::Release);
                None
            }
            Some(entry) if only_if_absent => entry.mapping(guard),
            Some(entry) => entry.value.swap(Some(value), guard),
            None => {
                table.push_front(
                    table.index(hash),
                    Owned::new(Entry::new(hash, key, value)),
                    guard,
                );
                self.counts[segment].fetch_add(1, Ordering::Release);
                None
            }
        }
    }

    /// Insert every pair.
    ///
    /// Batches of at least [`Config::bulk_insert_threshold`] pairs lock the
    /// whole map once, grow it to fit the batch and insert without further
    /// locking; smaller batches are inserted one key at a time.
    pub fn insert_all<I>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let pairs: Vec<(K, V)> = pairs.into_iter().collect();
        if pairs.len() < self.config.bulk_insert_threshold {
            for (key, value) in pairs {
                self.insert(key, value);
            }
            return;
        }

        let guard = &epoch::pin();
        let _all = self.locks.lock_all();
        let needed = self.len().saturating_add(pairs.len());
        let buckets = primes::ceil_prime(self.config.buckets_for(needed));
        if let Err(err) = self.resize_locked(buckets, guard) {
            log::warn!(
                "segmented map could not pre-size for {} entries: {}",
                pairs.len(),
                err
            );
        }

        let table = self.locked_table(guard);
        for (key, value) in pairs {
            let hash = self.hash(&key);
            let segment = segment_of(table.index(hash));
            self.store_locked(table, segment, hash, key, Arc::new(value), false, guard);
        }
    }

    /// Grow the bucket array, if needed, so that `additional` more entries
    /// fit. Does nothing while iterators are live.
    pub fn try_reserve(&self, additional: usize) -> Result<(), Error> {
        let guard = &epoch::pin();
        let _all = self.locks.lock_all();
        let needed = self.len().saturating_add(additional);
        let current = self.locked_table(guard).len();
        if needed <= self.config.capacity_for(current) {
            return Ok(());
        }
        self.resize_locked(primes::ceil_prime(self.config.buckets_for(needed)), guard)
    }

    /// Grow by the configured rate unless somebody already replaced
    /// `observed`. Caller holds every segment lock.
    fn grow_locked(&self, observed: *const Table<K, V>, guard: &Guard) -> Result<(), Error> {
        let current = self.locked_table(guard);
        if !std::ptr::eq(current, observed) {
            return Ok(());
        }
        self.resize_locked(primes::next_size(current.len(), self.config.growth_rate), guard)
    }

    /// Replace the bucket array with one of `buckets` buckets, moving every
    /// entry. Caller holds every segment lock.
    fn resize_locked(&self, buckets: usize, guard: &Guard) -> Result<(), Error> {
        let current = self.table.load(Ordering::Acquire, guard);
        // safety: only a holder of every segment lock replaces the table.
        let old = unsafe { current.deref() };
        if buckets <= old.len() {
            return Ok(());
        }

        self.table.store(current.with_tag(GROWING), Ordering::SeqCst);
        // checked after tagging: a later iterator will wait for the new table
        if self.iterators.is_active() {
            self.table.store(current, Ordering::SeqCst);
            log::trace!("segmented map deferring growth: iterators are live");
            return Ok(());
        }

        let new = match Table::try_new(buckets) {
            Ok(table) => table,
            Err(err) => {
                self.table.store(current, Ordering::SeqCst);
                return Err(err);
            }
        };

        let mut counts = [0usize; SEGMENT_COUNT];
        old.migrate_into(
            &new,
            guard,
            |_| Shared::null(),
            |entry, index| {
                if entry.state() == EntryState::Live {
                    counts[segment_of(index)] += 1;
                }
            },
        );
        for (slot, count) in self.counts.iter().zip(counts) {
            slot.store(count, Ordering::Release);
        }
        self.segment_capacity
            .store(self.capacity_per_segment(buckets), Ordering::Relaxed);

        self.table.store(Owned::new(new), Ordering::Release);
        self.resizes.fetch_add(1, Ordering::Relaxed);
        // safety: unreachable from the map; readers still holding it are pinned.
        unsafe { guard.defer_destroy(current) };

        log::debug!(
            "segmented map resized {} -> {} buckets ({} entries)",
            old.len(),
            buckets,
            self.len()
        );
        Ok(())
    }

    /// Remove `key`, returning its value if it had one.
    ///
    /// A reserved key has no value: removing it returns `None` and leaves the
    /// reservation in place.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let guard = &epoch::pin();
        let (_held, shared, segment) = self.lock_owner(hash, guard);
        // safety: the table cannot be replaced while the segment is held.
        let table = unsafe { shared.deref() };
        let (link, entry) = table.locate(hash, key, guard)?;
        // safety: loaded through `guard`; unlinking requires our segment lock.
        let node = unsafe { entry.deref() };
        if node.is_synthetic() {
            return None;
        }
        Table::unlink(link, entry, guard);
        self.counts[segment].fetch_sub(1, Ordering::Release);
        let previous = node.retire(guard);
        unsafe { guard.defer_destroy(entry) };
        previous
    }

    /// Reserve `key` without giving it a value.
    ///
    /// Returns `false` if the key already has a value or a reservation.
    ///
    /// # Example
    ///
    /// ```rust
    /// use stablemap::SegmentedHashMap;
    ///
    /// let map = SegmentedHashMap::new();
    /// assert!(map.reserve("job"));
    /// assert!(map.get("job").is_none());
    /// assert_eq!(map.len(), 0);
    ///
    /// map.insert("job", 7);
    /// assert!(!map.is_reserved("job"));
    /// assert_eq!(*map.get("job").unwrap(), 7);
    /// ```
    pub fn reserve(&self, key: K) -> bool {
        let hash = self.hash(&key);
        let guard = &epoch::pin();
        let (_held, shared, _) = self.lock_owner(hash, guard);
        // safety: the table cannot be replaced while the segment is held.
        let table = unsafe { shared.deref() };
        if table.find(hash, &key, guard).is_some() {
            return false;
        }
        table.push_front(
            table.index(hash),
            Owned::new(Entry::synthetic(hash, key)),
            guard,
        );
        true
    }

    /// Check whether `key` is reserved and has no value yet.
    pub fn is_reserved<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let guard = &epoch::pin();
        self.find_entry(hash, key, guard)
            .is_some_and(|entry| entry.is_synthetic())
    }

    /// Drop the reservation of `key`. Returns `false` if the key was not
    /// reserved (including when it has since been inserted).
    pub fn cancel_reservation<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let guard = &epoch::pin();
        let (_held, shared, _) = self.lock_owner(hash, guard);
        // safety: the table cannot be replaced while the segment is held.
        let table = unsafe { shared.deref() };
        let Some((link, entry)) = table.locate(hash, key, guard) else {
            return false;
        };
        let node = unsafe { entry.deref() };
        if !node.is_synthetic() {
            return false;
        }
        Table::unlink(link, entry, guard);
        node.set_state(EntryState::Removed);
        unsafe { guard.defer_destroy(entry) };
        true
    }

    /// Remove every entry and reservation. The bucket array keeps its
    /// current size.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let _all = self.locks.lock_all();
        let table = self.locked_table(guard);
        for head in table.detach_all(guard) {
            retire_chain(head, guard);
        }
        for count in self.counts.iter() {
            count.store(0, Ordering::Release);
        }
    }

    /// Number of stored mappings: the sum of the segment counters, read
    /// without locking.
    pub fn len(&self) -> usize {
        self.counts
            .iter()
            .map(|count| count.load(Ordering::Acquire))
            .sum()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the current bucket array.
    pub fn bucket_count(&self) -> usize {
        let guard = &epoch::pin();
        // safety: tables are retired through the epoch collector.
        unsafe { self.stable_table(guard).deref() }.len()
    }

    /// The configuration this map was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of size, growth and per-segment statistics.
    pub fn stats(&self) -> Stats {
        let segments: Vec<SegmentStats> = (0..SEGMENT_COUNT)
            .map(|segment| SegmentStats {
                entries: self.counts[segment].load(Ordering::Relaxed),
                contended: self.locks.is_contended(segment),
                lock: self.locks.segment_ops(segment),
            })
            .collect();
        Stats {
            len: segments.iter().map(|s| s.entries).sum(),
            bucket_count: self.bucket_count(),
            resizes: self.resizes.load(Ordering::Relaxed),
            active_iterators: self.iterators.len(),
            segments,
        }
    }

    /// Iterate over the stored mappings. Reservations are skipped.
    ///
    /// The map does not grow while the iterator is alive; drop it promptly.
    pub fn iter(&self) -> SegmentedIter<'_, K, V, S>
    where
        K: Clone,
    {
        SegmentedIter::new(self)
    }

    /// Iterate over the keys.
    pub fn keys(&self) -> Keys<SegmentedIter<'_, K, V, S>>
    where
        K: Clone,
    {
        Keys::new(self.iter())
    }

    /// Iterate over the values.
    pub fn values(&self) -> Values<SegmentedIter<'_, K, V, S>>
    where
        K: Clone,
    {
        Values::new(self.iter())
    }
}

impl<K, V> Default for SegmentedHashMap<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> fmt::Debug for SegmentedHashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + fmt::Debug + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Extend<(K, V)> for &SegmentedHashMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.insert_all(iter);
    }
}

impl<K, V, S> Extend<(K, V)> for SegmentedHashMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.insert_all(iter);
    }
}

impl<K, V, S> FromIterator<(K, V)> for SegmentedHashMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::with_hasher(S::default());
        map.insert_all(iter);
        map
    }
}

impl<K, V, S> Drop for SegmentedHashMap<K, V, S> {
    fn drop(&mut self) {
        // safety: `&mut self` means no guard-bound borrow of the map is alive.
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        if !table.is_null() {
            drop(unsafe { table.with_tag(0).into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapBuilder;

    fn small_map() -> SegmentedHashMap<u32, u32> {
        MapBuilder::new()
            .initial_buckets(4)
            .unwrap()
            .load_factor(1.0)
            .unwrap()
            .growth_rate(1.0)
            .unwrap()
            .build_segmented()
            .unwrap()
    }

    #[test]
    fn test_grows_when_segment_overflows() {
        let map = small_map();
        assert_eq!(map.bucket_count(), 5);
        for i in 1..=10 {
            assert!(map.insert(i, i).is_none());
        }
        assert_eq!(map.len(), 10);
        assert!(map.bucket_count() > 5);
        for i in 1..=10 {
            assert_eq!(*map.get(&i).unwrap(), i);
        }
    }

    #[test]
    fn test_segment_counts_follow_growth() {
        let map = small_map();
        for i in 0..500 {
            map.insert(i, i);
        }
        let stats = map.stats();
        assert_eq!(stats.len, 500);
        assert_eq!(stats.segments.len(), SEGMENT_COUNT);
        assert_eq!(stats.segments.iter().map(|s| s.entries).sum::<usize>(), 500);
        assert!(stats.resizes > 0);
    }

    #[test]
    fn test_growth_deferred_while_iterating() {
        let map = small_map();
        map.insert(0, 0);
        let mut iter = map.iter();
        assert!(iter.next().is_some());
        let buckets = map.bucket_count();
        for i in 1..200 {
            map.insert(i, i);
        }
        assert_eq!(map.bucket_count(), buckets);
        drop(iter);

        map.insert(1000, 1000);
        assert!(map.bucket_count() > buckets);
        assert_eq!(map.len(), 201);
    }

    #[test]
    fn test_reservation_lifecycle() {
        let map = small_map();
        assert!(map.reserve(7));
        assert!(!map.reserve(7));
        assert!(map.is_reserved(&7));
        assert!(map.get(&7).is_none());
        assert!(!map.contains_key(&7));
        assert_eq!(map.len(), 0);
        assert!(map.remove(&7).is_none());
        assert!(map.is_reserved(&7));

        assert!(map.insert_if_absent(7, 70).is_none());
        assert!(!map.is_reserved(&7));
        assert_eq!(map.len(), 1);
        assert!(!map.cancel_reservation(&7));
        assert!(!map.reserve(7));

        assert!(map.reserve(8));
        assert!(map.cancel_reservation(&8));
        assert!(!map.is_reserved(&8));
    }

    #[test]
    fn test_reservations_survive_growth() {
        let map = small_map();
        assert!(map.reserve(10_000));
        for i in 0..300 {
            map.insert(i, i);
        }
        assert!(map.stats().resizes > 0);
        assert!(map.is_reserved(&10_000));
        assert_eq!(map.len(), 300);
    }

    #[test]
    fn test_bulk_insert_presizes() {
        let map = small_map();
        map.insert_all((0..1000).map(|i| (i, i * 2)));
        assert_eq!(map.len(), 1000);
        assert!(map.bucket_count() >= 1000);
        assert_eq!(map.stats().resizes, 1);
        assert_eq!(*map.get(&999).unwrap(), 1998);
    }

    #[test]
    fn test_bulk_insert_promotes_and_overwrites() {
        let map = small_map();
        map.reserve(1);
        map.insert(2, 0);
        map.insert_all((0..100).map(|i| (i, i)));
        assert_eq!(map.len(), 100);
        assert!(!map.is_reserved(&1));
        assert_eq!(*map.get(&2).unwrap(), 2);
    }

    #[test]
    fn test_clear_drops_reservations() {
        let map = small_map();
        map.reserve(1);
        map.insert(2, 2);
        map.clear();
        assert!(map.is_empty());
        assert!(!map.is_reserved(&1));
        assert!(map.reserve(1));
    }

    #[test]
    fn test_contains_value_skips_reservations() {
        let map: SegmentedHashMap<&str, u32> = SegmentedHashMap::new();
        map.insert("a", 1);
        map.reserve("b");
        assert!(map.contains_value(&1));
        assert!(!map.contains_value(&0));
    }

    #[test]
    fn test_failed_growth_rolls_back() {
        let map = small_map();
        crate::table::fail_allocations(true);
        for i in 1..=5 {
            map.insert(i, i);
        }
        let grown = map.try_insert(6, 6);
        let reserved = map.try_reserve(100);
        crate::table::fail_allocations(false);

        assert!(matches!(grown, Err(Error::Allocation { .. })));
        assert!(matches!(reserved, Err(Error::Allocation { .. })));
        assert_eq!(map.bucket_count(), 5);
        assert_eq!(map.stats().resizes, 0);
        let guard = &epoch::pin();
        assert_eq!(map.table.load(Ordering::Acquire, guard).tag(), 0);
        // the pair that triggered the failed growth was stored anyway
        assert_eq!(map.len(), 6);
        for i in 1..=6 {
            assert_eq!(*map.get(&i).unwrap(), i);
        }

        map.insert(7, 7);
        assert!(map.bucket_count() > 5);
        assert_eq!(map.len(), 7);
    }

    /// Hashes a `u32` key to itself, so key `k` lands in bucket `k % len`.
    #[derive(Default)]
    struct IdentityHash(u64);

    impl std::hash::Hasher for IdentityHash {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 = (self.0 << 8) | u64::from(b);
            }
        }

        fn write_u32(&mut self, n: u32) {
            self.0 = u64::from(n);
        }
    }

    #[test]
    fn test_colliding_keys_do_not_grow_small_table() {
        let map: SegmentedHashMap<u32, u32, _> =
            SegmentedHashMap::with_hasher(std::hash::BuildHasherDefault::<IdentityHash>::default());
        assert_eq!(map.bucket_count(), 17);
        // one bucket, one segment
        for key in [0, 17, 34] {
            map.insert(key, key);
        }
        assert_eq!(map.bucket_count(), 17);

        // filling the table to its capacity does grow it
        for key in 1..17 {
            map.insert(key, key);
        }
        assert_eq!(map.len(), 19);
        assert_eq!(map.bucket_count(), 71);
        for key in (0..17).chain([17, 34]) {
            assert_eq!(*map.get(&key).unwrap(), key);
        }
    }
}
