use crate::config::Config;
use crate::entry::Entry;
use crate::error::Error;
use crate::hash::{hash_key, DefaultHashBuilder};
use crate::iter::{Keys, SafeIter, Values};
use crate::lock::PARK_TIMEOUT;
use crate::primes;
use crate::registry::IteratorRegistry;
use crate::stats::Stats;
use crate::table::{copy_chain, retire_chain, Table, GROWING};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::{Condvar, Mutex};
use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Concurrent hash map that only locks for structural changes.
///
/// Lookups and updates of existing keys never take a lock: they read a
/// snapshot of the bucket array and swap values atomically. Inserting a new
/// key, removing one, clearing and growing serialize on a single map-wide
/// mutex. While the map grows, readers wait for the new bucket array; if any
/// iterator is live, the old array is left holding a copy of every chain so
/// the iterator can finish walking it.
///
/// Values are stored as `Arc<V>`; reads hand out clones of the `Arc`.
///
/// # Example
///
/// ```rust
/// use stablemap::SafeHashMap;
///
/// let map = SafeHashMap::new();
/// map.insert("key1", "value1");
///
/// if let Some(value) = map.get("key1") {
///     assert_eq!(*value, "value1");
/// }
/// ```
pub struct SafeHashMap<K, V, S = DefaultHashBuilder> {
    pub(crate) table: Atomic<Table<K, V>>,
    len: AtomicUsize,
    threshold: AtomicUsize,
    /// Serializes insertion of new keys, removal, clear and growth.
    lock: Mutex<()>,
    resize_lock: Mutex<()>,
    resized: Condvar,
    resizes: AtomicU64,
    pub(crate) iterators: IteratorRegistry,
    config: Config,
    hash_builder: S,
}

impl<K, V> SafeHashMap<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a new map with defaults (17 buckets, load factor 1.0, growth
    /// rate 3.0).
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }

    /// Create a map that holds `capacity` entries before it first grows.
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

impl<K, V, S> SafeHashMap<K, V, S>
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
        Self {
            table: Atomic::new(Table::with_len(buckets)),
            len: AtomicUsize::new(0),
            threshold: AtomicUsize::new(config.capacity_for(buckets)),
            lock: Mutex::new(()),
            resize_lock: Mutex::new(()),
            resized: Condvar::new(),
            resizes: AtomicU64::new(0),
            iterators: IteratorRegistry::new(),
            config,
            hash_builder,
        }
    }

    #[inline]
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        hash_key(&self.hash_builder, key)
    }

    /// The live bucket array, waiting out any resize in progress.
    pub(crate) fn stable_table<'g>(&self, guard: &'g Guard) -> Shared<'g, Table<K, V>> {
        loop {
            let table = self.table.load(Ordering::Acquire, guard);
            if table.tag() != GROWING {
                return table;
            }
            let mut waiting = self.resize_lock.lock();
            if self.table.load(Ordering::Acquire, guard).tag() == GROWING {
                self.resized.wait_for(&mut waiting, PARK_TIMEOUT);
            }
        }
    }

    fn notify_resized(&self) {
        let _waiting = self.resize_lock.lock();
        self.resized.notify_all();
    }

    /// Lock-free lookup. The result is only trusted if the bucket array was
    /// not replaced while the chain was walked; otherwise the walk restarts.
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

    /// The live bucket array while `self.lock` is held. Growth takes the same
    /// lock, so it cannot be tagged.
    fn locked_table<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        let table = self.table.load(Ordering::Acquire, guard);
        debug_assert_eq!(table.tag(), 0);
        // safety: only a holder of `self.lock` retires the live table.
        unsafe { table.deref() }
    }

    /// Get the value for `key`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use stablemap::SafeHashMap;
    ///
    /// let map = SafeHashMap::new();
    /// map.insert("key", "value");
    /// assert_eq!(*map.get("key").unwrap(), "value");
    /// assert!(map.get("missing").is_none());
    /// ```
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

    /// Check whether `key` has a value.
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

    /// Visit every entry of the live bucket array, starting over if the
    /// array is replaced mid-walk. Entries may be visited more than once.
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

    /// Remove `key`, returning its value if it had one.
    ///
    /// # Example
    ///
    /// ```rust
    /// use stablemap::SafeHashMap;
    ///
    /// let map = SafeHashMap::new();
    /// map.insert("key", "value");
    /// assert_eq!(*map.remove("key").unwrap(), "value");
    /// assert!(map.get("key").is_none());
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let guard = &epoch::pin();
        let _lock = self.lock.lock();
        let table = self.locked_table(guard);
        let (link, entry) = table.locate(hash, key, guard)?;
        Table::unlink(link, entry, guard);
        self.len.fetch_sub(1, Ordering::Release);
        // safety: `entry` was loaded through `guard` and is no longer reachable.
        let previous = unsafe { entry.deref() }.retire(guard);
        unsafe { guard.defer_destroy(entry) };
        previous
    }

    /// Remove every entry. The bucket array keeps its current size.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let _lock = self.lock.lock();
        let table = self.locked_table(guard);
        for head in table.detach_all(guard) {
            retire_chain(head, guard);
        }
        self.len.store(0, Ordering::Release);
    }

    /// Number of entries. Read without locking.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
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

    /// Snapshot of size and growth statistics.
    pub fn stats(&self) -> Stats {
        Stats {
            len: self.len(),
            bucket_count: self.bucket_count(),
            resizes: self.resizes.load(Ordering::Relaxed),
            active_iterators: self.iterators.len(),
            segments: Vec::new(),
        }
    }
}

impl<K, V, S> SafeHashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    /// Insert a key-value pair. Returns the old value if the key existed.
    ///
    /// If the insert pushes the map past its load factor the map grows; a
    /// failure to allocate the larger bucket array is logged and otherwise
    /// ignored (see [`try_insert`](Self::try_insert)).
    ///
    /// # Example
    ///
    /// ```rust
    /// use stablemap::SafeHashMap;
    ///
    /// let map = SafeHashMap::new();
    /// assert!(map.insert("key", "value").is_none());
    /// assert_eq!(*map.insert("key", "new_value").unwrap(), "value");
    /// ```
    pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        let (previous, needs_growth) = self.put(key, Arc::new(value), false);
        if needs_growth {
            if let Err(err) = self.grow() {
                log::warn!("safe map kept its bucket array: {}", err);
            }
        }
        previous
    }

    /// Like [`insert`](Self::insert), but reports a failed growth. The pair
    /// is stored either way.
    pub fn try_insert(&self, key: K, value: V) -> Result<Option<Arc<V>>, Error> {
        let (previous, needs_growth) = self.put(key, Arc::new(value), false);
        if needs_growth {
            self.grow()?;
        }
        Ok(previous)
    }

    /// Insert only if `key` has no value. Returns the existing value if it
    /// had one, in which case the map is unchanged.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let (existing, needs_growth) = self.put(key, Arc::new(value), true);
        if needs_growth {
            if let Err(err) = self.grow() {
                log::warn!("safe map kept its bucket array: {}", err);
            }
        }
        existing
    }

    /// Insert every pair, growing once up front for the batch when its size
    /// is known.
    pub fn insert_all<I>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let pairs = pairs.into_iter();
        let (batch, _) = pairs.size_hint();
        if batch > 0 {
            if let Err(err) = self.try_reserve(batch) {
                log::warn!("safe map could not pre-size for {} entries: {}", batch, err);
            }
        }
        for (key, value) in pairs {
            self.insert(key, value);
        }
    }

    /// Grow the bucket array, if needed, so that `additional` more entries
    /// fit without further growth.
    pub fn try_reserve(&self, additional: usize) -> Result<(), Error> {
        let guard = &epoch::pin();
        let _lock = self.lock.lock();
        let needed = self.len().saturating_add(additional);
        if needed <= self.threshold.load(Ordering::Relaxed) {
            return Ok(());
        }
        let buckets = primes::ceil_prime(self.config.buckets_for(needed));
        self.resize_locked(buckets, guard)
    }

    /// Lock-free update of an existing value, falling back to the map lock to
    /// insert. Returns the previous (or, with `only_if_absent`, the existing)
    /// value and whether the map is now over its threshold.
    fn put(&self, key: K, value: Arc<V>, only_if_absent: bool) -> (Option<Arc<V>>, bool) {
        let hash = self.hash(&key);
        let guard = &epoch::pin();
        let mut value = value;

        if let Some(entry) = self.find_entry(hash, &key, guard) {
            if only_if_absent {
                if let Some(existing) = entry.mapping(guard) {
                    return (Some(existing), false);
                }
            } else {
                match entry.value.replace_present(value, guard) {
                    Ok(previous) => return (Some(previous), false),
                    // removed under us
                    Err(rejected) => value = rejected,
                }
            }
        }

        let _lock = self.lock.lock();
        let table = self.locked_table(guard);
        if let Some(entry) = table.find(hash, &key, guard) {
            let previous = if only_if_absent {
                entry.mapping(guard)
            } else {
                entry.value.swap(Some(value), guard)
            };
            return (previous, false);
        }

        table.push_front(
            table.index(hash),
            Owned::new(Entry::new(hash, key, value)),
            guard,
        );
        let len = self.len.fetch_add(1, Ordering::Release) + 1;
        (None, len > self.threshold.load(Ordering::Relaxed))
    }

    fn grow(&self) -> Result<(), Error> {
        let guard = &epoch::pin();
        let _lock = self.lock.lock();
        // somebody else may have grown while we waited for the lock
        if self.len() <= self.threshold.load(Ordering::Relaxed) {
            return Ok(());
        }
        let current = self.locked_table(guard).len();
        self.resize_locked(primes::next_size(current, self.config.growth_rate), guard)
    }

    /// Replace the bucket array with one of `buckets` buckets. Caller holds
    /// `self.lock`.
    fn resize_locked(&self, buckets: usize, guard: &Guard) -> Result<(), Error> {
        let current = self.table.load(Ordering::Acquire, guard);
        // safety: the live table is only retired by a holder of `self.lock`.
        let old = unsafe { current.deref() };
        if buckets <= old.len() {
            return Ok(());
        }

        self.table.store(current.with_tag(GROWING), Ordering::SeqCst);
        // checked after tagging: a later iterator will wait for the new table
        let preserve = self.iterators.is_active();

        let new = match Table::try_new(buckets) {
            Ok(table) => table,
            Err(err) => {
                self.table.store(current, Ordering::SeqCst);
                self.notify_resized();
                return Err(err);
            }
        };

        old.migrate_into(
            &new,
            guard,
            |head| {
                if preserve {
                    copy_chain(head, guard)
                } else {
                    Shared::null()
                }
            },
            |_, _| {},
        );

        self.threshold
            .store(self.config.capacity_for(buckets), Ordering::Relaxed);
        self.table.store(Owned::new(new), Ordering::Release);
        self.resizes.fetch_add(1, Ordering::Relaxed);
        // safety: unreachable from the map; readers still holding it are pinned.
        unsafe { guard.defer_destroy(current) };
        self.notify_resized();

        log::debug!(
            "safe map resized {} -> {} buckets ({} entries, snapshot preserved: {})",
            old.len(),
            buckets,
            self.len(),
            preserve
        );
        Ok(())
    }

    /// Iterate over the entries.
    ///
    /// The iterator never blocks writers and tolerates concurrent resizes;
    /// see [`SafeIter`] for what it may and may not observe.
    ///
    /// # Example
    ///
    /// ```rust
    /// use stablemap::SafeHashMap;
    ///
    /// let map = SafeHashMap::new();
    /// map.insert("key1", "value1");
    /// map.insert("key2", "value2");
    ///
    /// let mut count = 0;
    /// for entry in map.iter() {
    ///     let (_key, _value) = entry?;
    ///     count += 1;
    /// }
    /// assert_eq!(count, 2);
    /// # Ok::<(), stablemap::Error>(())
    /// ```
    pub fn iter(&self) -> SafeIter<'_, K, V, S> {
        SafeIter::new(self)
    }

    /// Iterate over the keys.
    pub fn keys(&self) -> Keys<SafeIter<'_, K, V, S>> {
        Keys::new(self.iter())
    }

    /// Iterate over the values.
    pub fn values(&self) -> Values<SafeIter<'_, K, V, S>> {
        Values::new(self.iter())
    }

    /// Copy the map, including the values themselves rather than the `Arc`s
    /// that hold them. Entries inserted or removed while the copy is taken
    /// may or may not be included.
    pub fn deep_clone(&self) -> Self
    where
        V: Clone,
        S: Clone,
    {
        self.copy_with(|value| Arc::new(V::clone(value)))
    }

    fn copy_with<F>(&self, copy_value: F) -> Self
    where
        S: Clone,
        F: Fn(&Arc<V>) -> Arc<V>,
    {
        let copy = Self::build(
            self.config.clone(),
            self.hash_builder.clone(),
            self.bucket_count(),
        );
        let guard = &epoch::pin();
        self.scan(guard, |entry| {
            if let Some(value) = entry.mapping(guard) {
                copy.put(entry.key.clone(), copy_value(&value), false);
            }
            ControlFlow::Continue(())
        });
        copy
    }
}

impl<K, V> Default for SafeHashMap<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Shallow copy: the new map shares the `Arc`ed values.
impl<K, V, S> Clone for SafeHashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        self.copy_with(Arc::clone)
    }
}

impl<K, V, S> fmt::Debug for SafeHashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + fmt::Debug + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().filter_map(Result::ok))
            .finish()
    }
}

impl<K, V, S> Extend<(K, V)> for &SafeHashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.insert_all(iter);
    }
}

impl<K, V, S> Extend<(K, V)> for SafeHashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.insert_all(iter);
    }
}

impl<K, V, S> FromIterator<(K, V)> for SafeHashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::with_hasher(S::default());
        map.insert_all(iter);
        map
    }
}

impl<K, V, S> Drop for SafeHashMap<K, V, S> {
    fn drop(&mut self) {
        // safety: `&mut self` means no guard-bound borrow of the map is alive.
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        if !table.is_null() {
            drop(unsafe { table.with_tag(0).into_owned() });
        }
    }
}
