//! Iterators over both map engines.
//!
//! Neither iterator locks or copies the map. Both walk the bucket array in
//! place, bucket by bucket, under an epoch guard they hold for their whole
//! life, and both register with their map on the first call to `next` and
//! deregister once exhausted or dropped. They differ in how they cope with
//! growth:
//!
//! * [`SafeIter`] lets the map grow. Growth leaves a copy of every chain in
//!   the old bucket array, and the iterator finishes its walk there.
//! * [`SegmentedIter`] holds growth off until it is done.

use crate::entry::Entry;
use crate::error::Error;
use crate::hash::DefaultHashBuilder;
use crate::safe::SafeHashMap;
use crate::segmented::SegmentedHashMap;
use crate::table::Table;
use crossbeam_epoch::{self as epoch, Guard};
use std::hash::{BuildHasher, Hash};
use std::iter::FusedIterator;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Position in a bucket array: the bucket being walked and the last entry
/// visited in it (null before the first).
struct Cursor<K, V> {
    table: *const Table<K, V>,
    index: usize,
    last: *const Entry<K, V>,
}

impl<K, V> Cursor<K, V>
where
    V: Send + Sync,
{
    fn new(table: *const Table<K, V>) -> Self {
        Self {
            table,
            index: 0,
            last: ptr::null(),
        }
    }

    /// Step to the next entry, moving on to later buckets as chains run
    /// out. `None` once the last bucket is done.
    ///
    /// # Safety
    ///
    /// `guard` must have been pinned since `table` and `last` were loaded.
    unsafe fn advance(&mut self, guard: &Guard) -> Option<*const Entry<K, V>> {
        let table = &*self.table;
        loop {
            let next = match self.last.as_ref() {
                Some(last) => last.next.load(Ordering::Acquire, guard),
                None => table.bucket(self.index).load(Ordering::Acquire, guard),
            };
            if !next.is_null() {
                self.last = next.as_raw();
                return Some(self.last);
            }
            self.index += 1;
            self.last = ptr::null();
            if self.index >= table.len() {
                return None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// `next` has not been called yet.
    Fresh,
    /// Walking the map's live bucket array.
    Live,
    /// The map has grown; walking the snapshot left in the old array.
    Detached,
    Done,
}

/// Iterator over a [`SafeHashMap`].
///
/// Yields `Ok((key, value))` for each stored mapping. Entries present for the
/// whole walk are yielded exactly once; entries inserted or removed during
/// the walk may or may not be. Values are read when the entry is reached, so
/// an update made before that point is seen.
///
/// If the map grows during the walk the iterator continues on a snapshot of
/// the map as it was just before the growth. Should the entry it stopped at
/// be missing from that snapshot, the iterator yields
/// [`Error::ResyncFailed`] and then ends.
///
/// The iterator keeps an epoch guard pinned until it is dropped. While it is
/// pinned, no memory retired through `crossbeam-epoch` anywhere in the
/// process is reclaimed. Drop it promptly rather than parking or leaking it.
pub struct SafeIter<'a, K, V, S = DefaultHashBuilder> {
    map: &'a SafeHashMap<K, V, S>,
    guard: Guard,
    cursor: Cursor<K, V>,
    registration: Option<u64>,
    phase: Phase,
}

impl<'a, K, V, S> SafeIter<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    pub(crate) fn new(map: &'a SafeHashMap<K, V, S>) -> Self {
        Self {
            map,
            guard: epoch::pin(),
            cursor: Cursor::new(ptr::null()),
            registration: None,
            phase: Phase::Fresh,
        }
    }

    fn try_next(&mut self) -> Result<Option<(K, Arc<V>)>, Error> {
        loop {
            match self.phase {
                Phase::Done => return Ok(None),
                Phase::Fresh => {
                    self.registration = Some(self.map.iterators.register());
                    let table = self.map.stable_table(&self.guard);
                    self.cursor = Cursor::new(table.as_raw());
                    self.phase = Phase::Live;
                    continue;
                }
                Phase::Live => {
                    let live = self.map.stable_table(&self.guard);
                    if live.as_raw() != self.cursor.table {
                        self.resync()?;
                        self.phase = Phase::Detached;
                        continue;
                    }
                }
                Phase::Detached => {}
            }

            let (index, last) = (self.cursor.index, self.cursor.last);
            // safety: the table and the entries reached from it were loaded
            // while `self.guard` was pinned.
            let next = unsafe { self.cursor.advance(&self.guard) };

            if self.phase == Phase::Live {
                let now = self.map.table.load(Ordering::Acquire, &self.guard);
                if now.tag() != 0 || now.as_raw() != self.cursor.table {
                    // the step may have followed a link rewritten by growth
                    self.cursor.index = index;
                    self.cursor.last = last;
                    continue;
                }
            }

            match next {
                None => {
                    self.finish();
                    return Ok(None);
                }
                Some(entry) => {
                    // safety: see above.
                    let entry = unsafe { &*entry };
                    if let Some(value) = entry.mapping(&self.guard) {
                        return Ok(Some((entry.key.clone(), value)));
                    }
                }
            }
        }
    }

    /// Move the cursor from the entry it stopped at to that entry's copy in
    /// the snapshot.
    fn resync(&mut self) -> Result<(), Error> {
        // safety: `last` was reached while `self.guard` was pinned.
        let Some(last) = (unsafe { self.cursor.last.as_ref() }) else {
            // between buckets: the snapshot's bucket head is the right place
            return Ok(());
        };
        // safety: the old table is retired, not freed, while we are pinned.
        let table = unsafe { &*self.cursor.table };
        // by identity: a key removed and re-inserted is a different entry
        let copy = table
            .chain(self.cursor.index, &self.guard)
            .find(|entry| entry.is_copy_of(last))
            .map(|entry| entry as *const Entry<K, V>);

        match copy {
            Some(copy) => {
                log::trace!("safe map iterator resynchronized after growth");
                self.cursor.last = copy;
                Ok(())
            }
            None => {
                self.finish();
                Err(Error::ResyncFailed)
            }
        }
    }

    fn finish(&mut self) {
        self.phase = Phase::Done;
        if let Some(id) = self.registration.take() {
            self.map.iterators.deregister(id);
        }
    }
}

impl<'a, K, V, S> Iterator for SafeIter<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = Result<(K, Arc<V>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

impl<'a, K, V, S> FusedIterator for SafeIter<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
}

impl<K, V, S> Drop for SafeIter<'_, K, V, S> {
    fn drop(&mut self) {
        if let Some(id) = self.registration.take() {
            self.map.iterators.deregister(id);
        }
    }
}

/// Iterator over a [`SegmentedHashMap`].
///
/// Yields each stored mapping; reserved keys are skipped. While the iterator
/// is registered the map does not grow, so every entry present for the whole
/// walk is yielded exactly once.
///
/// The iterator keeps an epoch guard pinned until it is dropped, which stops
/// memory retired through `crossbeam-epoch` anywhere in the process from
/// being reclaimed. Drop it promptly rather than parking or leaking it; a
/// leaked iterator also keeps the map from ever growing again.
pub struct SegmentedIter<'a, K, V, S = DefaultHashBuilder> {
    map: &'a SegmentedHashMap<K, V, S>,
    guard: Guard,
    cursor: Option<Cursor<K, V>>,
    registration: Option<u64>,
    done: bool,
}

impl<'a, K, V, S> SegmentedIter<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    pub(crate) fn new(map: &'a SegmentedHashMap<K, V, S>) -> Self {
        Self {
            map,
            guard: epoch::pin(),
            cursor: None,
            registration: None,
            done: false,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(id) = self.registration.take() {
            self.map.iterators.deregister(id);
        }
    }
}

impl<'a, K, V, S> Iterator for SegmentedIter<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = (K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let map = self.map;
        let guard = &self.guard;
        let registration = &mut self.registration;
        let cursor = self.cursor.get_or_insert_with(|| {
            *registration = Some(map.iterators.register());
            Cursor::new(map.stable_table(guard).as_raw())
        });

        loop {
            // safety: growth is held off while we are registered, and the
            // table and its entries were loaded under `self.guard`.
            match unsafe { cursor.advance(&self.guard) } {
                None => break,
                Some(entry) => {
                    let entry = unsafe { &*entry };
                    if let Some(value) = entry.mapping(&self.guard) {
                        return Some((entry.key.clone(), value));
                    }
                }
            }
        }
        self.finish();
        None
    }
}

impl<'a, K, V, S> FusedIterator for SegmentedIter<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
}

impl<K, V, S> Drop for SegmentedIter<'_, K, V, S> {
    fn drop(&mut self) {
        if let Some(id) = self.registration.take() {
            self.map.iterators.deregister(id);
        }
    }
}

/// Iterator over the keys of a map.
pub struct Keys<I> {
    inner: I,
}

impl<I> Keys<I> {
    pub(crate) fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<'a, K, V, S> Iterator for Keys<SafeIter<'a, K, V, S>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = Result<K, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next()?.map(|(key, _)| key))
    }
}

impl<'a, K, V, S> Iterator for Keys<SegmentedIter<'a, K, V, S>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(key, _)| key)
    }
}

/// Iterator over the values of a map.
pub struct Values<I> {
    inner: I,
}

impl<I> Values<I> {
    pub(crate) fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<'a, K, V, S> Iterator for Values<SafeIter<'a, K, V, S>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = Result<Arc<V>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next()?.map(|(_, value)| value))
    }
}

impl<'a, K, V, S> Iterator for Values<SegmentedIter<'a, K, V, S>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = Arc<V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use crate::{MapBuilder, SafeHashMap, SegmentedHashMap};
    use std::collections::HashSet;

    fn tiny_safe() -> SafeHashMap<u32, u32> {
        MapBuilder::new()
            .initial_buckets(2)
            .unwrap()
            .growth_rate(1.0)
            .unwrap()
            .build_safe()
            .unwrap()
    }

    #[test]
    fn test_empty_maps() {
        let safe: SafeHashMap<u32, u32> = SafeHashMap::new();
        assert!(safe.iter().next().is_none());
        let segmented: SegmentedHashMap<u32, u32> = SegmentedHashMap::new();
        assert!(segmented.iter().next().is_none());
    }

    #[test]
    fn test_registration_follows_lifetime() {
        let map = tiny_safe();
        map.insert(1, 1);
        map.insert(2, 2);

        let mut iter = map.iter();
        assert_eq!(map.stats().active_iterators, 0);
        iter.next();
        assert_eq!(map.stats().active_iterators, 1);
        drop(iter);
        assert_eq!(map.stats().active_iterators, 0);

        let mut iter = map.iter();
        while iter.next().is_some() {}
        assert_eq!(map.stats().active_iterators, 0);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_survives_growth_mid_walk() {
        let map = tiny_safe();
        for i in 0..3 {
            map.insert(i, i);
        }
        let mut iter = map.iter();
        let mut seen = HashSet::new();
        let (key, _) = iter.next().unwrap().unwrap();
        seen.insert(key);

        let buckets = map.bucket_count();
        for i in 100..400 {
            map.insert(i, i);
        }
        assert!(map.bucket_count() > buckets);

        for item in iter {
            let (key, _) = item.unwrap();
            assert!(seen.insert(key), "key {} yielded twice", key);
        }
        for i in 0..3 {
            assert!(seen.contains(&i));
        }
    }

    #[test]
    fn test_resync_fails_when_position_removed() {
        let map = tiny_safe();
        for i in 0..3 {
            map.insert(i, i);
        }
        let mut iter = map.iter();
        let (key, _) = iter.next().unwrap().unwrap();
        map.remove(&key);
        for i in 100..400 {
            map.insert(i, i);
        }

        assert_eq!(iter.next(), Some(Err(crate::Error::ResyncFailed)));
        assert!(iter.next().is_none());
        assert_eq!(map.stats().active_iterators, 0);
    }

    #[test]
    fn test_adapters() {
        let map = SegmentedHashMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        map.reserve("c");
        let mut keys: Vec<_> = map.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(map.values().map(|v| *v).sum::<i32>(), 3);

        let safe = SafeHashMap::new();
        safe.insert("x", 10);
        assert_eq!(safe.keys().collect::<Result<Vec<_>, _>>().unwrap(), vec!["x"]);
        assert_eq!(*safe.values().next().unwrap().unwrap(), 10);
    }
}
