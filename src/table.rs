//! The bucket array.
//!
//! A [`Table`] is a fixed-length array of chain heads. Maps never resize one
//! in place; growth builds a new table, moves every entry across and then
//! publishes the new table through the map's `Atomic<Table>`. While that is
//! happening the published pointer carries the [`GROWING`] tag.

use crate::entry::Entry;
use crate::error::Error;
use crate::hash::bucket_index;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::borrow::Borrow;
use std::sync::atomic::Ordering;

/// Tag on a map's table pointer meaning "a resize is in progress".
pub(crate) const GROWING: usize = 1;

#[cfg(test)]
thread_local! {
    static FAIL_ALLOCATIONS: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make [`Table::try_new`] fail on the current thread while `fail` is set.
#[cfg(test)]
pub(crate) fn fail_allocations(fail: bool) {
    FAIL_ALLOCATIONS.with(|flag| flag.set(fail));
}

pub(crate) struct Table<K, V> {
    buckets: Box<[Atomic<Entry<K, V>>]>,
}

impl<K, V> Table<K, V>
where
    V: Send + Sync,
{
    pub fn with_len(len: usize) -> Self {
        Self {
            buckets: (0..len).map(|_| Atomic::null()).collect(),
        }
    }

    /// Allocate `len` empty buckets, reporting allocation failure instead of
    /// aborting.
    pub fn try_new(len: usize) -> Result<Self, Error> {
        #[cfg(test)]
        if FAIL_ALLOCATIONS.with(|flag| flag.get()) {
            return Err(Error::Allocation { buckets: len });
        }
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(len)
            .map_err(|_| Error::Allocation { buckets: len })?;
        buckets.resize_with(len, Atomic::null);
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn index(&self, hash: u64) -> usize {
        bucket_index(hash, self.buckets.len())
    }

    #[inline]
    pub fn bucket(&self, index: usize) -> &Atomic<Entry<K, V>> {
        &self.buckets[index]
    }

    /// Entries of one bucket, head first.
    pub fn chain<'g>(&'g self, index: usize, guard: &'g Guard) -> Chain<'g, K, V> {
        Chain {
            current: self.buckets[index].load(Ordering::Acquire, guard),
            guard,
        }
    }

    /// Find the entry for `key`, synthetic or not.
    pub fn find<'g, Q>(&'g self, hash: u64, key: &Q, guard: &'g Guard) -> Option<&'g Entry<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.chain(self.index(hash), guard)
            .find(|entry| entry.hash == hash && entry.key.borrow() == key)
    }

    /// Find the entry for `key` along with the link that points at it.
    pub fn locate<'g, Q>(
        &'g self,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> Option<(&'g Atomic<Entry<K, V>>, Shared<'g, Entry<K, V>>)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut link = &self.buckets[self.index(hash)];
        let mut current = link.load(Ordering::Acquire, guard);
        // safety: chain entries are retired through `guard` and so outlive it.
        while let Some(entry) = unsafe { current.as_ref() } {
            if entry.hash == hash && entry.key.borrow() == key {
                return Some((link, current));
            }
            link = &entry.next;
            current = entry.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Prepend `entry` to bucket `index`. Caller holds the lock covering it.
    pub fn push_front<'g>(
        &self,
        index: usize,
        entry: Owned<Entry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, Entry<K, V>> {
        let bucket = &self.buckets[index];
        entry
            .next
            .store(bucket.load(Ordering::Relaxed, guard), Ordering::Relaxed);
        let entry = entry.into_shared(guard);
        bucket.store(entry, Ordering::Release);
        entry
    }

    /// Splice `entry` out of its chain by pointing `link` past it. Caller
    /// holds the lock covering the chain and is responsible for retiring the
    /// entry.
    pub fn unlink(link: &Atomic<Entry<K, V>>, entry: Shared<'_, Entry<K, V>>, guard: &Guard) {
        // safety: `entry` was loaded through `guard` from a live chain.
        let next = unsafe { entry.deref() }.next.load(Ordering::Acquire, guard);
        link.store(next, Ordering::Release);
    }

    /// Detach every chain, returning the former heads. Caller holds every
    /// lock covering this table.
    pub fn detach_all<'g>(&self, guard: &'g Guard) -> Vec<Shared<'g, Entry<K, V>>> {
        self.buckets
            .iter()
            .map(|bucket| bucket.swap(Shared::null(), Ordering::AcqRel, guard))
            .filter(|head| !head.is_null())
            .collect()
    }

    /// Move every entry into `target`, calling `moved` with each entry and
    /// its new bucket index.
    ///
    /// Before a chain is moved, its old bucket is pointed at whatever
    /// `leave_behind` returns for the chain head: null to empty the bucket,
    /// or a [`copy_chain`] so the old table stays a readable snapshot of the
    /// map as it was before the move.
    ///
    /// Caller holds every lock covering both tables and keeps this table's
    /// pointer tagged [`GROWING`] for the duration.
    pub fn migrate_into<'g, L, F>(
        &self,
        target: &Table<K, V>,
        guard: &'g Guard,
        mut leave_behind: L,
        mut moved: F,
    ) where
        K: 'g,
        V: 'g,
        L: FnMut(Shared<'g, Entry<K, V>>) -> Shared<'g, Entry<K, V>>,
        F: FnMut(&Entry<K, V>, usize),
    {
        for bucket in self.buckets.iter() {
            let head = bucket.load(Ordering::Acquire, guard);
            if head.is_null() {
                continue;
            }
            bucket.store(leave_behind(head), Ordering::Release);

            let mut current = head;
            // safety: entries cannot be retired while every lock is held.
            while let Some(entry) = unsafe { current.as_ref() } {
                let next = entry.next.load(Ordering::Acquire, guard);
                let index = target.index(entry.hash);
                let new_bucket = &target.buckets[index];
                entry
                    .next
                    .store(new_bucket.load(Ordering::Relaxed, guard), Ordering::Release);
                new_bucket.store(current, Ordering::Release);
                moved(entry, index);
                current = next;
            }
        }
    }
}

/// Copy a chain, keeping its order. The copies share the originals' values.
pub(crate) fn copy_chain<'g, K, V>(
    head: Shared<'g, Entry<K, V>>,
    guard: &'g Guard,
) -> Shared<'g, Entry<K, V>>
where
    K: Clone,
    V: Send + Sync,
{
    let originals: Vec<&Entry<K, V>> = Chain {
        current: head,
        guard,
    }
    .collect();

    let mut copy = Shared::null();
    for entry in originals.into_iter().rev() {
        let node = Owned::new(entry.snapshot(guard));
        node.next.store(copy, Ordering::Relaxed);
        copy = node.into_shared(guard);
    }
    copy
}

/// Retire every entry of a detached chain: release its value and defer
/// destruction of the node.
pub(crate) fn retire_chain<K, V>(head: Shared<'_, Entry<K, V>>, guard: &Guard)
where
    V: Send + Sync,
{
    let mut current = head;
    // safety: the chain is detached under the covering locks, so each entry
    // is retired exactly once.
    while let Some(entry) = unsafe { current.as_ref() } {
        let next = entry.next.load(Ordering::Acquire, guard);
        entry.retire(guard);
        unsafe { guard.defer_destroy(current) };
        current = next;
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // safety: a table is dropped either by its owning map with `&mut`
        // access or by the epoch collector once no reader can reach it, and
        // whatever chains its buckets still point at belong to it alone.
        let guard = unsafe { epoch::unprotected() };
        for bucket in self.buckets.iter() {
            let mut current = bucket.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let entry = unsafe { current.into_owned() };
                current = entry.next.load(Ordering::Relaxed, guard);
                drop(entry);
            }
        }
    }
}

/// Iterator over one bucket chain.
pub(crate) struct Chain<'g, K, V> {
    current: Shared<'g, Entry<K, V>>,
    guard: &'g Guard,
}

impl<'g, K, V> Iterator for Chain<'g, K, V> {
    type Item = &'g Entry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        // safety: chain entries are retired through the epoch collector, so
        // they stay allocated while `guard` is pinned.
        let entry = unsafe { self.current.as_ref() }?;
        self.current = entry.next.load(Ordering::Acquire, self.guard);
        Some(entry)
    }
}
