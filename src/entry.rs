//! Entry nodes shared by both map engines.
//!
//! An [`Entry`] lives in exactly one bucket chain. Its key and hash never
//! change; its value sits in a [`ValueSlot`] that lock-free writers may swap
//! at any time, and its `next` link is only rewritten by the thread holding
//! the lock that covers the chain.

use crossbeam_epoch::{Atomic, Guard};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle tag of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum EntryState {
    /// Holds a stored mapping.
    Live = 0,
    /// Reserves a key without holding a mapping.
    Synthetic = 1,
    /// Unlinked from its chain; waiting for reclamation.
    Removed = 2,
}

impl EntryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => EntryState::Live,
            1 => EntryState::Synthetic,
            _ => EntryState::Removed,
        }
    }
}

/// Atomic cell holding an optional `Arc<V>`.
///
/// A null slot means "no value": the entry is synthetic or has been removed.
/// The slot owns one strong count of whatever it points to. Counts it gives
/// up are released through the epoch collector, so a reader pinned before the
/// swap can still take its own count safely.
pub(crate) struct ValueSlot<V> {
    ptr: AtomicPtr<V>,
    _owns: PhantomData<Arc<V>>,
}

impl<V> ValueSlot<V>
where
    V: Send + Sync,
{
    pub fn new(value: Option<Arc<V>>) -> Self {
        Self {
            ptr: AtomicPtr::new(into_raw(value)),
            _owns: PhantomData,
        }
    }

    /// Clone out the current value.
    pub fn load(&self, _guard: &Guard) -> Option<Arc<V>> {
        let raw = self.ptr.load(Ordering::Acquire);
        // safety: a non-null pointer came from `Arc::into_raw` and the count
        // it represents is only released after every guard pinned before the
        // release point is dropped. We hold such a guard.
        unsafe { clone_raw(raw) }
    }

    /// Replace the value only if one is present.
    ///
    /// Returns the previous value, or hands `value` back if the slot was
    /// empty (synthetic or removed), in which case the caller must fall back
    /// to the locked path.
    pub fn replace_present(&self, value: Arc<V>, guard: &Guard) -> Result<Arc<V>, Arc<V>> {
        let new = Arc::into_raw(value) as *mut V;
        let mut current = self.ptr.load(Ordering::Acquire);
        loop {
            if current.is_null() {
                // safety: `new` came from `Arc::into_raw` above and was never published.
                return Err(unsafe { Arc::from_raw(new) });
            }
            match self
                .ptr
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                // safety: we just unpublished the non-null `current` while pinned.
                Ok(_) => return Ok(unsafe { retire(current, guard) }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Unconditionally store `value`, returning whatever was there.
    pub fn swap(&self, value: Option<Arc<V>>, guard: &Guard) -> Option<Arc<V>> {
        let old = self.ptr.swap(into_raw(value), Ordering::AcqRel);
        if old.is_null() {
            return None;
        }
        // safety: `old` was published in this slot and is now unreachable from it.
        Some(unsafe { retire(old, guard) })
    }

    /// Empty the slot, returning the value it held.
    pub fn take(&self, guard: &Guard) -> Option<Arc<V>> {
        self.swap(None, guard)
    }
}

impl<V> Drop for ValueSlot<V> {
    fn drop(&mut self) {
        let raw = *self.ptr.get_mut();
        if !raw.is_null() {
            // safety: the slot owns this count and nobody can reach the slot anymore.
            drop(unsafe { Arc::from_raw(raw as *const V) });
        }
    }
}

fn into_raw<V>(value: Option<Arc<V>>) -> *mut V {
    value.map_or(ptr::null_mut(), |v| Arc::into_raw(v) as *mut V)
}

/// # Safety
///
/// `raw` must be null or a pointer obtained from `Arc::into_raw` whose count
/// is kept alive for the duration of the call.
unsafe fn clone_raw<V>(raw: *mut V) -> Option<Arc<V>> {
    if raw.is_null() {
        return None;
    }
    Arc::increment_strong_count(raw as *const V);
    Some(Arc::from_raw(raw as *const V))
}

/// Hand the caller a fresh count of `raw` and give the slot's own count to
/// the epoch collector.
///
/// # Safety
///
/// `raw` must be a non-null pointer the slot owned a count of and has just
/// unpublished.
unsafe fn retire<V: Send + Sync>(raw: *mut V, guard: &Guard) -> Arc<V> {
    Arc::increment_strong_count(raw as *const V);
    let value = Arc::from_raw(raw as *const V);
    let owned = raw as usize;
    guard.defer_unchecked(move || drop(Arc::from_raw(owned as *const V)));
    value
}

/// A node in a bucket chain.
pub(crate) struct Entry<K, V> {
    pub hash: u64,
    pub key: K,
    pub value: ValueSlot<V>,
    pub next: Atomic<Entry<K, V>>,
    state: AtomicU8,
    /// Address of the entry this one was copied from; zero for originals.
    origin: usize,
}

impl<K, V> Entry<K, V>
where
    V: Send + Sync,
{
    pub fn new(hash: u64, key: K, value: Arc<V>) -> Self {
        Self {
            hash,
            key,
            value: ValueSlot::new(Some(value)),
            next: Atomic::null(),
            state: AtomicU8::new(EntryState::Live as u8),
            origin: 0,
        }
    }

    pub fn synthetic(hash: u64, key: K) -> Self {
        Self {
            hash,
            key,
            value: ValueSlot::new(None),
            next: Atomic::null(),
            state: AtomicU8::new(EntryState::Synthetic as u8),
            origin: 0,
        }
    }

    /// Copy of this entry carrying the same key, hash, value and state, with
    /// no successor. The copy remembers which entry it came from.
    pub fn snapshot(&self, guard: &Guard) -> Self
    where
        K: Clone,
    {
        Self {
            hash: self.hash,
            key: self.key.clone(),
            value: ValueSlot::new(self.value.load(guard)),
            next: Atomic::null(),
            state: AtomicU8::new(self.state.load(Ordering::Acquire)),
            origin: self as *const Self as usize,
        }
    }

    /// Whether this entry is a [`snapshot`](Self::snapshot) of `original`.
    pub fn is_copy_of(&self, original: *const Self) -> bool {
        self.origin != 0 && self.origin == original as usize
    }

    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_synthetic(&self) -> bool {
        self.state() == EntryState::Synthetic
    }

    /// Turn a synthetic entry into a live one holding `value`.
    pub fn promote(&self, value: Arc<V>, guard: &Guard) {
        debug_assert!(self.is_synthetic());
        self.value.swap(Some(value), guard);
        self.set_state(EntryState::Live);
    }

    /// Mark an unlinked entry removed and release its value.
    pub fn retire(&self, guard: &Guard) -> Option<Arc<V>> {
        self.set_state(EntryState::Removed);
        self.value.take(guard)
    }

    /// The stored mapping, if this entry currently holds one.
    pub fn mapping(&self, guard: &Guard) -> Option<Arc<V>> {
        match self.state() {
            EntryState::Live => self.value.load(guard),
            EntryState::Synthetic | EntryState::Removed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn test_replace_present() {
        let guard = &epoch::pin();
        let entry = Entry::new(7, "k", Arc::new(1));
        let old = entry.value.replace_present(Arc::new(2), guard).unwrap();
        assert_eq!(*old, 1);
        assert_eq!(*entry.mapping(guard).unwrap(), 2);
    }

    #[test]
    fn test_replace_refused_when_empty() {
        let guard = &epoch::pin();
        let entry: Entry<&str, i32> = Entry::synthetic(7, "k");
        let rejected = entry.value.replace_present(Arc::new(5), guard).unwrap_err();
        assert_eq!(*rejected, 5);
        assert!(entry.mapping(guard).is_none());
    }

    #[test]
    fn test_promote_and_retire() {
        let guard = &epoch::pin();
        let entry: Entry<&str, i32> = Entry::synthetic(7, "k");
        entry.promote(Arc::new(3), guard);
        assert_eq!(entry.state(), EntryState::Live);
        assert_eq!(*entry.mapping(guard).unwrap(), 3);

        assert_eq!(*entry.retire(guard).unwrap(), 3);
        assert_eq!(entry.state(), EntryState::Removed);
        assert!(entry.value.load(guard).is_none());
    }

    #[test]
    fn test_snapshot_shares_value() {
        let guard = &epoch::pin();
        let value = Arc::new(String::from("v"));
        let entry = Entry::new(1, 10u32, Arc::clone(&value));
        let copy = entry.snapshot(guard);
        assert_eq!(copy.key, 10);
        assert!(copy.is_copy_of(&entry));
        assert!(!entry.is_copy_of(&entry));
        let twin = Entry::new(1, 10u32, Arc::clone(&value));
        assert!(!copy.is_copy_of(&twin));
        assert!(Arc::ptr_eq(&copy.mapping(guard).unwrap(), &value));
        // updating the original leaves the copy alone
        entry.value.swap(Some(Arc::new(String::from("w"))), guard);
        assert_eq!(*copy.mapping(guard).unwrap(), "v");
    }

    #[test]
    fn test_slot_releases_counts() {
        let value = Arc::new(0u8);
        {
            let guard = &epoch::pin();
            let slot = ValueSlot::new(Some(Arc::clone(&value)));
            let seen = slot.load(guard).unwrap();
            assert!(Arc::ptr_eq(&seen, &value));
        }
        // the slot's own count went away with it
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
