use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Set of iterators currently walking a map.
///
/// Iterators register before they take their first look at the bucket array
/// and deregister when they are exhausted or dropped. Growth consults
/// [`is_active`](Self::is_active) after tagging the table as growing, so an
/// iterator either shows up here or sees the tag.
#[derive(Default)]
pub(crate) struct IteratorRegistry {
    next_id: AtomicU64,
    active: Mutex<HashSet<u64>>,
}

impl IteratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(id);
        id
    }

    pub fn deregister(&self, id: u64) {
        self.active.lock().remove(&id);
    }

    pub fn is_active(&self) -> bool {
        !self.active.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }
}
