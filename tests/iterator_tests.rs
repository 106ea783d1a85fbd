use stablemap::{Error, MapBuilder, SafeHashMap, SegmentedHashMap};
use std::collections::HashSet;
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::{Arc, Barrier};
use std::thread;

/// Sends every key to bucket 0.
#[derive(Default)]
struct SameHash;

impl Hasher for SameHash {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, _bytes: &[u8]) {}
}

fn one_bucket_safe() -> SafeHashMap<u32, u32, BuildHasherDefault<SameHash>> {
    SafeHashMap::with_hasher(BuildHasherDefault::default())
}

fn small_safe() -> SafeHashMap<u32, u32> {
    MapBuilder::new()
        .initial_buckets(4)
        .unwrap()
        .growth_rate(1.0)
        .unwrap()
        .build_safe()
        .unwrap()
}

fn small_segmented() -> SegmentedHashMap<u32, u32> {
    MapBuilder::new()
        .initial_buckets(4)
        .unwrap()
        .growth_rate(1.0)
        .unwrap()
        .build_segmented()
        .unwrap()
}

#[test]
fn test_safe_iteration_across_growth() {
    let map = small_safe();
    for i in 0..50 {
        map.insert(i, i);
    }
    let resizes = map.stats().resizes;

    let mut seen = HashSet::new();
    let mut iter = map.iter();
    for _ in 0..25 {
        let (key, _) = iter.next().unwrap().unwrap();
        assert!(seen.insert(key));
    }

    for i in 1000..1200 {
        map.insert(i, i);
    }
    assert!(map.stats().resizes > resizes);

    for item in iter {
        let (key, _) = item.unwrap();
        assert!(seen.insert(key), "key {} yielded twice", key);
    }
    assert!(seen.iter().all(|k| *k < 50 || (1000..1200).contains(k)));
    // everything present for the whole walk was yielded
    assert!((0..50).all(|k| seen.contains(&k)));
}

#[test]
fn test_segmented_iteration_with_inserts() {
    let map = small_segmented();
    for i in 0..50 {
        map.insert(i, i);
    }
    let buckets = map.bucket_count();

    let mut seen = HashSet::new();
    let mut iter = map.iter();
    for _ in 0..25 {
        let (key, _) = iter.next().unwrap();
        assert!(seen.insert(key));
    }
    for i in 1000..1200 {
        map.insert(i, i);
    }
    // growth waits for the iterator
    assert_eq!(map.bucket_count(), buckets);

    for (key, _) in iter {
        assert!(seen.insert(key), "key {} yielded twice", key);
    }
    assert!((0..50).all(|k| seen.contains(&k)));
    assert!(seen.iter().all(|k| *k < 50 || (1000..1200).contains(k)));

    // the map is over capacity, so the next new key grows it
    map.insert(5000, 5000);
    assert!(map.bucket_count() > buckets);
}

#[test]
fn test_removal_mid_iteration() {
    let safe = SafeHashMap::new();
    let segmented = SegmentedHashMap::new();
    for i in 0..100 {
        safe.insert(i, i);
        segmented.insert(i, i);
    }

    let mut safe_seen = HashSet::new();
    let mut safe_iter = safe.iter();
    let mut segmented_seen = HashSet::new();
    let mut segmented_iter = segmented.iter();
    for _ in 0..50 {
        safe_seen.insert(safe_iter.next().unwrap().unwrap().0);
        segmented_seen.insert(segmented_iter.next().unwrap().0);
    }

    thread::scope(|scope| {
        scope.spawn(|| {
            for i in (0..100).step_by(3) {
                safe.remove(&i);
                segmented.remove(&i);
            }
        });
    });

    for item in safe_iter {
        assert!(safe_seen.insert(item.unwrap().0));
    }
    for (key, _) in segmented_iter {
        assert!(segmented_seen.insert(key));
    }
    // every key not removed was yielded
    for i in (0..100).filter(|i| i % 3 != 0) {
        assert!(safe_seen.contains(&i));
        assert!(segmented_seen.contains(&i));
    }
}

#[test]
fn test_reservations_are_not_yielded() {
    let map = SegmentedHashMap::new();
    for i in 0..10 {
        map.insert(i, i);
    }
    for i in 10..20 {
        map.reserve(i);
    }
    let keys: HashSet<_> = map.keys().collect();
    assert_eq!(keys, (0..10).collect());
}

#[test]
fn test_values_are_read_when_reached() {
    let map = SafeHashMap::new();
    map.insert(1, "old");
    let mut iter = map.iter();
    map.insert(1, "new");
    let (_, value) = iter.next().unwrap().unwrap();
    assert_eq!(*value, "new");
}

#[test]
fn test_safe_resync_continues_after_growth() {
    let map = one_bucket_safe();
    for i in 1..=3 {
        map.insert(i, i);
    }
    // chains are head first
    let mut iter = map.iter();
    assert_eq!(iter.next().unwrap().unwrap().0, 3);
    assert_eq!(iter.next().unwrap().unwrap().0, 2);

    let buckets = map.bucket_count();
    for i in 100..120 {
        map.insert(i, i);
    }
    assert!(map.bucket_count() > buckets);

    let rest: Vec<u32> = iter.map(|item| item.unwrap().0).collect();
    assert_eq!(rest, vec![1]);
}

#[test]
fn test_safe_resync_fails_when_entry_was_replaced() {
    let map = one_bucket_safe();
    for i in 1..=3 {
        map.insert(i, i);
    }
    let mut iter = map.iter();
    assert_eq!(iter.next().unwrap().unwrap().0, 3);
    assert_eq!(iter.next().unwrap().unwrap().0, 2);

    // same key, new entry at the head of the chain
    map.remove(&2);
    map.insert(2, 99);
    let buckets = map.bucket_count();
    for i in 100..120 {
        map.insert(i, i);
    }
    assert!(map.bucket_count() > buckets);

    let rest: Vec<_> = iter.collect();
    assert_eq!(rest, vec![Err(Error::ResyncFailed)]);
    assert_eq!(map.stats().active_iterators, 0);
}

#[test]
fn test_iterators_with_concurrent_writers() {
    const WRITES: u32 = 20_000;

    let safe = Arc::new(small_safe());
    let segmented = Arc::new(small_segmented());
    for i in 0..1000 {
        safe.insert(i, i);
        segmented.insert(i, i);
    }
    let start = Arc::new(Barrier::new(3));

    let writers: Vec<_> = (0..2u32)
        .map(|t| {
            let safe = Arc::clone(&safe);
            let segmented = Arc::clone(&segmented);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..WRITES {
                    let key = 10_000 + t * 1_000_000 + i;
                    safe.insert(key, key);
                    segmented.insert(key, key);
                    if i % 2 == 1 {
                        safe.remove(&(key - 1));
                        segmented.remove(&(key - 1));
                    }
                }
            })
        })
        .collect();

    start.wait();
    for _ in 0..20 {
        let mut seen = HashSet::new();
        for item in safe.iter() {
            match item {
                Ok((key, value)) => {
                    assert_eq!(key, *value);
                    assert!(seen.insert(key));
                }
                // the cursor's entry was removed before a resize; allowed
                Err(Error::ResyncFailed) => break,
                Err(err) => panic!("unexpected error: {}", err),
            }
        }

        let mut seen = HashSet::new();
        for (key, value) in segmented.iter() {
            assert_eq!(key, *value);
            assert!(seen.insert(key));
        }
        assert!((0..1000).all(|k| seen.contains(&k)));
    }

    for writer in writers {
        writer.join().unwrap();
    }
    assert_eq!(safe.len(), 1000 + WRITES as usize);
    assert_eq!(segmented.len(), 1000 + WRITES as usize);
    assert_eq!(safe.stats().active_iterators, 0);
    assert_eq!(segmented.stats().active_iterators, 0);
}
