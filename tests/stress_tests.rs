//! Load tests: concurrent inserts and removes against both engines, then
//! verify state and introspection.

use stablemap::{MapBuilder, SafeHashMap, SegmentedHashMap};
use std::sync::Arc;
use std::thread;

#[test]
fn test_safe_under_load_then_introspect() {
    let map: Arc<SafeHashMap<String, usize>> = Arc::new(SafeHashMap::new());
    let mut handles = vec![];

    for t in 0..4 {
        let map = Arc::clone(&map);
        let handle = thread::spawn(move || {
            for i in 0..2000 {
                let key = format!("t{}_k{}", t, i);
                map.insert(key, i);
            }
            for i in 0..2000 {
                let key = format!("t{}_k{}", t, i);
                let _ = map.remove(&key);
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.iter().count(), 0);
    assert!(map.stats().resizes > 0);
}

#[test]
fn test_segmented_under_load_then_introspect() {
    let map: Arc<SegmentedHashMap<String, usize>> = Arc::new(SegmentedHashMap::new());
    let mut handles = vec![];

    for t in 0..4 {
        let map = Arc::clone(&map);
        let handle = thread::spawn(move || {
            for i in 0..2000 {
                let key = format!("t{}_k{}", t, i);
                map.insert(key, i);
            }
            for i in 0..2000 {
                let key = format!("t{}_k{}", t, i);
                let _ = map.remove(&key);
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(map.is_empty());
    let stats = map.stats();
    assert_eq!(stats.segments.iter().map(|s| s.entries).sum::<usize>(), 0);
    assert!(stats.resizes > 0);
}

#[test]
fn test_mixed_workload_keeps_last_writes() {
    let map = Arc::new(
        MapBuilder::new()
            .initial_buckets(2)
            .unwrap()
            .build_segmented::<u64, u64>()
            .unwrap(),
    );
    let safe = Arc::new(
        MapBuilder::new()
            .initial_buckets(2)
            .unwrap()
            .build_safe::<u64, u64>()
            .unwrap(),
    );

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let map = Arc::clone(&map);
            let safe = Arc::clone(&safe);
            thread::spawn(move || {
                // each thread owns its keys, so the final value is known
                for round in 0..5u64 {
                    for i in 0..1000u64 {
                        let key = t * 10_000 + i;
                        map.insert(key, round);
                        safe.insert(key, round);
                        let _ = map.get(&(key ^ 1));
                        let _ = safe.get(&(key ^ 1));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), 8000);
    assert_eq!(safe.len(), 8000);
    for t in 0..8u64 {
        for i in 0..1000u64 {
            let key = t * 10_000 + i;
            assert_eq!(*map.get(&key).unwrap(), 4);
            assert_eq!(*safe.get(&key).unwrap(), 4);
        }
    }
}
