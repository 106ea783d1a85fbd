use stablemap::{MapBuilder, SegmentedHashMap, SEGMENT_COUNT};
use std::sync::Arc;
use std::thread;

#[test]
fn test_segment_isolation() {
    // Large enough that every segment owns at least one bucket
    let map = MapBuilder::new()
        .initial_buckets(1000)
        .unwrap()
        .build_segmented::<String, i32>()
        .unwrap();

    for i in 0..5000 {
        map.insert(format!("key_{}", i), i);
    }

    let stats = map.stats();
    assert_eq!(stats.segments.len(), SEGMENT_COUNT);

    // Verify all entries are accounted for
    let total: usize = stats.segments.iter().map(|s| s.entries).sum();
    assert_eq!(total, 5000);

    // Every segment got some of the keys
    assert!(stats.segments.iter().all(|s| s.entries > 0));
    assert!(stats.segments.iter().all(|s| !s.contended));
}

#[test]
fn test_small_table_uses_few_segments() {
    let map = MapBuilder::new()
        .initial_buckets(5)
        .unwrap()
        .load_factor(100.0)
        .unwrap()
        .build_segmented::<u32, u32>()
        .unwrap();
    for i in 0..100 {
        map.insert(i, i);
    }
    assert_eq!(map.bucket_count(), 5);
    let stats = map.stats();
    // bucket i belongs to segment i % 61
    assert!(stats.segments[5..].iter().all(|s| s.entries == 0));
    assert_eq!(stats.segments[..5].iter().map(|s| s.entries).sum::<usize>(), 100);
}

#[test]
fn test_counts_follow_removals() {
    let map = SegmentedHashMap::new();
    for i in 0..1000 {
        map.insert(i, i);
    }
    for i in (0..1000).step_by(2) {
        assert_eq!(*map.remove(&i).unwrap(), i);
    }
    let stats = map.stats();
    assert_eq!(stats.len, 500);
    assert_eq!(stats.segments.iter().map(|s| s.entries).sum::<usize>(), 500);
}

#[test]
fn test_disjoint_writers_with_whole_table_operations() {
    let map = Arc::new(
        MapBuilder::new()
            .bulk_insert_threshold(10)
            .build_segmented::<u64, u64>()
            .unwrap(),
    );
    let mut handles = vec![];

    for t in 0..8u64 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..2000 {
                let key = t * 1_000_000 + i;
                map.insert(key, i);
                if i % 4 == 0 {
                    map.remove(&key);
                }
            }
        }));
    }

    // bulk batches lock every segment while the writers run
    {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for batch in 0..20u64 {
                let start = 100_000_000 + batch * 50;
                map.insert_all((start..start + 50).map(|k| (k, k)));
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), 8 * 1500 + 20 * 50);
    assert_eq!(map.iter().count(), map.len());
}

#[cfg(feature = "metrics")]
#[test]
fn test_lock_counters() {
    let map = SegmentedHashMap::new();
    for i in 0..100 {
        map.insert(i, i);
    }
    let acquisitions: u64 = map.stats().segments.iter().map(|s| s.lock.acquisitions).sum();
    assert!(acquisitions >= 100);
}
