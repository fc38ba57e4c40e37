//! Tests for the index shapes
//!
//! These tests verify:
//! - UniqueIndex set/set_if_absent/compare_and_remove
//! - CompoundIndex bucket membership
//! - Empty buckets stay usable
//! - Concurrent adds into one bucket

use std::sync::Arc;
use std::thread;

use persistcache::syncmap::{CompoundIndex, ConcurrentSet, PrimaryIndex, UniqueIndex};

// =============================================================================
// ConcurrentSet Tests
// =============================================================================

#[test]
fn test_set_insert_remove() {
    let set = ConcurrentSet::new();
    assert!(set.insert(1));
    assert!(!set.insert(1));
    assert!(set.contains(&1));
    assert_eq!(set.len(), 1);

    assert!(set.remove(&1));
    assert!(!set.remove(&1));
    assert!(set.is_empty());
}

#[test]
fn test_set_to_vec() {
    let set = ConcurrentSet::new();
    for v in ["a", "b", "c"] {
        set.insert(v);
    }
    let mut members = set.to_vec();
    members.sort();
    assert_eq!(members, vec!["a", "b", "c"]);
}

// =============================================================================
// UniqueIndex Tests
// =============================================================================

#[test]
fn test_unique_set_replaces() {
    let index: UniqueIndex<String, u32> = UniqueIndex::new();
    assert_eq!(index.set("a".into(), 1), None);
    assert_eq!(index.set("a".into(), 2), Some(1));
    assert_eq!(index.get(&"a".into()), Some(2));
    assert!(index.has(&"a".into()));
    assert_eq!(index.len(), 1);
}

#[test]
fn test_unique_set_if_absent() {
    let index: PrimaryIndex<u64, &str> = PrimaryIndex::new();
    assert_eq!(index.set_if_absent(1, "first"), None);
    assert_eq!(index.set_if_absent(1, "second"), Some("first"));
    assert_eq!(index.get(&1), Some("first"));
}

#[test]
fn test_unique_compare_and_remove() {
    let index = UniqueIndex::new();
    index.set(1u32, 10u32);
    assert!(!index.compare_and_remove(&1, &11));
    assert!(index.has(&1));
    assert!(index.compare_and_remove(&1, &10));
    assert!(!index.has(&1));
}

#[test]
fn test_unique_compare_and_set() {
    let index = UniqueIndex::new();
    index.set(1u32, 10u32);
    assert!(index.compare_and_set(&1, &10, 20));
    assert!(!index.compare_and_set(&1, &10, 30));
    assert_eq!(index.get(&1), Some(20));
}

#[test]
fn test_unique_remove_and_clear() {
    let index = UniqueIndex::new();
    for i in 0..5u32 {
        index.set(i, i);
    }
    assert_eq!(index.remove(&3), Some(3));
    assert_eq!(index.len(), 4);

    let mut values = index.values();
    values.sort();
    assert_eq!(values, vec![0, 1, 2, 4]);

    index.clear();
    assert!(index.is_empty());
}

// =============================================================================
// CompoundIndex Tests
// =============================================================================

#[test]
fn test_compound_add_and_get_all() {
    let index = CompoundIndex::new();
    assert!(index.add(1u32, 10u32));
    assert!(index.add(1, 11));
    assert!(!index.add(1, 11));
    assert!(index.add(2, 20));

    let mut bucket = index.get_all(&1);
    bucket.sort();
    assert_eq!(bucket, vec![10, 11]);
    assert_eq!(index.count(&2), 1);
    assert_eq!(index.count(&3), 0);
    assert!(index.get_all(&3).is_empty());
}

#[test]
fn test_compound_remove_keeps_bucket() {
    let index = CompoundIndex::new();
    index.add("k", 1);
    assert!(index.remove(&"k", &1));
    assert!(!index.has(&"k", &1));
    assert_eq!(index.count(&"k"), 0);
    // The empty bucket is still there and still accepts values
    assert_eq!(index.keys(), vec!["k"]);
    index.add("k", 2);
    assert!(index.has(&"k", &2));
}

#[test]
fn test_compound_remove_missing() {
    let index: CompoundIndex<u32, u32> = CompoundIndex::new();
    assert!(!index.remove(&1, &1));
    index.add(1, 1);
    assert!(!index.remove(&1, &2));
}

#[test]
fn test_compound_remove_all() {
    let index = CompoundIndex::new();
    index.add(1u32, 1u32);
    index.add(1, 2);
    index.remove_all(&1);
    assert_eq!(index.count(&1), 0);
    // The emptied bucket stays registered
    assert_eq!(index.keys(), vec![1]);

    index.add(1, 3);
    assert_eq!(index.get_all(&1), vec![3]);
    assert!(index.has(&1, &3));
}

#[test]
fn test_compound_range_values_early_stop() {
    let index = CompoundIndex::new();
    for v in 0..10u32 {
        index.add(0u32, v);
    }
    let mut seen = 0;
    index.range_values(&0, |_| {
        seen += 1;
        seen < 3
    });
    assert_eq!(seen, 3);
}

#[test]
fn test_compound_concurrent_adds_same_key() {
    let index = Arc::new(CompoundIndex::new());
    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for i in 0..250u32 {
                    index.add("shared", t * 1_000 + i);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(index.count(&"shared"), 2_000);
}
