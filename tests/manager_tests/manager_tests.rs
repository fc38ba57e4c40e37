//! Tests for RecordManager reads and mutations
//!
//! These tests verify:
//! - Mutations require the table (or owner) in memory
//! - Primary, unique and multi index lookups
//! - Updates move records between index buckets
//! - Deletes and missing records (Nil)
//! - Writes reach the store after sync
//! - Concurrent updates of one key leave it in exactly one bucket

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::thread;

use common::{item, loaded_menus, menu, running, setup_config, Item, Menu};
use persistcache::{CompoundKey, FieldValue, ManagerConfig, PersistError, Record};

// =============================================================================
// Helper Functions
// =============================================================================

fn parent(id: u32) -> CompoundKey {
    CompoundKey::single(id)
}

fn parent_status(id: u32, status: i8) -> CompoundKey {
    CompoundKey::new(vec![FieldValue::from(id), FieldValue::from(status)])
}

// =============================================================================
// Load State Tests
// =============================================================================

#[test]
fn test_insert_requires_loaded_table() {
    let (_dir, config) = setup_config();
    let (_store, manager) = running::<Menu>(config);

    let err = manager.insert(menu(1, 0, "home")).unwrap_err();
    assert!(matches!(err, PersistError::NotInMemory));

    manager.load_all().unwrap();
    manager.insert(menu(1, 0, "home")).unwrap();
    assert_eq!(manager.count(), 1);
}

#[test]
fn test_insert_requires_loaded_owner() {
    let (_dir, config) = setup_config();
    let (_store, manager) = running::<Item>(config);

    let err = manager.insert(item(1, 7, "sword")).unwrap_err();
    assert!(matches!(err, PersistError::NotInMemory));

    manager.set_load_state_memory(7i64).unwrap();
    manager.insert(item(1, 7, "sword")).unwrap();

    // Other owners are still on disk
    let err = manager.insert(item(2, 8, "shield")).unwrap_err();
    assert!(matches!(err, PersistError::NotInMemory));
}

#[test]
fn test_insert_before_run_is_stopped() {
    let (_dir, config) = setup_config();
    let store = Arc::new(persistcache::MemoryStore::<Menu>::new());
    let manager = persistcache::RecordManager::new(config, store).unwrap();
    let err = manager.insert(menu(1, 0, "home")).unwrap_err();
    assert!(matches!(err, PersistError::Stopped));
}

#[test]
fn test_invalid_config_rejected() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        batch_size: 0,
        ..config
    };
    let store = Arc::new(persistcache::MemoryStore::<Menu>::new());
    let result = persistcache::RecordManager::new(config, store);
    assert!(matches!(result, Err(PersistError::Config(_))));
}

// =============================================================================
// Insert / Lookup Tests
// =============================================================================

#[test]
fn test_insert_and_lookup() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);

    manager.insert(menu(1, 0, "home")).unwrap();
    manager.insert(menu(2, 1, "users")).unwrap();
    manager.insert(menu(3, 1, "roles")).unwrap();

    assert_eq!(manager.get(&2).unwrap().name, "users");
    assert!(manager.get(&99).is_none());

    let by_name = manager
        .get_unique("name", &CompoundKey::single("roles"))
        .unwrap()
        .unwrap();
    assert_eq!(by_name.auth_id, 3);

    let mut children: Vec<u32> = manager
        .get_all("parent", &parent(1))
        .unwrap()
        .iter()
        .map(|m| m.auth_id)
        .collect();
    children.sort();
    assert_eq!(children, vec![2, 3]);

    assert_eq!(manager.count_by("parent_status", &parent_status(1, 1)).unwrap(), 2);
    assert_eq!(manager.count_by("parent_status", &parent_status(1, 0)).unwrap(), 0);
}

#[test]
fn test_insert_returns_cached_record() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);

    let inserted = manager.insert(menu(1, 0, "home")).unwrap();
    let cached = manager.get(&1).unwrap();
    assert!(Arc::ptr_eq(&inserted, &cached));
}

#[test]
fn test_duplicate_insert_rejected() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);

    manager.insert(menu(1, 0, "home")).unwrap();
    let err = manager.insert(menu(1, 0, "other")).unwrap_err();
    assert!(matches!(err, PersistError::AlreadyExists));
    assert_eq!(manager.get(&1).unwrap().name, "home");
    assert!(manager
        .get_unique("name", &CompoundKey::single("other"))
        .unwrap()
        .is_none());
}

#[test]
fn test_unknown_index() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);

    let err = manager.get_all("nope", &parent(1)).unwrap_err();
    assert!(matches!(err, PersistError::UnknownIndex(name) if name == "nope"));
}

#[test]
fn test_range_and_range_by() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);
    for id in 1..=6 {
        manager.insert(menu(id, id % 2, &format!("m{}", id))).unwrap();
    }

    let mut total = 0;
    manager.range(|_| {
        total += 1;
        true
    });
    assert_eq!(total, 6);

    let mut odd = Vec::new();
    manager
        .range_by("parent", &parent(1), |m| {
            odd.push(m.auth_id);
            true
        })
        .unwrap();
    odd.sort();
    assert_eq!(odd, vec![1, 3, 5]);
}

// =============================================================================
// Update Tests
// =============================================================================

#[test]
fn test_update_moves_index_buckets() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);
    manager.insert(menu(1, 10, "a")).unwrap();
    manager.insert(menu(2, 10, "b")).unwrap();

    let mut moved = (*manager.get(&1).unwrap()).clone();
    moved.parent_id = 20;
    moved.name = "a2".to_string();
    let fields = manager.bitset(&["parent_id", "name"]).unwrap();
    manager.update(moved, &fields).unwrap();

    let old_bucket: Vec<u32> = manager
        .get_all("parent", &parent(10))
        .unwrap()
        .iter()
        .map(|m| m.auth_id)
        .collect();
    assert_eq!(old_bucket, vec![2]);
    assert_eq!(manager.count_by("parent", &parent(20)).unwrap(), 1);
    assert_eq!(manager.count_by("parent_status", &parent_status(10, 1)).unwrap(), 1);
    assert_eq!(manager.count_by("parent_status", &parent_status(20, 1)).unwrap(), 1);

    // The unique index follows the rename
    assert!(manager
        .get_unique("name", &CompoundKey::single("a"))
        .unwrap()
        .is_none());
    assert_eq!(
        manager
            .get_unique("name", &CompoundKey::single("a2"))
            .unwrap()
            .unwrap()
            .auth_id,
        1
    );
}

#[test]
fn test_update_missing_is_nil() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);
    let fields = manager.full_bitset();
    let err = manager.update(menu(5, 0, "x"), &fields).unwrap_err();
    assert!(matches!(err, PersistError::Nil));
}

#[test]
fn test_update_writes_only_marked_fields() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config);
    manager.insert(menu(1, 0, "home")).unwrap();
    manager.sync().unwrap();

    let mut changed = menu(1, 0, "start");
    changed.sort = 500;
    manager
        .update(changed, &manager.bitset(&["name"]).unwrap())
        .unwrap();
    manager.sync().unwrap();

    let row = store.get("menu", &1).unwrap();
    assert_eq!(row.name, "start");
    assert_eq!(row.sort, 1);
    // Memory holds the whole new record
    assert_eq!(manager.get(&1).unwrap().sort, 500);
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config);
    manager.insert(menu(1, 5, "home")).unwrap();
    manager.sync().unwrap();
    assert!(store.get("menu", &1).is_some());

    let removed = manager.delete(&1).unwrap();
    assert_eq!(removed.name, "home");
    assert!(manager.get(&1).is_none());
    assert_eq!(manager.count_by("parent", &parent(5)).unwrap(), 0);
    assert!(manager
        .get_unique("name", &CompoundKey::single("home"))
        .unwrap()
        .is_none());

    manager.sync().unwrap();
    assert!(store.get("menu", &1).is_none());

    assert!(matches!(manager.delete(&1), Err(PersistError::Nil)));
}

// =============================================================================
// Write-back Tests
// =============================================================================

#[test]
fn test_writes_reach_store_after_sync() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config);
    for id in 1..=20 {
        manager.insert(menu(id, 0, &format!("m{}", id))).unwrap();
    }
    manager.sync().unwrap();
    assert_eq!(store.len("menu"), 20);
    assert_eq!(store.get("menu", &7).unwrap(), menu(7, 0, "m7"));
}

#[test]
fn test_load_all_reads_seeded_rows() {
    let (_dir, config) = setup_config();
    let (store, manager) = running::<Menu>(config);
    store.seed("menu", (1..=3).map(|id| menu(id, 0, &format!("m{}", id))));

    assert_eq!(manager.load_all().unwrap(), 3);
    assert_eq!(manager.count(), 3);
    assert_eq!(manager.count_by("parent", &parent(0)).unwrap(), 3);
}

#[test]
fn test_custom_table_name() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        table_name: Some("menu_v2".to_string()),
        ..config
    };
    let (store, manager) = loaded_menus(config);
    assert_eq!(manager.table(), "menu_v2");
    manager.insert(menu(1, 0, "home")).unwrap();
    manager.sync().unwrap();
    assert!(store.get("menu_v2", &1).is_some());
    assert!(store.get("menu", &1).is_none());
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_inserts() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config);
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for i in 0..50u32 {
                    let id = t * 100 + i;
                    manager.insert(menu(id, t, &format!("m{}", id))).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(manager.count(), 200);
    for t in 0..4 {
        assert_eq!(manager.count_by("parent", &parent(t)).unwrap(), 50);
    }
    manager.sync().unwrap();
    assert_eq!(store.len("menu"), 200);
}

#[test]
fn test_strict_indexes_keep_one_bucket_per_record() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        index_mutex: true,
        ..config
    };
    let (_store, manager) = loaded_menus(config);
    for id in 0..8 {
        manager.insert(menu(id, 0, &format!("m{}", id))).unwrap();
    }
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..8u32)
        .map(|id| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let fields = manager.bitset(&["parent_id"]).unwrap();
                for round in 1..=20u32 {
                    let mut record = (*manager.get(&id).unwrap()).clone();
                    record.parent_id = round % 3;
                    manager.update(record, &fields).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Round 20 leaves every record under parent 2
    let total: usize = (0..3)
        .map(|p| manager.count_by("parent", &parent(p)).unwrap())
        .sum();
    assert_eq!(total, 8);
    assert_eq!(manager.count_by("parent", &parent(2)).unwrap(), 8);
    for id in 0..8u32 {
        assert_eq!(manager.get(&id).unwrap().primary_key(), id);
    }
}

#[test]
fn test_concurrent_updates_of_one_key_leave_one_bucket() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);
    manager.insert(menu(1, 0, "home")).unwrap();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let fields = manager.bitset(&["parent_id"]).unwrap();
                for round in 0..200u32 {
                    let mut record = menu(1, 0, "home");
                    record.parent_id = 1 + t * 1_000 + round;
                    manager.update(record, &fields).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let current = manager.get(&1).unwrap();
    let mut buckets = 0;
    for t in 0..8u32 {
        for round in 0..200u32 {
            let id = 1 + t * 1_000 + round;
            buckets += manager.count_by("parent", &parent(id)).unwrap();
            buckets += manager
                .count_by("parent_status", &parent_status(id, current.status))
                .unwrap();
        }
    }
    assert_eq!(buckets, 2);
    assert_eq!(manager.count_by("parent", &parent(0)).unwrap(), 0);

    let holders = manager.get_all("parent", &parent(current.parent_id)).unwrap();
    assert_eq!(holders.len(), 1);
    assert!(Arc::ptr_eq(&holders[0], &current));
    assert_eq!(
        manager
            .get_unique("name", &CompoundKey::single("home"))
            .unwrap()
            .map(|r| r.parent_id),
        Some(current.parent_id)
    );
}
