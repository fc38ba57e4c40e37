//! Tests for the write-back pipeline
//!
//! These tests verify:
//! - Per-key coalescing inside a batch
//! - Failed batches are retried, oldest ops first
//! - A panicking store stops the worker and run() recovers it
//! - Writers blocked on a full channel are released when the worker stops
//! - Load shedding and the overload callback
//! - Pooled snapshots
//! - Trace replay

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{loaded_menus, menu, setup_config};
use persistcache::{ManagerConfig, ManagerState, OpKind, PendingOp, PersistError};

// =============================================================================
// Helper Functions
// =============================================================================

/// Config whose timer never fires during a test
fn manual_flush(config: ManagerConfig) -> ManagerConfig {
    ManagerConfig {
        flush_interval: Duration::from_secs(3600),
        batch_size: 10_000,
        ..config
    }
}

fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// =============================================================================
// Coalescing Tests
// =============================================================================

#[test]
fn test_insert_then_updates_coalesce() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(manual_flush(config));

    manager.insert(menu(1, 0, "a")).unwrap();
    let fields = manager.bitset(&["name"]).unwrap();
    manager.update(menu(1, 0, "b"), &fields).unwrap();
    manager.update(menu(1, 0, "c"), &fields).unwrap();
    manager.sync().unwrap();

    assert_eq!(store.batches(), 1);
    assert_eq!(store.applied_ops(), 1);
    assert_eq!(store.get("menu", &1).unwrap().name, "c");
    assert_eq!(manager.stats().pipeline.enqueued, 3);
    assert_eq!(manager.stats().pipeline.flushed_ops, 1);
}

#[test]
fn test_insert_then_delete_cancels() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(manual_flush(config));

    manager.insert(menu(1, 0, "a")).unwrap();
    manager.delete(&1).unwrap();
    manager.sync().unwrap();

    assert_eq!(store.applied_ops(), 0);
    assert!(store.get("menu", &1).is_none());
}

#[test]
fn test_updates_merge_bitsets() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config.clone());
    manager.insert(menu(1, 0, "a")).unwrap();
    manager.sync().unwrap();
    manager.exit().unwrap();
    drop(manager);

    // Same store, timer off, the row already exists
    let manager = persistcache::RecordManager::new(manual_flush(config), store.clone()).unwrap();
    manager.run().unwrap();
    manager.load_all().unwrap();
    let before = store.applied_ops();

    let mut first = menu(1, 0, "renamed");
    first.sort = 100;
    manager
        .update(first, &manager.bitset(&["name"]).unwrap())
        .unwrap();
    let mut second = menu(1, 0, "renamed");
    second.sort = 200;
    second.icon = "star".to_string();
    manager
        .update(second, &manager.bitset(&["icon"]).unwrap())
        .unwrap();
    manager.sync().unwrap();

    assert_eq!(store.applied_ops() - before, 1);
    let row = store.get("menu", &1).unwrap();
    assert_eq!(row.name, "renamed");
    assert_eq!(row.icon, "star");
    // sort was never marked
    assert_eq!(row.sort, 1);
}

#[test]
fn test_coalescing_disabled() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        merge_ops: false,
        ..manual_flush(config)
    };
    let (store, manager) = loaded_menus(config);

    manager.insert(menu(1, 0, "a")).unwrap();
    manager
        .update(menu(1, 0, "b"), &manager.bitset(&["name"]).unwrap())
        .unwrap();
    manager.delete(&1).unwrap();
    manager.sync().unwrap();

    assert_eq!(store.applied_ops(), 3);
    assert!(store.get("menu", &1).is_none());
}

// =============================================================================
// Retry Tests
// =============================================================================

#[test]
fn test_failed_batch_is_retried_in_order() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config);

    store.fail_next(1_000_000);
    manager.insert(menu(1, 0, "a")).unwrap();
    manager
        .update(menu(1, 0, "b"), &manager.bitset(&["name"]).unwrap())
        .unwrap();
    manager.sync().unwrap();

    assert!(store.get("menu", &1).is_none());
    assert!(manager.stats().pipeline.fail_len >= 1);
    assert!(store.failed_batches() >= 1);

    store.fail_next(0);
    manager.sync().unwrap();
    assert_eq!(store.get("menu", &1).unwrap().name, "b");
    assert_eq!(manager.stats().pipeline.fail_len, 0);
}

#[test]
fn test_timer_retries_failed_batch() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config);

    store.fail_next(3);
    manager.insert(menu(1, 0, "a")).unwrap();

    assert!(wait_until(|| store.get("menu", &1).is_some()));
    assert_eq!(store.failed_batches(), 3);
}

// =============================================================================
// Panic Tests
// =============================================================================

#[test]
fn test_panic_stops_worker_and_run_recovers() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config);

    store.panic_next();
    manager.insert(menu(1, 0, "a")).unwrap();
    assert!(wait_until(|| manager.state() == ManagerState::Panic));
    assert!(manager.dead());
    assert_eq!(manager.stats().pipeline.panics, 1);

    let err = manager.insert(menu(2, 0, "b")).unwrap_err();
    assert!(matches!(err, PersistError::Dead));
    // Reads keep working
    assert!(manager.get(&1).is_some());

    manager.run().unwrap();
    assert_eq!(manager.state(), ManagerState::Normal);
    manager.sync().unwrap();
    assert!(store.get("menu", &1).is_some());

    manager.insert(menu(2, 0, "b")).unwrap();
    manager.sync().unwrap();
    assert!(store.get("menu", &2).is_some());
}

#[test]
fn test_panic_with_full_channel_releases_writers() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        queue_capacity: 1,
        batch_size: 1,
        ..config
    };
    let (store, manager) = loaded_menus(config);
    store.set_latency(Duration::from_millis(300));
    store.panic_next();
    let manager = Arc::new(manager);

    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    let writer = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let results: Vec<_> = (1..=4u32)
                .map(|id| (id, manager.insert(menu(id, 0, &format!("m{}", id)))))
                .collect();
            let _ = done_tx.send(());
            results
        })
    };

    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    let results = writer.join().unwrap();
    assert_eq!(manager.state(), ManagerState::Panic);
    store.set_latency(Duration::ZERO);

    let mut accepted = Vec::new();
    for (id, result) in results {
        match result {
            Ok(_) => accepted.push(id),
            Err(PersistError::Dead) => {}
            Err(e) => panic!("unexpected error for {}: {}", id, e),
        }
    }
    assert!(accepted.len() >= 2);

    let report = manager.exit().unwrap();
    assert_eq!(report.bombed, 0);
    for id in accepted {
        assert!(store.get("menu", &id).is_some(), "insert {} was lost", id);
    }
}

// =============================================================================
// Backpressure Tests
// =============================================================================

#[test]
fn test_shed_on_full() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        queue_capacity: 1,
        batch_size: 1,
        shed_on_full: true,
        ..config
    };
    let (store, manager) = loaded_menus(config);
    store.set_latency(Duration::from_millis(300));

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    manager.set_overload(Arc::new(move |_backlog: usize, _last: Duration| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    let mut shed = None;
    for id in 1..=10 {
        match manager.insert(menu(id, 0, &format!("m{}", id))) {
            Ok(_) => {}
            Err(PersistError::Overloaded { backlog }) => {
                assert!(backlog >= 1);
                shed = Some(id);
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let id = shed.expect("queue never filled");
    assert!(manager.get(&id).is_none());
    assert!(calls.load(Ordering::SeqCst) >= 1);
    store.set_latency(Duration::ZERO);
}

#[test]
fn test_overload_callback_on_slow_flush() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        overload_latency: Duration::from_millis(5),
        ..config
    };
    let (store, manager) = loaded_menus(config);
    store.set_latency(Duration::from_millis(20));

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    manager.set_overload(Arc::new(move |_backlog: usize, _last: Duration| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    manager.insert(menu(1, 0, "a")).unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) > 0));
    store.set_latency(Duration::ZERO);
}

// =============================================================================
// Pooled Mode Tests
// =============================================================================

#[test]
fn test_pooled_mode() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        pooled: true,
        pool_capacity: 4,
        ..config
    };
    let (store, manager) = loaded_menus(config);

    for round in 0..5 {
        let name = format!("round{}", round);
        if round == 0 {
            manager.insert(menu(1, 0, &name)).unwrap();
        } else {
            manager
                .update(menu(1, 0, &name), &manager.bitset(&["name"]).unwrap())
                .unwrap();
        }
        manager.sync().unwrap();
        assert_eq!(store.get("menu", &1).unwrap().name, name);
    }

    assert!(matches!(manager.delete(&1), Err(PersistError::DeleteDisabled)));
    assert!(matches!(manager.unload_all(), Err(PersistError::DeleteDisabled)));
    assert!(manager.get(&1).is_some());
}

// =============================================================================
// Trace Replay Tests
// =============================================================================

#[test]
fn test_recover_trace() {
    let (_dir, config) = setup_config();
    let (store, manager) = loaded_menus(config);
    let full = manager.full_bitset();
    let name_only = manager.bitset(&["name"]).unwrap();

    let ops = [
        PendingOp::new(Arc::new(menu(1, 0, "a")), OpKind::Insert, full.clone()),
        PendingOp::new(Arc::new(menu(2, 0, "b")), OpKind::Insert, full.clone()),
        PendingOp::new(Arc::new(menu(1, 0, "a2")), OpKind::Update, name_only),
        PendingOp::new(Arc::new(menu(2, 0, "b")), OpKind::Delete, full),
    ];
    let encoded: Vec<Vec<u8>> = ops
        .iter()
        .map(|op| manager.codec().encode(op).unwrap())
        .collect();

    assert_eq!(manager.recover_trace(&encoded).unwrap(), 4);
    assert_eq!(manager.count(), 1);
    assert_eq!(manager.get(&1).unwrap().name, "a2");

    manager.sync().unwrap();
    assert_eq!(store.get("menu", &1).unwrap().name, "a2");
    assert!(store.get("menu", &2).is_none());
}

#[test]
fn test_recover_trace_rejects_malformed_set() {
    let (_dir, config) = setup_config();
    let (_store, manager) = loaded_menus(config);
    let good = manager
        .codec()
        .encode(&PendingOp::new(
            Arc::new(menu(1, 0, "a")),
            OpKind::Insert,
            manager.full_bitset(),
        ))
        .unwrap();
    let bad = vec![0xFFu8, 0x01];

    let err = manager.recover_trace(vec![good, bad]).unwrap_err();
    assert!(matches!(err, PersistError::Codec(_)));
    assert_eq!(manager.count(), 0);
}

#[test]
fn test_trace_ops_does_not_change_writes() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        trace_ops: true,
        ..config
    };
    let (store, manager) = loaded_menus(config);
    manager.insert(menu(1, 0, "a")).unwrap();
    manager.sync().unwrap();
    assert_eq!(store.get("menu", &1).unwrap(), menu(1, 0, "a"));
}

#[test]
fn test_many_writers_all_flushed() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        queue_capacity: 16,
        batch_size: 8,
        ..config
    };
    let (store, manager) = loaded_menus(config);
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for i in 0..100u32 {
                    let id = t * 1_000 + i;
                    manager.insert(menu(id, t, &format!("m{}", id))).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    manager.sync().unwrap();
    assert_eq!(store.len("menu"), 400);
}
