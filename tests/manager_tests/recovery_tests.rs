//! Tests for crash recovery
//!
//! These tests verify:
//! - A bomb file is replayed by run() and then deleted
//! - Exit against a failing store writes a bomb the next process replays
//! - A later exit never loses ops bombed by an earlier one
//! - Malformed bomb files are rejected before anything is applied
//! - A leftover tmp file blocks startup

#[path = "../common/mod.rs"]
mod common;

use std::fs;
use std::sync::Arc;

use common::{menu, setup_config, Menu};
use persistcache::bomb::BombFile;
use persistcache::{
    ManagerConfig, ManagerState, MemoryStore, OpKind, PendingOp, PersistError, RecordManager,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn manager(config: &ManagerConfig) -> (Arc<MemoryStore<Menu>>, RecordManager<Menu>) {
    let store = Arc::new(MemoryStore::new());
    let manager = RecordManager::new(config.clone(), store.clone()).unwrap();
    (store, manager)
}

/// Write a bomb file holding `ops` for the menu table
fn plant_bomb(config: &ManagerConfig, ops: &[PendingOp<Menu>]) -> BombFile {
    let (_store, encoder) = manager(config);
    let payload = encoder.codec().encode_list(ops).unwrap();
    let file = BombFile::new(&config.data_dir, "menu");
    file.write(&payload).unwrap();
    file
}

fn insert_op(config: &ManagerConfig, record: Menu) -> PendingOp<Menu> {
    let (_store, m) = manager(config);
    PendingOp::new(Arc::new(record), OpKind::Insert, m.full_bitset())
}

// =============================================================================
// Replay Tests
// =============================================================================

#[test]
fn test_bomb_replayed_on_run() {
    let (_dir, config) = setup_config();
    let ops: Vec<_> = (1..=3)
        .map(|id| insert_op(&config, menu(id, 0, &format!("m{}", id))))
        .collect();
    let file = plant_bomb(&config, &ops);

    let (store, manager) = manager(&config);
    manager.run().unwrap();

    assert_eq!(manager.count(), 3);
    assert_eq!(manager.get(&2).unwrap().name, "m2");
    assert!(!file.exists());

    manager.sync().unwrap();
    assert_eq!(store.len("menu"), 3);
}

#[test]
fn test_bomb_replays_updates_and_deletes() {
    let (_dir, config) = setup_config();
    let (_s, m) = manager(&config);
    let full = m.full_bitset();
    let ops = vec![
        PendingOp::new(Arc::new(menu(1, 0, "a")), OpKind::Insert, full.clone()),
        PendingOp::new(Arc::new(menu(2, 0, "b")), OpKind::Insert, full.clone()),
        PendingOp::new(
            Arc::new(menu(1, 0, "a2")),
            OpKind::Update,
            m.bitset(&["name"]).unwrap(),
        ),
        PendingOp::new(Arc::new(menu(2, 0, "b")), OpKind::Delete, full.clone()),
        PendingOp::new(Arc::new(menu(3, 0, "gone")), OpKind::Unload, full),
    ];
    plant_bomb(&config, &ops);

    let (store, manager) = manager(&config);
    manager.run().unwrap();

    assert_eq!(manager.count(), 1);
    assert_eq!(manager.get(&1).unwrap().name, "a2");
    // Unloaded records are written back but not cached
    assert!(manager.get(&3).is_none());

    manager.sync().unwrap();
    assert_eq!(store.get("menu", &1).unwrap().name, "a2");
    assert!(store.get("menu", &2).is_none());
    assert_eq!(store.get("menu", &3).unwrap().name, "gone");
}

#[test]
fn test_exit_with_failing_store_writes_bomb() {
    let (_dir, config) = setup_config();
    let (store, first) = manager(&config);
    first.run().unwrap();
    first.load_all().unwrap();

    store.fail_next(1_000_000);
    first.insert(menu(1, 0, "a")).unwrap();
    first.insert(menu(2, 0, "b")).unwrap();

    let report = first.exit().unwrap();
    assert_eq!(report.bombed, 2);
    assert_eq!(report.flushed, 0);
    let path = report.bomb_path.unwrap();
    assert!(path.is_file());
    assert!(store.is_empty("menu"));
    drop(first);

    // Next process, healthy store
    let (store, second) = manager(&config);
    second.run().unwrap();
    assert!(!path.exists());
    assert_eq!(second.count(), 2);

    second.load_all().unwrap();
    assert_eq!(store.len("menu"), 2);
    assert_eq!(store.get("menu", &2).unwrap().name, "b");
}

#[test]
fn test_exit_flushes_when_store_recovers() {
    let (_dir, config) = setup_config();
    let config = ManagerConfig {
        exit_flush_retries: 3,
        ..config
    };
    let (store, m) = manager(&config);
    m.run().unwrap();
    m.load_all().unwrap();

    // Fewer failures than exit attempts
    store.fail_next(2);
    m.insert(menu(1, 0, "a")).unwrap();
    let report = m.exit().unwrap();

    assert_eq!(report.bombed, 0);
    assert!(store.get("menu", &1).is_some());
    assert!(!BombFile::new(&config.data_dir, "menu").exists());
}

#[test]
fn test_repeated_exit_keeps_earlier_bomb() {
    let (_dir, config) = setup_config();
    let (store, m) = manager(&config);
    m.run().unwrap();
    m.load_all().unwrap();
    store.fail_next(1_000_000);

    m.insert(menu(1, 0, "a")).unwrap();
    assert_eq!(m.exit().unwrap().bombed, 1);

    // Restarting in the same process picks the bomb up again
    m.run().unwrap();
    assert!(!BombFile::new(&config.data_dir, "menu").exists());
    m.insert(menu(2, 0, "b")).unwrap();
    let report = m.exit().unwrap();
    assert_eq!(report.bombed, 2);
    drop(m);

    let (store, next) = manager(&config);
    next.run().unwrap();
    assert_eq!(next.count(), 2);
    assert!(next.get(&1).is_some());
    assert!(next.get(&2).is_some());

    next.sync().unwrap();
    assert_eq!(store.len("menu"), 2);
}

#[test]
fn test_exit_appends_to_existing_bomb() {
    let (_dir, config) = setup_config();
    let (store, m) = manager(&config);
    m.run().unwrap();
    m.load_all().unwrap();

    // Planted after run, so this manager never replayed it
    let file = plant_bomb(&config, &[insert_op(&config, menu(1, 0, "a"))]);
    store.fail_next(1_000_000);
    m.insert(menu(2, 0, "b")).unwrap();
    let report = m.exit().unwrap();
    assert_eq!(report.bombed, 2);

    let ops = m.codec().decode_list(&file.read().unwrap().unwrap()).unwrap();
    let keys: Vec<u32> = ops.iter().map(|op| op.key()).collect();
    assert_eq!(keys, vec![1, 2]);
}

// =============================================================================
// Rejection Tests
// =============================================================================

#[test]
fn test_malformed_bomb_rejected() {
    let (_dir, config) = setup_config();
    let file = BombFile::new(&config.data_dir, "menu");
    // Valid framing, garbage op list
    file.write(&[1, 0, 0, 0, 3, 0, 0, 0, 0xFF, 0xFF, 0xFF]).unwrap();

    let (store, manager) = manager(&config);
    let err = manager.run().unwrap_err();
    assert!(matches!(err, PersistError::InvalidBombFile(_)));
    assert_eq!(manager.state(), ManagerState::Idle);
    assert_eq!(manager.count(), 0);
    assert!(store.tables().is_empty());
    // Left in place for inspection
    assert!(file.exists());
}

#[test]
fn test_corrupted_bomb_rejected() {
    let (_dir, config) = setup_config();
    let ops = vec![insert_op(&config, menu(1, 0, "a"))];
    let file = plant_bomb(&config, &ops);

    let mut raw = fs::read(file.path()).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0x55;
    fs::write(file.path(), &raw).unwrap();

    let (_store, manager) = manager(&config);
    assert!(matches!(
        manager.run(),
        Err(PersistError::InvalidBombFile(_))
    ));
    assert_eq!(manager.count(), 0);
}

#[test]
fn test_leftover_tmp_blocks_run() {
    let (_dir, config) = setup_config();
    fs::create_dir_all(&config.data_dir).unwrap();
    let file = BombFile::new(&config.data_dir, "menu");
    fs::write(file.tmp_path(), b"partial").unwrap();

    let (_store, manager) = manager(&config);
    let err = manager.run().unwrap_err();
    assert!(matches!(err, PersistError::TempFileExist(_)));
    assert_eq!(manager.state(), ManagerState::Idle);

    // Once the operator removes it, startup succeeds
    fs::remove_file(file.tmp_path()).unwrap();
    manager.run().unwrap();
    assert_eq!(manager.state(), ManagerState::Normal);
}
