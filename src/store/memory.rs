//! In-memory store
//!
//! HashMap-backed `Store` with fault injection for exercising the retry,
//! panic and overload paths of the write-back pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{PersistError, Result};
use crate::op::PendingOp;
use crate::schema::{FieldBitSet, FieldValue, Record};

use super::{apply_each, Store};

/// Reference store keeping every table in process memory
///
/// ## Concurrency:
/// - `tables`: RwLock (loads read, batches write)
/// - fault switches and counters: atomics
pub struct MemoryStore<T: Record> {
    tables: RwLock<HashMap<String, HashMap<T::Key, T>>>,

    /// Batches left to fail before succeeding again
    fail_next: AtomicUsize,
    /// Panic inside the next batch
    panic_next: AtomicBool,
    /// Sleep before applying each batch
    latency: Mutex<Duration>,

    batches: AtomicU64,
    failed_batches: AtomicU64,
    applied_ops: AtomicU64,
}

impl<T: Record> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            fail_next: AtomicUsize::new(0),
            panic_next: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            applied_ops: AtomicU64::new(0),
        }
    }

    /// Put rows directly into a table, bypassing the pipeline
    pub fn seed(&self, table: &str, records: impl IntoIterator<Item = T>) {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        for record in records {
            rows.insert(record.primary_key(), record);
        }
    }

    /// Copy of one row
    pub fn get(&self, table: &str, key: &T::Key) -> Option<T> {
        self.tables.read().get(table)?.get(key).cloned()
    }

    /// Number of rows in a table
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.read().contains_key(table)
    }

    /// Names of all tables
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Fail the next `n` batches
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Panic inside the next batch
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// Sleep this long before applying each batch
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    /// Batches attempted, including failed ones
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }

    /// Ops applied by successful batches
    pub fn applied_ops(&self) -> u64 {
        self.applied_ops.load(Ordering::Relaxed)
    }

    fn owner_field() -> Result<&'static str> {
        T::manifest().owner.ok_or(PersistError::NotPartitioned)
    }
}

impl<T: Record> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> Store<T> for MemoryStore<T> {
    fn insert(&self, table: &str, record: &T) -> Result<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(record.primary_key(), record.clone());
        Ok(())
    }

    fn update(&self, table: &str, record: &T, fields: &FieldBitSet) -> Result<()> {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        match rows.get_mut(&record.primary_key()) {
            Some(row) => {
                for name in fields.fields() {
                    let value = record
                        .field(name)
                        .ok_or_else(|| PersistError::UnknownField(name.to_string()))?;
                    row.set_field(name, value)?;
                }
            }
            None => {
                rows.insert(record.primary_key(), record.clone());
            }
        }
        Ok(())
    }

    fn delete(&self, table: &str, key: &T::Key) -> Result<()> {
        if let Some(rows) = self.tables.write().get_mut(table) {
            rows.remove(key);
        }
        Ok(())
    }

    fn apply_batch(&self, table: &str, ops: &[PendingOp<T>]) -> Result<()> {
        self.batches.fetch_add(1, Ordering::Relaxed);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        if self.panic_next.swap(false, Ordering::SeqCst) {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
            panic!("injected store panic on table {}", table);
        }

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
            return Err(PersistError::Store(format!(
                "injected failure on table {} ({} ops)",
                table,
                ops.len()
            )));
        }

        apply_each(self, table, ops)?;
        self.applied_ops.fetch_add(ops.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn load_all(&self, table: &str) -> Result<Vec<T>> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn load_owner(&self, table: &str, owner: &FieldValue) -> Result<Vec<T>> {
        let field = Self::owner_field()?;
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.field(field).as_ref() == Some(owner))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn create_table(&self, table: &str) -> Result<()> {
        self.tables.write().entry(table.to_string()).or_default();
        Ok(())
    }
}
