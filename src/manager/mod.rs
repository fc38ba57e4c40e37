//! Manager Module
//!
//! `RecordManager<T>` caches records of one type, keeps their indices and
//! writes every mutation back to a `Store` asynchronously.
//!
//! ## Architecture
//! ```text
//!  insert / update / delete
//!          │
//!          ▼
//!  ┌───────────────┐  ┌───────────────┐     ┌──────────────────────┐
//!  │ PrimaryIndex  │  │ Secondary     │     │ bounded channel      │
//!  │ key → record  │  │ indices       │     │ Op | Barrier | Exit  │
//!  └───────────────┘  └───────────────┘     └──────────┬───────────┘
//!          ▲ reads (lock-free)                         │ worker thread
//!                                                      ▼
//!                                  fail queue ++ sync queue → Store
//! ```
//!
//! ## Load States
//! Records are only writable while in memory: either the whole table is
//! loaded (`load_all`), or, for types partitioned by an owner field, the
//! owner of the record is loaded (`load`).
//!
//! ## Concurrency:
//! - Reads never lock (see `syncmap`)
//! - Mutations hold the read side of `gate`; unload and exit take the write
//!   side to wait out mutations already past their state checks
//! - Store I/O happens only on the worker thread or inside barriers

mod indexes;
mod lifecycle;
mod pipeline;
mod pool;
mod recovery;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::bomb::BombFile;
use crate::codec::OpCodec;
use crate::config::ManagerConfig;
use crate::error::{PersistError, Result};
use crate::op::{OpKind, PendingOp};
use crate::schema::{CompoundKey, FieldBitSet, FieldSchema, FieldValue, Record, SchemaCache};
use crate::store::{Overload, Store};
use crate::syncmap::ConcurrentMap;

use indexes::Indexes;
use pipeline::Pipeline;
use pool::ObjectPool;
use state::StateCell;

pub use indexes::RecordRef;
pub use pipeline::{ExitReport, PipelineStats};
pub use state::{LoadState, ManagerState};

/// Point-in-time view of a manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub table: String,
    pub state: ManagerState,
    pub table_state: LoadState,
    /// Records in the primary index
    pub records: usize,
    /// Owners currently in memory
    pub owners_in_memory: usize,
    pub pipeline: PipelineStats,
}

/// Cache and write-back manager for records of type `T`
pub struct RecordManager<T: Record> {
    shared: Arc<Shared<T>>,
}

/// State shared between the manager handle and its worker thread
struct Shared<T: Record> {
    config: ManagerConfig,
    schema: Arc<FieldSchema>,
    codec: OpCodec<T>,
    /// Every field set; used for Insert, Delete and Unload ops
    full: FieldBitSet,
    indexes: Indexes<T>,

    state: StateCell<ManagerState>,
    table_state: StateCell<LoadState>,
    /// Load state per owner (partitioned types only)
    owners: ConcurrentMap<FieldValue, Arc<StateCell<LoadState>>>,

    pipeline: Pipeline<T>,
    /// Mutations hold it shared; unload and exit take it exclusively
    gate: RwLock<()>,
    /// Cleared when exit begins
    intake_open: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serializes run and exit
    lifecycle: Mutex<()>,

    store: Arc<dyn Store<T>>,
    overload: RwLock<Option<Arc<dyn Overload>>>,
    pool: Option<ObjectPool<T>>,

    /// Table name from config or manifest; segment names derive from it
    base_table: String,
    /// Current write target, changed by segmentation
    table: RwLock<String>,
    bomb: BombFile,
}

impl<T: Record> RecordManager<T> {
    /// Create a manager, building the schema from `T`'s manifest
    pub fn new(config: ManagerConfig, store: Arc<dyn Store<T>>) -> Result<Self> {
        let schema = Arc::new(FieldSchema::from_manifest(T::manifest())?);
        Self::with_schema(schema, config, store)
    }

    /// Create a manager using a shared schema cache
    pub fn with_schemas(
        schemas: &SchemaCache,
        config: ManagerConfig,
        store: Arc<dyn Store<T>>,
    ) -> Result<Self> {
        Self::with_schema(schemas.schema::<T>()?, config, store)
    }

    fn with_schema(
        schema: Arc<FieldSchema>,
        config: ManagerConfig,
        store: Arc<dyn Store<T>>,
    ) -> Result<Self> {
        config.validate()?;
        let base_table = config
            .table_name
            .clone()
            .unwrap_or_else(|| schema.table().to_string());

        let shared = Shared {
            codec: OpCodec::new(Arc::clone(&schema)),
            full: FieldBitSet::all(Arc::clone(&schema)),
            indexes: Indexes::new(config.index_mutex),
            state: StateCell::new(ManagerState::Idle),
            table_state: StateCell::new(LoadState::Disk),
            owners: ConcurrentMap::new(),
            pipeline: Pipeline::new(config.queue_capacity),
            gate: RwLock::new(()),
            intake_open: AtomicBool::new(false),
            worker: Mutex::new(None),
            lifecycle: Mutex::new(()),
            store,
            overload: RwLock::new(None),
            pool: config.pooled.then(|| ObjectPool::new(config.pool_capacity)),
            table: RwLock::new(base_table.clone()),
            bomb: BombFile::new(&config.data_dir, &base_table),
            base_table,
            schema,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Install the callback invoked when write-back falls behind
    pub fn set_overload(&self, hook: Arc<dyn Overload>) {
        *self.shared.overload.write() = Some(hook);
    }

    pub fn schema(&self) -> &Arc<FieldSchema> {
        &self.shared.schema
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Table flushes currently go to
    pub fn table(&self) -> String {
        self.shared.table()
    }

    /// Table name before any segmentation
    pub fn base_table(&self) -> &str {
        &self.shared.base_table
    }

    /// Whether records are partitioned by an owner field
    pub fn is_partitioned(&self) -> bool {
        self.shared.schema.owner().is_some()
    }

    pub fn state(&self) -> ManagerState {
        self.shared.state.get()
    }

    /// True unless the worker is running normally
    pub fn dead(&self) -> bool {
        self.state() != ManagerState::Normal
    }

    /// Bitset with every field set
    pub fn full_bitset(&self) -> FieldBitSet {
        self.shared.full.clone()
    }

    /// Bitset with the named fields set
    pub fn bitset(&self, fields: &[&str]) -> Result<FieldBitSet> {
        FieldBitSet::with_fields(Arc::clone(&self.shared.schema), fields)
    }

    /// Codec for this record type
    pub fn codec(&self) -> &OpCodec<T> {
        &self.shared.codec
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Record with this primary key
    pub fn get(&self, key: &T::Key) -> Option<Arc<T>> {
        self.shared.indexes.get(key).map(RecordRef::into_arc)
    }

    /// Record under `key` in a unique index
    pub fn get_unique(&self, index: &str, key: &CompoundKey) -> Result<Option<Arc<T>>> {
        Ok(self
            .shared
            .indexes
            .get_unique(index, key)?
            .map(RecordRef::into_arc))
    }

    /// Every record under `key` in an index
    pub fn get_all(&self, index: &str, key: &CompoundKey) -> Result<Vec<Arc<T>>> {
        Ok(self
            .shared
            .indexes
            .get_all(index, key)?
            .into_iter()
            .map(RecordRef::into_arc)
            .collect())
    }

    /// Visit every record until `f` returns false
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<T>) -> bool,
    {
        self.shared.indexes.range(|r| f(r.as_arc()));
    }

    /// Visit every record under `key` in an index until `f` returns false
    pub fn range_by<F>(&self, index: &str, key: &CompoundKey, mut f: F) -> Result<()>
    where
        F: FnMut(&Arc<T>) -> bool,
    {
        self.shared.indexes.range_by(index, key, |r| f(r.as_arc()))
    }

    /// Number of cached records
    pub fn count(&self) -> usize {
        self.shared.indexes.len()
    }

    /// Number of records under `key` in an index
    pub fn count_by(&self, index: &str, key: &CompoundKey) -> Result<usize> {
        self.shared.indexes.count_by(index, key)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Add a new record
    ///
    /// Fails `AlreadyExists` if its primary key is cached, `NotInMemory` if
    /// the record's table or owner is not loaded.
    pub fn insert(&self, record: T) -> Result<Arc<T>> {
        let s = &self.shared;
        let _admitted = s.admit()?;
        s.check_writable(&record)?;
        s.check_capacity()?;

        let record = RecordRef::new(record);
        s.indexes.insert(record.clone())?;
        s.enqueue(PendingOp::new(s.snapshot(&record), OpKind::Insert, s.full.clone()))?;
        Ok(record.into_arc())
    }

    /// Replace a cached record; `fields` marks the fields written back
    ///
    /// Fails `Nil` if no record has this primary key.
    pub fn update(&self, record: T, fields: &FieldBitSet) -> Result<Arc<T>> {
        let s = &self.shared;
        if fields.words().len() != s.schema.word_count() {
            return Err(PersistError::Schema(format!(
                "bitset of {} words does not belong to table {}",
                fields.words().len(),
                s.base_table
            )));
        }
        let _admitted = s.admit()?;
        let prev = s.indexes.get(&record.primary_key()).ok_or(PersistError::Nil)?;
        s.check_writable(&prev)?;
        s.check_writable(&record)?;
        s.check_capacity()?;

        let record = RecordRef::new(record);
        s.indexes.replace(record.clone())?;
        s.enqueue(PendingOp::new(s.snapshot(&record), OpKind::Update, fields.clone()))?;
        Ok(record.into_arc())
    }

    /// Remove a cached record, returning it
    pub fn delete(&self, key: &T::Key) -> Result<Arc<T>> {
        let s = &self.shared;
        if s.pool.is_some() {
            return Err(PersistError::DeleteDisabled);
        }
        let _admitted = s.admit()?;
        let prev = s.indexes.get(key).ok_or(PersistError::Nil)?;
        s.check_writable(&prev)?;
        s.check_capacity()?;

        let removed = s.indexes.remove(key)?;
        s.enqueue(PendingOp::new(
            Arc::clone(removed.as_arc()),
            OpKind::Delete,
            s.full.clone(),
        ))?;
        Ok(removed.into_arc())
    }
}

impl<T: Record> Drop for RecordManager<T> {
    fn drop(&mut self) {
        if self.shared.state.get() != ManagerState::Idle || self.shared.worker.lock().is_some() {
            if let Err(e) = self.exit() {
                tracing::error!(table = %self.shared.table(), error = %e, "exit on drop failed");
            }
        }
    }
}

impl<T: Record> Shared<T> {
    fn table(&self) -> String {
        self.table.read().clone()
    }

    fn owner_field(&self) -> Option<&'static str> {
        self.schema.owner().map(|i| self.schema.name(i))
    }

    fn owner_of(&self, record: &T) -> Result<Option<FieldValue>> {
        match self.owner_field() {
            Some(field) => record
                .field(field)
                .map(Some)
                .ok_or_else(|| PersistError::UnknownField(field.to_string())),
            None => Ok(None),
        }
    }

    fn worker_alive(&self) -> bool {
        self.state.get() == ManagerState::Normal
            && self
                .worker
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Admit a mutation: intake open, manager running
    fn admit(&self) -> Result<RwLockReadGuard<'_, ()>> {
        if !self.intake_open.load(Ordering::Acquire) {
            return Err(PersistError::Stopped);
        }
        if self.state.get() != ManagerState::Normal {
            return Err(PersistError::Dead);
        }
        let guard = self.gate.read();
        if !self.intake_open.load(Ordering::Acquire) {
            return Err(PersistError::Stopped);
        }
        Ok(guard)
    }

    /// A record is writable while its table or its owner is in memory
    fn check_writable(&self, record: &T) -> Result<()> {
        match self.table_state.get() {
            LoadState::Memory => return Ok(()),
            LoadState::PrepareUnloading | LoadState::Unloading => {
                return Err(PersistError::Unloading)
            }
            LoadState::Disk | LoadState::Loading => {}
        }

        let Some(owner) = self.owner_of(record)? else {
            return Err(PersistError::NotInMemory);
        };
        match self.owners.load(&owner).map(|cell| cell.get()) {
            Some(LoadState::Memory) => Ok(()),
            Some(LoadState::PrepareUnloading) | Some(LoadState::Unloading) => {
                Err(PersistError::Unloading)
            }
            _ => Err(PersistError::NotInMemory),
        }
    }

    /// Frozen copy of a record for a pending op
    fn snapshot(&self, record: &RecordRef<T>) -> Arc<T> {
        match &self.pool {
            Some(pool) => Arc::new(pool.acquire(record)),
            // Cached records are immutable behind their Arc
            None => Arc::clone(record.as_arc()),
        }
    }
}
