//! Registry
//!
//! Application-root owner of the schema cache and every record manager.
//!
//! ## Lifecycle
//! ```text
//! Registry::new()
//!   → registry.manager::<T>(config, store)    (once per record type)
//!   → registry.run_all()                       (registration order)
//!   ...
//!   → registry.exit_all()                      (reverse order)
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::{error, info};

use crate::config::ManagerConfig;
use crate::error::{PersistError, Result};
use crate::manager::{ExitReport, LoadState, ManagerStats, RecordManager};
use crate::schema::{FieldValue, Record, SchemaCache};
use crate::store::Store;

/// Type-erased administrative surface of a `RecordManager`
pub trait Persist: Send + Sync {
    /// Table name the manager was registered under
    fn name(&self) -> &str;

    fn run(&self) -> Result<()>;

    fn exit(&self) -> Result<ExitReport>;

    fn dead(&self) -> bool;

    fn stats(&self) -> ManagerStats;

    fn load_all(&self) -> Result<usize>;

    fn segmentation(&self, at: SystemTime) -> Result<String>;

    /// Whether records are partitioned by owner
    fn is_partitioned(&self) -> bool {
        false
    }

    fn load(&self, _owner: &FieldValue) -> Result<usize> {
        Err(PersistError::NotPartitioned)
    }

    fn unload(&self, _owner: &FieldValue) -> Result<usize> {
        Err(PersistError::NotPartitioned)
    }

    fn load_state(&self, _owner: &FieldValue) -> Option<LoadState> {
        None
    }
}

impl<T: Record> Persist for RecordManager<T> {
    fn name(&self) -> &str {
        self.base_table()
    }

    fn run(&self) -> Result<()> {
        RecordManager::run(self)
    }

    fn exit(&self) -> Result<ExitReport> {
        RecordManager::exit(self)
    }

    fn dead(&self) -> bool {
        RecordManager::dead(self)
    }

    fn stats(&self) -> ManagerStats {
        RecordManager::stats(self)
    }

    fn load_all(&self) -> Result<usize> {
        RecordManager::load_all(self)
    }

    fn segmentation(&self, at: SystemTime) -> Result<String> {
        RecordManager::segmentation(self, at)
    }

    fn is_partitioned(&self) -> bool {
        RecordManager::is_partitioned(self)
    }

    fn load(&self, owner: &FieldValue) -> Result<usize> {
        RecordManager::load(self, owner.clone())
    }

    fn unload(&self, owner: &FieldValue) -> Result<usize> {
        RecordManager::unload(self, owner.clone())
    }

    fn load_state(&self, owner: &FieldValue) -> Option<LoadState> {
        self.is_partitioned()
            .then(|| RecordManager::load_state(self, owner))
    }
}

/// Owner of the schema cache and all registered managers
#[derive(Default)]
pub struct Registry {
    schemas: SchemaCache,
    managers: RwLock<Vec<(String, Arc<dyn Persist>)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schemas(&self) -> &SchemaCache {
        &self.schemas
    }

    /// Build a manager for `T` and register it under its table name
    pub fn manager<T: Record>(
        &self,
        config: ManagerConfig,
        store: Arc<dyn Store<T>>,
    ) -> Result<Arc<RecordManager<T>>> {
        let manager = Arc::new(RecordManager::with_schemas(&self.schemas, config, store)?);
        self.register(manager.clone())?;
        Ok(manager)
    }

    /// Register a manager; names must be unique
    pub fn register(&self, persist: Arc<dyn Persist>) -> Result<()> {
        let name = persist.name().to_string();
        let mut managers = self.managers.write();
        if managers.iter().any(|(n, _)| *n == name) {
            return Err(PersistError::DuplicateRegistration(name));
        }
        managers.push((name, persist));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Persist>> {
        self.managers
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| Arc::clone(p))
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<String> {
        self.managers.read().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.managers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.read().is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Persist>)> {
        self.managers.read().clone()
    }

    /// Start every manager in registration order, stopping at the first error
    pub fn run_all(&self) -> Result<()> {
        for (name, persist) in self.snapshot() {
            persist.run().map_err(|e| {
                error!(table = %name, error = %e, "manager failed to start");
                e
            })?;
        }
        info!(managers = self.len(), "all managers running");
        Ok(())
    }

    /// Exit every manager in reverse registration order
    pub fn exit_all(&self) -> Vec<(String, Result<ExitReport>)> {
        self.snapshot()
            .into_iter()
            .rev()
            .map(|(name, persist)| {
                let report = persist.exit();
                if let Err(e) = &report {
                    error!(table = %name, error = %e, "manager exit failed");
                }
                (name, report)
            })
            .collect()
    }

    /// True if any manager is not running normally
    pub fn dead(&self) -> bool {
        self.managers.read().iter().any(|(_, p)| p.dead())
    }

    /// Load one owner in every partitioned manager
    ///
    /// Managers that already hold the owner (or the whole table) are
    /// skipped. Returns the number of records loaded.
    pub fn load(&self, owner: &FieldValue) -> Result<usize> {
        let mut total = 0;
        for (_, persist) in self.snapshot() {
            if !persist.is_partitioned() {
                continue;
            }
            match persist.load(owner) {
                Ok(n) => total += n,
                Err(PersistError::AlreadyLoad) | Err(PersistError::AlreadyLoadAll) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Unload one owner from every partitioned manager
    pub fn unload(&self, owner: &FieldValue) -> Result<usize> {
        let mut total = 0;
        for (_, persist) in self.snapshot().into_iter().rev() {
            if !persist.is_partitioned() {
                continue;
            }
            match persist.unload(owner) {
                Ok(n) => total += n,
                Err(PersistError::AlreadyUnload) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Load state of one owner in every partitioned manager
    pub fn load_state(&self, owner: &FieldValue) -> Vec<(String, LoadState)> {
        self.snapshot()
            .into_iter()
            .filter_map(|(name, p)| p.load_state(owner).map(|state| (name, state)))
            .collect()
    }

    /// Segment every manager's table at `at`, returning the new names
    pub fn segmentation_all(&self, at: SystemTime) -> Result<Vec<String>> {
        self.snapshot()
            .into_iter()
            .map(|(_, p)| p.segmentation(at))
            .collect()
    }

    /// Stats of every manager in registration order
    pub fn stats(&self) -> Vec<ManagerStats> {
        self.snapshot().into_iter().map(|(_, p)| p.stats()).collect()
    }
}
