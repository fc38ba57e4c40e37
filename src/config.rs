//! Configuration for persistcache
//!
//! Centralized configuration for a [`RecordManager`](crate::RecordManager)
//! with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PersistError, Result};

/// Configuration for one record manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding crash-recovery files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── {table}.bomb      (unflushed ops left at exit)
    ///     └── {table}.bomb.tmp  (only while a bomb is being written)
    pub data_dir: PathBuf,

    /// Backing table name; `None` uses the name from the record manifest
    pub table_name: Option<String>,

    // -------------------------------------------------------------------------
    // Pipeline Configuration
    // -------------------------------------------------------------------------
    /// Capacity of the bounded pending-op channel
    pub queue_capacity: usize,

    /// Flush as soon as this many ops are accumulated
    pub batch_size: usize,

    /// Timer tick for flushing partial batches and retrying failures
    pub flush_interval: Duration,

    /// Coalesce consecutive ops on the same key inside one batch
    pub merge_ops: bool,

    /// Flush attempts made at exit before writing the bomb file
    pub exit_flush_retries: usize,

    // -------------------------------------------------------------------------
    // Backpressure Configuration
    // -------------------------------------------------------------------------
    /// Backlog size that triggers the overload callback
    pub overload_backlog: usize,

    /// Last flush latency that triggers the overload callback
    pub overload_latency: Duration,

    /// Fail with `Overloaded` instead of blocking when the channel is full
    pub shed_on_full: bool,

    // -------------------------------------------------------------------------
    // Optimization Flags
    // -------------------------------------------------------------------------
    /// Reuse snapshot allocations; disables delete and unload
    pub pooled: bool,

    /// Maximum number of idle objects kept by the pool
    pub pool_capacity: usize,

    /// Serialize index reconciliation (strict instead of eventual consistency)
    pub index_mutex: bool,

    /// Log every enqueued op under the `persistcache::trace` target
    pub trace_ops: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./persist_data"),
            table_name: None,
            queue_capacity: 1024,
            batch_size: 100,
            flush_interval: Duration::from_millis(100),
            merge_ops: true,
            exit_flush_retries: 3,
            overload_backlog: 10_000,
            overload_latency: Duration::from_secs(1),
            shed_on_full: false,
            pooled: false,
            pool_capacity: 1024,
            index_mutex: false,
            trace_ops: false,
        }
    }
}

impl ManagerConfig {
    /// Create a new config builder
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(PersistError::Config("queue_capacity must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(PersistError::Config("batch_size must be > 0".to_string()));
        }
        if self.flush_interval.is_zero() {
            return Err(PersistError::Config("flush_interval must be > 0".to_string()));
        }
        if self.pooled && self.pool_capacity == 0 {
            return Err(PersistError::Config(
                "pool_capacity must be > 0 in pooled mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ManagerConfig
#[derive(Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set the directory for crash-recovery files
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Override the backing table name
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.config.table_name = Some(name.into());
        self
    }

    /// Set the pending-op channel capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the batch size that triggers an immediate flush
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the flush timer interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Enable or disable per-key op coalescing
    pub fn merge_ops(mut self, enabled: bool) -> Self {
        self.config.merge_ops = enabled;
        self
    }

    /// Set how many flush attempts exit makes before writing a bomb file
    pub fn exit_flush_retries(mut self, retries: usize) -> Self {
        self.config.exit_flush_retries = retries;
        self
    }

    /// Set the backlog threshold for the overload callback
    pub fn overload_backlog(mut self, backlog: usize) -> Self {
        self.config.overload_backlog = backlog;
        self
    }

    /// Set the flush latency threshold for the overload callback
    pub fn overload_latency(mut self, latency: Duration) -> Self {
        self.config.overload_latency = latency;
        self
    }

    /// Shed load with `Overloaded` instead of blocking on a full queue
    pub fn shed_on_full(mut self, enabled: bool) -> Self {
        self.config.shed_on_full = enabled;
        self
    }

    /// Enable pooled snapshot allocation (disables delete and unload)
    pub fn pooled(mut self, enabled: bool) -> Self {
        self.config.pooled = enabled;
        self
    }

    /// Set the pool capacity
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    /// Serialize index reconciliation
    pub fn index_mutex(mut self, enabled: bool) -> Self {
        self.config.index_mutex = enabled;
        self
    }

    /// Log every enqueued op
    pub fn trace_ops(mut self, enabled: bool) -> Self {
        self.config.trace_ops = enabled;
        self
    }

    pub fn build(self) -> ManagerConfig {
        self.config
    }
}
