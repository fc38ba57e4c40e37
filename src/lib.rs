//! # persistcache
//!
//! An in-memory object cache with:
//! - Lock-free reads through read-optimized concurrent maps
//! - Unique and compound secondary indices
//! - Batched asynchronous write-back to a pluggable store
//! - Crash recovery of unflushed writes through a checksummed bomb file
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Registry                            │
//! │         (SchemaCache + every RecordManager by name)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                    RecordManager<T>                         │
//! │        (load states, mutations, write-back pipeline)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Indices   │          │ Flush worker│──────► Store
//!   │ (syncmap)   │          │ (crossbeam) │
//!   └─────────────┘          └──────┬──────┘
//!                                   │ at exit, if the store is down
//!                                   ▼
//!                           ┌─────────────┐
//!                           │  Bomb file  │
//!                           │ (op codec)  │
//!                           └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod bomb;
pub mod codec;
pub mod manager;
pub mod op;
pub mod registry;
pub mod schema;
pub mod store;
pub mod syncmap;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{ManagerConfig, ManagerConfigBuilder};
pub use error::{ErrorClass, PersistError, Result};
pub use manager::{
    ExitReport, LoadState, ManagerState, ManagerStats, PipelineStats, RecordManager, RecordRef,
};
pub use op::{OpKind, PendingOp};
pub use registry::{Persist, Registry};
pub use schema::{
    CompoundKey, FieldBitSet, FieldDef, FieldKind, FieldSchema, FieldValue, IndexDef, Record,
    RecordManifest, SchemaCache,
};
pub use store::{MemoryStore, Overload, Store};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of persistcache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
