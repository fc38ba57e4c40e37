//! Error types for persistcache
//!
//! Provides a unified error type for all operations. Variants are grouped
//! by [`ErrorClass`] so supervisors can decide what is retryable.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using PersistError
pub type Result<T> = std::result::Result<T, PersistError>;

/// Unified error type for persistcache operations
#[derive(Debug, Error)]
pub enum PersistError {
    // -------------------------------------------------------------------------
    // State Errors (precondition failures, returned synchronously)
    // -------------------------------------------------------------------------
    #[error("persist: not in memory")]
    NotInMemory,

    #[error("persist: already exist")]
    AlreadyExists,

    #[error("persist: already load")]
    AlreadyLoad,

    #[error("persist: already load all")]
    AlreadyLoadAll,

    #[error("persist: already unload")]
    AlreadyUnload,

    #[error("persist: loading state")]
    Loading,

    #[error("persist: unloading state")]
    Unloading,

    #[error("persist: manager is not running")]
    Dead,

    #[error("persist: manager is stopping")]
    Stopped,

    #[error("persist: pending queue overloaded ({backlog} ops queued)")]
    Overloaded { backlog: usize },

    #[error("persist: delete and unload are disabled in pooled mode")]
    DeleteDisabled,

    #[error("persist: {0} unflushed ops still queued for retry")]
    Unflushed(usize),

    #[error("persist: record type is not owner-partitioned")]
    NotPartitioned,

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("persist: nil")]
    Nil,

    #[error("persist: duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("persist: invalid bomb file: {0}")]
    InvalidBombFile(String),

    #[error("persist: temp file exist: {}", .0.display())]
    TempFileExist(PathBuf),

    #[error("persist: unknown field {0:?}")]
    UnknownField(String),

    #[error("persist: unknown index {0:?}")]
    UnknownIndex(String),

    #[error("persist: field {field:?} expects {expected}, got {actual}")]
    FieldType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("persist: schema error: {0}")]
    Schema(String),

    #[error("persist: codec error: {0}")]
    Codec(String),

    // -------------------------------------------------------------------------
    // I/O Errors (recovered through the fail queue)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(String),

    // -------------------------------------------------------------------------
    // Panic Errors
    // -------------------------------------------------------------------------
    #[error("persist: flush worker panicked: {0}")]
    FlushPanic(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of a [`PersistError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Load state or manager state does not allow the operation
    State,
    /// The input or a durable payload is malformed
    Integrity,
    /// The backing store or the filesystem failed
    Io,
    /// The flush worker panicked
    Panic,
    /// Invalid configuration
    Config,
}

impl PersistError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        use PersistError::*;
        match self {
            NotInMemory | AlreadyExists | AlreadyLoad | AlreadyLoadAll | AlreadyUnload
            | Loading | Unloading | Dead | Stopped | Overloaded { .. } | DeleteDisabled
            | Unflushed(_) | NotPartitioned => ErrorClass::State,
            Nil
            | DuplicateRegistration(_)
            | InvalidBombFile(_)
            | TempFileExist(_)
            | UnknownField(_)
            | UnknownIndex(_)
            | FieldType { .. }
            | Schema(_)
            | Codec(_) => ErrorClass::Integrity,
            Io(_) | Store(_) => ErrorClass::Io,
            FlushPanic(_) => ErrorClass::Panic,
            Config(_) => ErrorClass::Config,
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Io
    }
}
