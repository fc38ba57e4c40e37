//! Pending write-back operations

use std::fmt;
use std::sync::Arc;

use crate::error::{PersistError, Result};
use crate::schema::{FieldBitSet, Record};

/// Kind of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Insert = 1,
    Update = 2,
    Delete = 3,
    /// Final full write of a record evicted by unload
    Unload = 4,
}

impl OpKind {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(OpKind::Insert),
            2 => Ok(OpKind::Update),
            3 => Ok(OpKind::Delete),
            4 => Ok(OpKind::Unload),
            other => Err(PersistError::Codec(format!("unknown op kind {}", other))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Unload => "unload",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An operation waiting to be applied to the store
///
/// Holds a snapshot of the record taken at enqueue time, so later
/// in-memory mutations never leak into an already queued write.
#[derive(Clone)]
pub struct PendingOp<T: Record> {
    pub record: Arc<T>,
    pub kind: OpKind,
    /// Fields this op writes (full bitset except for Update)
    pub fields: FieldBitSet,
}

impl<T: Record> PendingOp<T> {
    pub fn new(record: Arc<T>, kind: OpKind, fields: FieldBitSet) -> Self {
        Self {
            record,
            kind,
            fields,
        }
    }

    pub fn key(&self) -> T::Key {
        self.record.primary_key()
    }
}

impl<T: Record> fmt::Debug for PendingOp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOp")
            .field("kind", &self.kind)
            .field("key", &self.key())
            .field("fields", &self.fields)
            .finish()
    }
}
