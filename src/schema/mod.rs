//! Schema Module
//!
//! Per-type field metadata supplied by the application.
//!
//! ## Responsibilities
//! - `Record`: the contract a cached type implements (key, field access)
//! - `RecordManifest`: static description of fields, primary key, indices
//! - `FieldSchema`: lexicographic field order, built once per type
//! - `FieldBitSet`: dirty-field tracking over a `FieldSchema`
//!
//! ## Field Ordering
//! ```text
//! declared:  [uid, name, email, age]
//! schema:    [age, email, name, uid]     (sorted by name)
//! bit:         0     1     2     3
//! ```
//! Bit positions never depend on declaration order, so reordering struct
//! fields does not change the binary encoding.

mod bitset;
mod field;
mod value;

use std::fmt;
use std::hash::Hash;

use crate::error::Result;

pub use bitset::FieldBitSet;
pub use field::{FieldSchema, SchemaCache};
pub use value::{CompoundKey, FieldKind, FieldValue};

/// One field of a record type
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldDef {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// A secondary index group
#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    /// Name used for lookups (`get_unique`, `get_all`, ...)
    pub name: &'static str,
    /// Fields forming the compound key, in key order
    pub fields: &'static [&'static str],
    /// Unique indices map a key to one record, others to a set of records
    pub unique: bool,
}

impl IndexDef {
    pub const fn unique(name: &'static str, fields: &'static [&'static str]) -> Self {
        Self {
            name,
            fields,
            unique: true,
        }
    }

    pub const fn multi(name: &'static str, fields: &'static [&'static str]) -> Self {
        Self {
            name,
            fields,
            unique: false,
        }
    }
}

/// Static description of a record type (the schema provider's output)
#[derive(Debug, Clone, Copy)]
pub struct RecordManifest {
    /// Default backing table name
    pub table: &'static str,
    /// All persisted fields, in any order
    pub fields: &'static [FieldDef],
    /// Fields forming the primary key
    pub primary_key: &'static [&'static str],
    /// Secondary index groups
    pub indexes: &'static [IndexDef],
    /// Field partitioning records by owner; `None` for global tables
    pub owner: Option<&'static str>,
}

/// A type cached and written back by a `RecordManager`
///
/// `Clone` must produce a deep copy: pending ops hold a clone taken at
/// enqueue time. `Default` is the all-zero record a decoder starts from.
pub trait Record: Clone + Default + Send + Sync + 'static {
    /// Primary key type
    type Key: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static;

    /// Field and index metadata for this type
    fn manifest() -> &'static RecordManifest;

    /// Primary key of this record
    fn primary_key(&self) -> Self::Key;

    /// Read a field by name
    fn field(&self, name: &str) -> Option<FieldValue>;

    /// Write a field by name
    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<()>;
}
