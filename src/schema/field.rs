//! Field schema and the per-type schema cache

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PersistError, Result};

use super::{FieldKind, Record, RecordManifest};

/// Bits per bitset word
pub(crate) const WORD_BITS: usize = 64;

/// Field metadata of one record type
///
/// Fields are ordered lexicographically by name; a field's position is its
/// bit index in every `FieldBitSet` of this type.
#[derive(Debug)]
pub struct FieldSchema {
    table: &'static str,
    names: Vec<&'static str>,
    kinds: Vec<FieldKind>,
    index: HashMap<&'static str, usize>,
    primary_key: Vec<usize>,
    owner: Option<usize>,
    words: usize,
}

impl FieldSchema {
    /// Build and validate a schema from a manifest
    pub fn from_manifest(manifest: &RecordManifest) -> Result<Self> {
        let mut fields: Vec<_> = manifest.fields.to_vec();
        fields.sort_by(|a, b| a.name.cmp(b.name));

        let mut index = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if index.insert(field.name, i).is_some() {
                return Err(PersistError::Schema(format!(
                    "{}: duplicate field {:?}",
                    manifest.table, field.name
                )));
            }
        }

        let lookup = |name: &str, role: &str| -> Result<usize> {
            index.get(name).copied().ok_or_else(|| {
                PersistError::Schema(format!(
                    "{}: {} field {:?} is not declared",
                    manifest.table, role, name
                ))
            })
        };

        if manifest.primary_key.is_empty() {
            return Err(PersistError::Schema(format!(
                "{}: no primary key",
                manifest.table
            )));
        }
        let primary_key = manifest
            .primary_key
            .iter()
            .map(|name| lookup(name, "primary key"))
            .collect::<Result<Vec<_>>>()?;

        let owner = manifest
            .owner
            .map(|name| lookup(name, "owner"))
            .transpose()?;

        let mut index_names = HashSet::new();
        for def in manifest.indexes {
            if !index_names.insert(def.name) {
                return Err(PersistError::Schema(format!(
                    "{}: duplicate index {:?}",
                    manifest.table, def.name
                )));
            }
            if def.fields.is_empty() {
                return Err(PersistError::Schema(format!(
                    "{}: index {:?} has no fields",
                    manifest.table, def.name
                )));
            }
            for name in def.fields {
                lookup(name, "index")?;
            }
        }

        let bits = fields.len();
        Ok(Self {
            table: manifest.table,
            names: fields.iter().map(|f| f.name).collect(),
            kinds: fields.iter().map(|f| f.kind).collect(),
            index,
            primary_key,
            owner,
            words: bits.div_ceil(WORD_BITS),
        })
    }

    /// Default table name from the manifest
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Number of fields (bits in a full bitset)
    pub fn field_count(&self) -> usize {
        self.names.len()
    }

    /// Number of 64-bit words in a bitset
    pub fn word_count(&self) -> usize {
        self.words
    }

    /// Bit index of a field
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Field name at a bit index
    pub fn name(&self, index: usize) -> &'static str {
        self.names[index]
    }

    /// Field kind at a bit index
    pub fn kind(&self, index: usize) -> FieldKind {
        self.kinds[index]
    }

    /// Field names in bit order
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// Bit indices of the primary key fields
    pub fn primary_key(&self) -> &[usize] {
        &self.primary_key
    }

    /// Bit index of the owner field, if the type is owner-partitioned
    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    /// Mask of valid bits in the last word
    pub(crate) fn tail_mask(&self) -> u64 {
        match self.names.len() % WORD_BITS {
            0 => u64::MAX,
            extra => (1u64 << extra) - 1,
        }
    }
}

/// Schemas memoized by record type
///
/// Owned by the application root (see `Registry`); schemas never change at
/// runtime so entries are never invalidated.
#[derive(Default)]
pub struct SchemaCache {
    by_type: RwLock<HashMap<TypeId, Arc<FieldSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema of `T`, built on first request
    pub fn schema<T: Record>(&self) -> Result<Arc<FieldSchema>> {
        let id = TypeId::of::<T>();
        if let Some(schema) = self.by_type.read().get(&id) {
            return Ok(Arc::clone(schema));
        }

        let built = Arc::new(FieldSchema::from_manifest(T::manifest())?);
        let mut by_type = self.by_type.write();
        // Another thread may have won the race; keep the first one
        Ok(Arc::clone(by_type.entry(id).or_insert(built)))
    }

    /// Number of cached schemas
    pub fn len(&self) -> usize {
        self.by_type.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.read().is_empty()
    }
}
