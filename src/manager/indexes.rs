//! Primary and secondary indices of one manager

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{PersistError, Result};
use crate::schema::{CompoundKey, FieldValue, IndexDef, Record};
use crate::syncmap::{CompoundIndex, PrimaryIndex, UniqueIndex};

/// Shared handle to a cached record
///
/// Equality and hashing use pointer identity: two handles are equal only
/// if they point at the same allocation. Index buckets and compare-and-swap
/// on the primary index rely on this.
pub struct RecordRef<T>(Arc<T>);

impl<T> RecordRef<T> {
    pub fn new(record: T) -> Self {
        Self(Arc::new(record))
    }

    pub fn from_arc(record: Arc<T>) -> Self {
        Self(record)
    }

    pub fn as_arc(&self) -> &Arc<T> {
        &self.0
    }

    pub fn into_arc(self) -> Arc<T> {
        self.0
    }
}

impl<T> Clone for RecordRef<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> PartialEq for RecordRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Eq for RecordRef<T> {}

impl<T> Hash for RecordRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl<T> Deref for RecordRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for RecordRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

enum SecondaryKind<T> {
    Unique(UniqueIndex<CompoundKey, RecordRef<T>>),
    Multi(CompoundIndex<CompoundKey, RecordRef<T>>),
}

struct Secondary<T> {
    def: IndexDef,
    kind: SecondaryKind<T>,
}

impl<T: Record> Secondary<T> {
    fn key_of(&self, record: &T) -> Result<CompoundKey> {
        self.def
            .fields
            .iter()
            .map(|name| {
                record
                    .field(name)
                    .ok_or_else(|| PersistError::UnknownField(name.to_string()))
            })
            .collect::<Result<Vec<FieldValue>>>()
            .map(CompoundKey::new)
    }

    fn add(&self, key: CompoundKey, record: RecordRef<T>) {
        match &self.kind {
            SecondaryKind::Unique(index) => {
                index.set(key, record);
            }
            SecondaryKind::Multi(index) => {
                index.add(key, record);
            }
        }
    }

    fn remove(&self, key: &CompoundKey, record: &RecordRef<T>) {
        match &self.kind {
            // Only remove if another record has not taken the key since
            SecondaryKind::Unique(index) => {
                index.compare_and_remove(key, record);
            }
            SecondaryKind::Multi(index) => {
                index.remove(key, record);
            }
        }
    }
}

/// Stripes of the per-key mutation lock
const KEY_STRIPES: usize = 64;

/// All indices of a record type
///
/// The primary index owns membership; secondaries follow it. Mutations of
/// one primary key are serialized by a striped lock, so the secondaries end
/// up holding exactly the record the primary holds. With `strict` set,
/// every index change also runs under one mutex so readers never observe a
/// record in two buckets of the same index.
pub(crate) struct Indexes<T: Record> {
    primary: PrimaryIndex<T::Key, RecordRef<T>>,
    secondaries: Vec<Secondary<T>>,
    by_name: HashMap<&'static str, usize>,
    key_locks: Box<[Mutex<()>]>,
    strict: Option<Mutex<()>>,
}

impl<T: Record> Indexes<T> {
    pub(crate) fn new(strict: bool) -> Self {
        let defs = T::manifest().indexes;
        let secondaries: Vec<_> = defs
            .iter()
            .map(|def| Secondary {
                def: *def,
                kind: if def.unique {
                    SecondaryKind::Unique(UniqueIndex::new())
                } else {
                    SecondaryKind::Multi(CompoundIndex::new())
                },
            })
            .collect();
        let by_name = defs.iter().enumerate().map(|(i, def)| (def.name, i)).collect();

        Self {
            primary: PrimaryIndex::new(),
            secondaries,
            by_name,
            key_locks: (0..KEY_STRIPES).map(|_| Mutex::new(())).collect(),
            strict: strict.then(|| Mutex::new(())),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.strict.as_ref().map(|m| m.lock())
    }

    fn lock_key(&self, key: &T::Key) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.key_locks[(hasher.finish() % KEY_STRIPES as u64) as usize].lock()
    }

    fn secondary_keys(&self, record: &T) -> Result<Vec<CompoundKey>> {
        self.secondaries.iter().map(|s| s.key_of(record)).collect()
    }

    fn secondary(&self, name: &str) -> Result<&Secondary<T>> {
        self.by_name
            .get(name)
            .map(|&i| &self.secondaries[i])
            .ok_or_else(|| PersistError::UnknownIndex(name.to_string()))
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Add a record whose key must not exist yet
    pub(crate) fn insert(&self, record: RecordRef<T>) -> Result<()> {
        let keys = self.secondary_keys(&record)?;
        let _key = self.lock_key(&record.primary_key());
        let _guard = self.lock();
        if self
            .primary
            .set_if_absent(record.primary_key(), record.clone())
            .is_some()
        {
            return Err(PersistError::AlreadyExists);
        }
        for (secondary, key) in self.secondaries.iter().zip(keys) {
            secondary.add(key, record.clone());
        }
        Ok(())
    }

    /// Replace the record with the same key, returning the one replaced
    pub(crate) fn replace(&self, record: RecordRef<T>) -> Result<RecordRef<T>> {
        let new_keys = self.secondary_keys(&record)?;
        let key = record.primary_key();
        let _key = self.lock_key(&key);
        let _guard = self.lock();
        let prev = loop {
            let prev = self.primary.get(&key).ok_or(PersistError::Nil)?;
            if self.primary.compare_and_set(&key, &prev, record.clone()) {
                break prev;
            }
        };
        self.reconcile(&prev, &record, new_keys)?;
        Ok(prev)
    }

    /// Install a record, replacing any record with the same key
    pub(crate) fn install(&self, record: RecordRef<T>) -> Result<()> {
        let new_keys = self.secondary_keys(&record)?;
        let _key = self.lock_key(&record.primary_key());
        let _guard = self.lock();
        match self.primary.set(record.primary_key(), record.clone()) {
            Some(prev) => self.reconcile(&prev, &record, new_keys)?,
            None => {
                for (secondary, key) in self.secondaries.iter().zip(new_keys) {
                    secondary.add(key, record.clone());
                }
            }
        }
        Ok(())
    }

    /// Remove the record with this key
    pub(crate) fn remove(&self, key: &T::Key) -> Result<RecordRef<T>> {
        let _key = self.lock_key(key);
        let _guard = self.lock();
        let prev = loop {
            let prev = self.primary.get(key).ok_or(PersistError::Nil)?;
            if self.primary.compare_and_remove(key, &prev) {
                break prev;
            }
        };
        self.unlink(&prev)?;
        Ok(prev)
    }

    /// Remove a specific record if it is still the current one for its key
    pub(crate) fn evict(&self, record: &RecordRef<T>) -> Result<bool> {
        let key = record.primary_key();
        let _key = self.lock_key(&key);
        let _guard = self.lock();
        if !self.primary.compare_and_remove(&key, record) {
            return Ok(false);
        }
        self.unlink(record)?;
        Ok(true)
    }

    fn reconcile(
        &self,
        prev: &RecordRef<T>,
        record: &RecordRef<T>,
        new_keys: Vec<CompoundKey>,
    ) -> Result<()> {
        for (secondary, new_key) in self.secondaries.iter().zip(new_keys) {
            let old_key = secondary.key_of(prev)?;
            secondary.remove(&old_key, prev);
            secondary.add(new_key, record.clone());
        }
        Ok(())
    }

    fn unlink(&self, record: &RecordRef<T>) -> Result<()> {
        for secondary in &self.secondaries {
            let key = secondary.key_of(record)?;
            secondary.remove(&key, record);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub(crate) fn get(&self, key: &T::Key) -> Option<RecordRef<T>> {
        self.primary.get(key)
    }

    pub(crate) fn get_unique(&self, index: &str, key: &CompoundKey) -> Result<Option<RecordRef<T>>> {
        match &self.secondary(index)?.kind {
            SecondaryKind::Unique(index) => Ok(index.get(key)),
            SecondaryKind::Multi(multi) => Ok(multi.get_all(key).into_iter().next()),
        }
    }

    pub(crate) fn get_all(&self, index: &str, key: &CompoundKey) -> Result<Vec<RecordRef<T>>> {
        match &self.secondary(index)?.kind {
            SecondaryKind::Unique(unique) => Ok(unique.get(key).into_iter().collect()),
            SecondaryKind::Multi(multi) => Ok(multi.get_all(key)),
        }
    }

    pub(crate) fn count_by(&self, index: &str, key: &CompoundKey) -> Result<usize> {
        match &self.secondary(index)?.kind {
            SecondaryKind::Unique(unique) => Ok(usize::from(unique.has(key))),
            SecondaryKind::Multi(multi) => Ok(multi.count(key)),
        }
    }

    pub(crate) fn range<F>(&self, mut f: F)
    where
        F: FnMut(&RecordRef<T>) -> bool,
    {
        self.primary.range(|_, record| f(&record));
    }

    pub(crate) fn range_by<F>(&self, index: &str, key: &CompoundKey, mut f: F) -> Result<()>
    where
        F: FnMut(&RecordRef<T>) -> bool,
    {
        match &self.secondary(index)?.kind {
            SecondaryKind::Unique(unique) => {
                if let Some(record) = unique.get(key) {
                    f(&record);
                }
            }
            SecondaryKind::Multi(multi) => multi.range_values(key, f),
        }
        Ok(())
    }

    /// Records whose field `field` equals `value`
    pub(crate) fn matching(&self, field: &str, value: &FieldValue) -> Vec<RecordRef<T>> {
        let mut out = Vec::new();
        self.primary.range(|_, record| {
            if record.field(field).as_ref() == Some(value) {
                out.push(record);
            }
            true
        });
        out
    }

    pub(crate) fn all(&self) -> Vec<RecordRef<T>> {
        self.primary.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.primary.len()
    }
}
