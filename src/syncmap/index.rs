//! Index shapes built on `ConcurrentMap`
//!
//! - `UniqueIndex` / `PrimaryIndex`: one value per key, last write wins
//! - `CompoundIndex`: many values per key, each bucket a `ConcurrentSet`
//! - `ConcurrentSet`: membership set

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use super::ConcurrentMap;

/// Concurrent set of values
pub struct ConcurrentSet<V> {
    items: ConcurrentMap<V, bool>,
}

impl<V> ConcurrentSet<V>
where
    V: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            items: ConcurrentMap::new(),
        }
    }

    /// Add a value; returns true if it was not already present
    pub fn insert(&self, value: V) -> bool {
        !self.items.load_or_store(value, true).1
    }

    /// Remove a value; returns true if it was present
    pub fn remove(&self, value: &V) -> bool {
        self.items.load_and_delete(value).is_some()
    }

    pub fn contains(&self, value: &V) -> bool {
        self.items.load(value).is_some()
    }

    /// Visit each member until `f` returns false
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&V) -> bool,
    {
        self.items.range(|v, _| f(v));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Snapshot of the members
    pub fn to_vec(&self) -> Vec<V> {
        self.items.keys()
    }

    pub fn clear(&self) {
        self.items.clear();
    }
}

impl<V: Eq + Hash + Clone> Default for ConcurrentSet<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Eq + Hash + Clone + fmt::Debug> fmt::Debug for ConcurrentSet<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.to_vec()).finish()
    }
}

/// Index holding one value per key
pub struct UniqueIndex<K, V> {
    map: ConcurrentMap<K, V>,
}

/// The primary index is a unique index keyed by the record's primary key
pub type PrimaryIndex<K, V> = UniqueIndex<K, V>;

impl<K, V> UniqueIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            map: ConcurrentMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.load(key)
    }

    /// Set the value for a key, returning the one it replaced
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.map.swap(key, value)
    }

    /// Set the value only if the key is absent.
    /// Returns the existing value when there is one.
    pub fn set_if_absent(&self, key: K, value: V) -> Option<V> {
        match self.map.load_or_store(key, value) {
            (existing, true) => Some(existing),
            (_, false) => None,
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.load_and_delete(key)
    }

    pub fn has(&self, key: &K) -> bool {
        self.map.load(key).is_some()
    }

    /// Remove a key only while it still maps to `expected`
    pub fn compare_and_remove(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.map.compare_and_delete(key, expected)
    }

    /// Replace a key's value only while it still maps to `expected`
    pub fn compare_and_set(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        self.map.compare_and_swap(key, expected, value)
    }

    pub fn range<F>(&self, f: F)
    where
        F: FnMut(&K, V) -> bool,
    {
        self.map.range(f);
    }

    pub fn values(&self) -> Vec<V> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

impl<K, V> Default for UniqueIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Index holding a set of values per key
///
/// Buckets are created on first sight of a key and are only dropped by
/// `clear`; emptying a bucket keeps it in the map, so a concurrent `add`
/// never lands in a bucket that was already dropped.
pub struct CompoundIndex<K, V> {
    buckets: ConcurrentMap<K, Arc<ConcurrentSet<V>>>,
}

impl<K, V> CompoundIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            buckets: ConcurrentMap::new(),
        }
    }

    fn bucket(&self, key: K) -> Arc<ConcurrentSet<V>> {
        if let Some(set) = self.buckets.load(&key) {
            return set;
        }
        self.buckets
            .load_or_store(key, Arc::new(ConcurrentSet::new()))
            .0
    }

    /// Add a value under a key
    pub fn add(&self, key: K, value: V) -> bool {
        self.bucket(key).insert(value)
    }

    /// Remove a value from a key's bucket
    pub fn remove(&self, key: &K, value: &V) -> bool {
        match self.buckets.load(key) {
            Some(set) => set.remove(value),
            None => false,
        }
    }

    /// Drop every value under a key, keeping the bucket
    pub fn remove_all(&self, key: &K) {
        if let Some(set) = self.buckets.load(key) {
            set.clear();
        }
    }

    pub fn has(&self, key: &K, value: &V) -> bool {
        self.buckets
            .load(key)
            .map(|set| set.contains(value))
            .unwrap_or(false)
    }

    /// Snapshot of every value under a key
    pub fn get_all(&self, key: &K) -> Vec<V> {
        self.buckets
            .load(key)
            .map(|set| set.to_vec())
            .unwrap_or_default()
    }

    /// Visit each value under a key until `f` returns false
    pub fn range_values<F>(&self, key: &K, f: F)
    where
        F: FnMut(&V) -> bool,
    {
        if let Some(set) = self.buckets.load(key) {
            set.range(f);
        }
    }

    /// Number of values under a key
    pub fn count(&self, key: &K) -> usize {
        self.buckets.load(key).map(|set| set.len()).unwrap_or(0)
    }

    /// Keys that currently have a bucket (possibly empty)
    pub fn keys(&self) -> Vec<K> {
        self.buckets.keys()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl<K, V> Default for CompoundIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
