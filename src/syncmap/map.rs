//! ConcurrentMap implementation
//!
//! Read-optimized hash map: a published read-only snapshot serves most
//! lookups without locking, a mutex-guarded dirty map absorbs new keys.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::entry::Entry;

/// Immutable snapshot of the map published to readers
struct ReadOnly<K, V> {
    m: Arc<HashMap<K, Arc<Entry<V>>>>,
    /// True when the dirty map holds keys missing from `m`
    amended: bool,
}

impl<K, V> ReadOnly<K, V> {
    fn empty() -> Self {
        Self {
            m: Arc::new(HashMap::new()),
            amended: false,
        }
    }
}

/// Mutex-guarded side of the map
struct Dirty<K, V> {
    /// Superset of the non-tombstoned snapshot entries plus new keys.
    /// `None` until the first insert of a key the snapshot does not have.
    map: Option<HashMap<K, Arc<Entry<V>>>>,
    /// Lookups that had to fall through to `map` since the last promotion
    misses: usize,
}

/// Concurrent map with lock-free reads of published keys
///
/// ## Concurrency:
/// - `read`: snapshot swapped atomically; loads never block
/// - `dirty`: new keys and slow paths serialize on one mutex
/// - Values of keys in the snapshot are updated in place through their
///   slots without taking the mutex
///
/// Once the slow path has missed as many times as the dirty map has
/// entries, the dirty map is promoted to be the new snapshot, so the
/// promotion cost is amortized over the misses that triggered it.
pub struct ConcurrentMap<K, V> {
    read: ArcSwap<ReadOnly<K, V>>,
    dirty: Mutex<Dirty<K, V>>,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty map
    pub fn new() -> Self {
        Self {
            read: ArcSwap::from_pointee(ReadOnly::empty()),
            dirty: Mutex::new(Dirty {
                map: None,
                misses: 0,
            }),
        }
    }

    /// Get the value stored for a key
    pub fn load(&self, key: &K) -> Option<V> {
        let read = self.read.load();
        if let Some(e) = read.m.get(key) {
            return e.load();
        }
        if !read.amended {
            return None;
        }
        drop(read);

        let entry = {
            let mut dirty = self.dirty.lock();
            let read = self.read.load_full();
            match read.m.get(key) {
                Some(e) => Some(Arc::clone(e)),
                None if read.amended => {
                    let e = dirty.map.as_ref().and_then(|m| m.get(key)).cloned();
                    self.miss_locked(&mut dirty);
                    e
                }
                None => None,
            }
        };
        entry.and_then(|e| e.load())
    }

    /// Store a value for a key
    pub fn store(&self, key: K, value: V) {
        self.swap(key, value);
    }

    /// Store a value for a key, returning the previous value
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        let mut value = value;
        if let Some(e) = self.read.load().m.get(&key) {
            match e.try_swap(value) {
                Ok(prev) => return prev,
                Err(v) => value = v,
            }
        }

        let mut dirty = self.dirty.lock();
        let read = self.read.load_full();
        if let Some(e) = read.m.get(&key) {
            if e.unexpunge_locked() {
                // Tombstoned slots are not in the dirty map; put it back
                if let Some(m) = dirty.map.as_mut() {
                    m.insert(key, Arc::clone(e));
                }
            }
            e.swap_locked(value)
        } else if let Some(e) = dirty.map.as_ref().and_then(|m| m.get(&key)) {
            e.swap_locked(value)
        } else {
            if !read.amended {
                self.dirty_locked(&mut dirty, &read);
                self.read.store(Arc::new(ReadOnly {
                    m: Arc::clone(&read.m),
                    amended: true,
                }));
            }
            if let Some(m) = dirty.map.as_mut() {
                m.insert(key, Arc::new(Entry::new(value)));
            }
            None
        }
    }

    /// Return the existing value for a key, or store and return `value`.
    ///
    /// The flag is true if the value was loaded, false if stored.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        let mut value = value;
        if let Some(e) = self.read.load().m.get(&key) {
            match e.try_load_or_store(value) {
                Ok(result) => return result,
                Err(v) => value = v,
            }
        }

        let mut dirty = self.dirty.lock();
        let read = self.read.load_full();
        if let Some(e) = read.m.get(&key) {
            if e.unexpunge_locked() {
                if let Some(m) = dirty.map.as_mut() {
                    m.insert(key, Arc::clone(e));
                }
            }
            match e.try_load_or_store(value) {
                Ok(result) => result,
                // Unexpunged under the lock, so the slot can't be a tombstone
                Err(v) => (v, false),
            }
        } else if let Some(e) = dirty.map.as_ref().and_then(|m| m.get(&key)).cloned() {
            self.miss_locked(&mut dirty);
            match e.try_load_or_store(value) {
                Ok(result) => result,
                Err(v) => (v, false),
            }
        } else {
            if !read.amended {
                self.dirty_locked(&mut dirty, &read);
                self.read.store(Arc::new(ReadOnly {
                    m: Arc::clone(&read.m),
                    amended: true,
                }));
            }
            if let Some(m) = dirty.map.as_mut() {
                m.insert(key, Arc::new(Entry::new(value.clone())));
            }
            (value, false)
        }
    }

    /// Delete a key, returning the value it had
    pub fn load_and_delete(&self, key: &K) -> Option<V> {
        self.locate(key, true).and_then(|e| e.delete())
    }

    /// Delete a key
    pub fn delete(&self, key: &K) {
        self.load_and_delete(key);
    }

    /// Replace the value for a key only if it currently equals `old`
    pub fn compare_and_swap(&self, key: &K, old: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        match self.locate(key, false) {
            Some(e) => e.try_compare_and_swap(old, new),
            None => false,
        }
    }

    /// Delete a key only if its value currently equals `old`
    pub fn compare_and_delete(&self, key: &K, old: &V) -> bool
    where
        V: PartialEq,
    {
        match self.locate(key, false) {
            Some(e) => e.try_compare_and_delete(old),
            None => false,
        }
    }

    /// Call `f` for each present key/value until it returns false.
    ///
    /// Pending dirty keys are promoted first, so the walk sees one
    /// consistent key set. Values may change during the walk; each is read
    /// at most once.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, V) -> bool,
    {
        let mut read = self.read.load_full();
        if read.amended {
            let mut dirty = self.dirty.lock();
            read = self.read.load_full();
            if read.amended {
                let promoted = Arc::new(ReadOnly {
                    m: Arc::new(dirty.map.take().unwrap_or_default()),
                    amended: false,
                });
                self.read.store(Arc::clone(&promoted));
                dirty.misses = 0;
                read = promoted;
            }
        }

        for (k, e) in read.m.iter() {
            if let Some(v) = e.load() {
                if !f(k, v) {
                    break;
                }
            }
        }
    }

    /// Remove every key
    pub fn clear(&self) {
        let mut dirty = self.dirty.lock();
        let read = self.read.load();
        if !read.m.is_empty() || read.amended {
            drop(read);
            self.read.store(Arc::new(ReadOnly::empty()));
        }
        dirty.map = None;
        dirty.misses = 0;
    }

    /// Number of present keys (walks the map)
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.range(|_, _| {
            n += 1;
            true
        });
        n
    }

    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.range(|_, _| {
            empty = false;
            false
        });
        empty
    }

    /// Snapshot of all present keys
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::new();
        self.range(|k, _| {
            keys.push(k.clone());
            true
        });
        keys
    }

    /// Snapshot of all present values
    pub fn values(&self) -> Vec<V> {
        let mut values = Vec::new();
        self.range(|_, v| {
            values.push(v);
            true
        });
        values
    }

    /// Whether the dirty map currently holds keys the snapshot lacks
    pub fn is_amended(&self) -> bool {
        self.read.load().amended
    }

    /// Find the slot for a key, taking the slow path if needed.
    /// With `remove_dirty`, a key found only in the dirty map is removed
    /// from it.
    fn locate(&self, key: &K, remove_dirty: bool) -> Option<Arc<Entry<V>>> {
        {
            let read = self.read.load();
            if let Some(e) = read.m.get(key) {
                return Some(Arc::clone(e));
            }
            if !read.amended {
                return None;
            }
        }

        let mut dirty = self.dirty.lock();
        let read = self.read.load_full();
        if let Some(e) = read.m.get(key) {
            return Some(Arc::clone(e));
        }
        if !read.amended {
            return None;
        }
        let e = match dirty.map.as_mut() {
            Some(m) if remove_dirty => m.remove(key),
            Some(m) => m.get(key).cloned(),
            None => None,
        };
        self.miss_locked(&mut dirty);
        e
    }

    /// Count a slow-path miss and promote the dirty map once misses
    /// reach its size
    fn miss_locked(&self, dirty: &mut Dirty<K, V>) {
        dirty.misses += 1;
        let size = dirty.map.as_ref().map_or(0, HashMap::len);
        if dirty.misses < size {
            return;
        }
        let promoted = dirty.map.take().unwrap_or_default();
        self.read.store(Arc::new(ReadOnly {
            m: Arc::new(promoted),
            amended: false,
        }));
        dirty.misses = 0;
    }

    /// Build the dirty map from the snapshot if it doesn't exist yet,
    /// tombstoning empty slots instead of copying them
    fn dirty_locked(&self, dirty: &mut Dirty<K, V>, read: &ReadOnly<K, V>) {
        if dirty.map.is_some() {
            return;
        }
        let mut map = HashMap::with_capacity(read.m.len());
        for (k, e) in read.m.iter() {
            if !e.try_expunge_locked() {
                map.insert(k.clone(), Arc::clone(e));
            }
        }
        dirty.map = Some(map);
    }
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_map();
        self.range(|k, v| {
            out.entry(k, &v);
            true
        });
        out.finish()
    }
}
