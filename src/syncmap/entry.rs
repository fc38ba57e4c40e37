//! Map slots
//!
//! Each key of a `ConcurrentMap` owns one `Entry`, an atomically replaced
//! tri-state slot. Slots are shared between the read snapshot and the dirty
//! map, so a lock-free store to a published key is visible to both.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// State of one map slot
#[derive(Debug)]
pub(crate) enum Slot<V> {
    /// Deleted (or never set); still listed in the read snapshot
    Empty,
    /// Holds a live value
    Present(V),
    /// Was Empty when the dirty map was built and is not in it
    Tombstoned,
}

/// Atomic cell holding a `Slot`
pub(crate) struct Entry<V> {
    slot: ArcSwap<Slot<V>>,
}

impl<V: Clone> Entry<V> {
    pub(crate) fn new(value: V) -> Self {
        Self {
            slot: ArcSwap::from_pointee(Slot::Present(value)),
        }
    }

    /// Replace `current` with `new` if nobody changed the slot meanwhile
    fn cas(&self, current: &Arc<Slot<V>>, new: &Arc<Slot<V>>) -> bool {
        let prev = self.slot.compare_and_swap(current, Arc::clone(new));
        Arc::ptr_eq(&*prev, current)
    }

    /// Current value, if present
    pub(crate) fn load(&self) -> Option<V> {
        match &**self.slot.load() {
            Slot::Present(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Swap in `new` if the slot currently holds a value equal to `old`
    pub(crate) fn try_compare_and_swap(&self, old: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let replacement = Arc::new(Slot::Present(new));
        loop {
            let current = self.slot.load_full();
            match &*current {
                Slot::Present(v) if v == old => {}
                _ => return false,
            }
            if self.cas(&current, &replacement) {
                return true;
            }
        }
    }

    /// Clear the slot if it holds a value equal to `old`
    pub(crate) fn try_compare_and_delete(&self, old: &V) -> bool
    where
        V: PartialEq,
    {
        let empty = Arc::new(Slot::Empty);
        loop {
            let current = self.slot.load_full();
            match &*current {
                Slot::Present(v) if v == old => {}
                _ => return false,
            }
            if self.cas(&current, &empty) {
                return true;
            }
        }
    }

    /// Turn a tombstone back into an empty slot (caller holds the map lock).
    /// Returns true if the slot was tombstoned and must be re-added to the
    /// dirty map.
    pub(crate) fn unexpunge_locked(&self) -> bool {
        let current = self.slot.load_full();
        if !matches!(*current, Slot::Tombstoned) {
            return false;
        }
        self.cas(&current, &Arc::new(Slot::Empty))
    }

    /// Unconditionally store a value, returning the previous one
    pub(crate) fn swap_locked(&self, value: V) -> Option<V> {
        let prev = self.slot.swap(Arc::new(Slot::Present(value)));
        match &*prev {
            Slot::Present(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Load the value or store `value` if the slot is empty.
    ///
    /// `Ok((actual, loaded))` on success; `Err(value)` hands the value back
    /// when the slot is tombstoned and the caller must take the locked path.
    pub(crate) fn try_load_or_store(&self, value: V) -> Result<(V, bool), V> {
        let mut replacement: Option<Arc<Slot<V>>> = None;
        loop {
            let current = self.slot.load_full();
            match &*current {
                Slot::Tombstoned => return Err(value),
                Slot::Present(v) => return Ok((v.clone(), true)),
                Slot::Empty => {}
            }
            let new = replacement.get_or_insert_with(|| Arc::new(Slot::Present(value.clone())));
            if self.cas(&current, new) {
                return Ok((value, false));
            }
        }
    }

    /// Clear the slot, returning the value it held
    pub(crate) fn delete(&self) -> Option<V> {
        let empty = Arc::new(Slot::Empty);
        loop {
            let current = self.slot.load_full();
            let value = match &*current {
                Slot::Present(v) => v.clone(),
                _ => return None,
            };
            if self.cas(&current, &empty) {
                return Some(value);
            }
        }
    }

    /// Store a value unless the slot is tombstoned.
    ///
    /// `Ok(previous)` on success; `Err(value)` hands the value back when the
    /// slot is tombstoned.
    pub(crate) fn try_swap(&self, value: V) -> Result<Option<V>, V> {
        let replacement = Arc::new(Slot::Present(value));
        loop {
            let current = self.slot.load_full();
            if matches!(*current, Slot::Tombstoned) {
                return Err(take_present(replacement));
            }
            if self.cas(&current, &replacement) {
                return Ok(match &*current {
                    Slot::Present(v) => Some(v.clone()),
                    _ => None,
                });
            }
        }
    }

    /// Tombstone an empty slot (caller holds the map lock).
    /// Returns true if the slot is tombstoned afterwards.
    pub(crate) fn try_expunge_locked(&self) -> bool {
        let tombstone = Arc::new(Slot::Tombstoned);
        loop {
            let current = self.slot.load_full();
            match &*current {
                Slot::Empty => {
                    if self.cas(&current, &tombstone) {
                        return true;
                    }
                }
                Slot::Tombstoned => return true,
                Slot::Present(_) => return false,
            }
        }
    }
}

/// Recover the value from a replacement slot that was never published
fn take_present<V: Clone>(slot: Arc<Slot<V>>) -> V {
    match Arc::try_unwrap(slot) {
        Ok(Slot::Present(v)) => v,
        Ok(_) => unreachable!("replacement slots are always Present"),
        Err(shared) => match &*shared {
            Slot::Present(v) => v.clone(),
            _ => unreachable!("replacement slots are always Present"),
        },
    }
}
