//! Snapshot object pool
//!
//! Bounded free list of records reused as the backing allocation of
//! enqueue-time snapshots.

use crossbeam::queue::ArrayQueue;

/// Lock-free pool of spare `T` values
pub(crate) struct ObjectPool<T> {
    free: ArrayQueue<T>,
}

impl<T: Clone> ObjectPool<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity),
        }
    }

    /// Copy `src` into a pooled object, or clone it when the pool is empty
    pub(crate) fn acquire(&self, src: &T) -> T {
        match self.free.pop() {
            Some(mut obj) => {
                obj.clone_from(src);
                obj
            }
            None => src.clone(),
        }
    }

    /// Return an object; dropped when the pool is full
    pub(crate) fn release(&self, obj: T) {
        let _ = self.free.push(obj);
    }

    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }
}
