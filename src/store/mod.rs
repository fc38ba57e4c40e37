//! Store Module
//!
//! The backing store a manager writes back to, and the overload hook.
//!
//! ## Responsibilities
//! - `Store`: durable destination of flushed ops; also the source of
//!   records on load
//! - `Overload`: notified when the write-back backlog or latency grows
//! - `MemoryStore`: in-process reference store with fault injection
//!
//! Batches may be retried after a failure, so implementations must accept
//! an insert of a row that already exists and a delete of one that does not.

mod memory;

use std::time::Duration;

use crate::error::Result;
use crate::op::{OpKind, PendingOp};
use crate::schema::{FieldBitSet, FieldValue, Record};

pub use memory::MemoryStore;

/// Durable destination for records of type `T`
pub trait Store<T: Record>: Send + Sync {
    /// Write a full record
    fn insert(&self, table: &str, record: &T) -> Result<()>;

    /// Write the fields of `record` marked in `fields`
    fn update(&self, table: &str, record: &T, fields: &FieldBitSet) -> Result<()>;

    /// Remove the row with this key
    fn delete(&self, table: &str, key: &T::Key) -> Result<()>;

    /// Apply a flushed batch in order. Any error fails the whole batch,
    /// which is retried later.
    fn apply_batch(&self, table: &str, ops: &[PendingOp<T>]) -> Result<()> {
        apply_each(self, table, ops)
    }

    /// Every row of the table
    fn load_all(&self, table: &str) -> Result<Vec<T>>;

    /// Every row belonging to one owner
    fn load_owner(&self, table: &str, owner: &FieldValue) -> Result<Vec<T>>;

    /// Create a table with the same layout as the current one
    fn create_table(&self, _table: &str) -> Result<()> {
        Ok(())
    }
}

/// Dispatch each op of a batch to the per-row methods of `store`
pub fn apply_each<T, S>(store: &S, table: &str, ops: &[PendingOp<T>]) -> Result<()>
where
    T: Record,
    S: Store<T> + ?Sized,
{
    for op in ops {
        match op.kind {
            OpKind::Insert => store.insert(table, &op.record)?,
            OpKind::Update => store.update(table, &op.record, &op.fields)?,
            OpKind::Delete => store.delete(table, &op.key())?,
            OpKind::Unload => {
                let full = FieldBitSet::all(op.fields.schema().clone());
                store.update(table, &op.record, &full)?
            }
        }
    }
    Ok(())
}

/// Hook invoked when write-back falls behind
pub trait Overload: Send + Sync {
    /// `backlog` is the number of ops not yet applied; `last_flush` the
    /// duration of the most recent flush
    fn overload(&self, backlog: usize, last_flush: Duration);
}

impl<F> Overload for F
where
    F: Fn(usize, Duration) + Send + Sync,
{
    fn overload(&self, backlog: usize, last_flush: Duration) {
        self(backlog, last_flush)
    }
}
