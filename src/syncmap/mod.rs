//! Concurrent Map Module
//!
//! Read-optimized concurrent maps and the index shapes built on them.
//!
//! ## Responsibilities
//! - Lock-free lookups of already published keys
//! - Amortized promotion of newly inserted keys into the read snapshot
//! - Unique (one value) and compound (set of values) index shapes
//!
//! ## Layout
//! ```text
//!            ┌──────────────── ArcSwap ────────────────┐
//!  load ───► │ ReadOnly { m: HashMap<K, Arc<Entry>>,   │  lock-free
//!            │            amended }                    │
//!            └───────────────────┬─────────────────────┘
//!                                │ miss && amended
//!                                ▼
//!            ┌──────────────── Mutex ──────────────────┐
//!            │ Dirty { map: HashMap<K, Arc<Entry>>,    │
//!            │         misses }                        │
//!            └─────────────────────────────────────────┘
//!            misses >= dirty.len()  =>  dirty becomes the new ReadOnly
//! ```
//! Both maps point at the same `Entry` slots, so writes to a published key
//! never touch the mutex.

mod entry;
mod index;
mod map;

pub use index::{CompoundIndex, ConcurrentSet, PrimaryIndex, UniqueIndex};
pub use map::ConcurrentMap;
