//! Manager and load state machines

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a manager's flush worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    /// Never started, or exited
    Idle = 0,
    /// Worker running, mutations accepted
    Normal = 1,
    /// Worker stopped after a panic inside a flush; `run()` restarts it
    Panic = 2,
}

/// Load state of the whole table or of one owner's records
///
/// ```text
/// Disk ──► Loading ──► Memory ──► PrepareUnloading ──► Unloading ──► Disk
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState {
    Disk = 0,
    Loading = 1,
    Memory = 2,
    /// Waiting for in-flight mutations before eviction
    PrepareUnloading = 3,
    Unloading = 4,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Idle => "idle",
            ManagerState::Normal => "normal",
            ManagerState::Panic => "panic",
        };
        f.write_str(name)
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadState::Disk => "disk",
            LoadState::Loading => "loading",
            LoadState::Memory => "memory",
            LoadState::PrepareUnloading => "prepare_unloading",
            LoadState::Unloading => "unloading",
        };
        f.write_str(name)
    }
}

/// State enums storable in a `StateCell`
pub(crate) trait AtomicState: Copy + Eq {
    fn to_u8(self) -> u8;
    fn from_u8(v: u8) -> Self;
}

impl AtomicState for ManagerState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ManagerState::Normal,
            2 => ManagerState::Panic,
            _ => ManagerState::Idle,
        }
    }
}

impl AtomicState for LoadState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => LoadState::Loading,
            2 => LoadState::Memory,
            3 => LoadState::PrepareUnloading,
            4 => LoadState::Unloading,
            _ => LoadState::Disk,
        }
    }
}

/// Atomic cell holding a state enum
pub(crate) struct StateCell<S> {
    value: AtomicU8,
    _marker: PhantomData<S>,
}

impl<S: AtomicState> StateCell<S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            value: AtomicU8::new(state.to_u8()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn get(&self) -> S {
        S::from_u8(self.value.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: S) {
        self.value.store(state.to_u8(), Ordering::Release);
    }

    /// Move from `from` to `to`; on failure returns the actual state
    pub(crate) fn transition(&self, from: S, to: S) -> Result<(), S> {
        self.value
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(S::from_u8)
    }
}
