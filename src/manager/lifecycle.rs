//! Run, exit, load, unload and segmentation

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use crossbeam::channel::SendTimeoutError;
use tracing::{error, info, warn};

use crate::error::{PersistError, Result};
use crate::op::{OpKind, PendingOp};
use crate::schema::{FieldValue, Record};

use super::pipeline::{FlushOutcome, Message};
use super::state::StateCell;
use super::{ExitReport, LoadState, ManagerState, ManagerStats, RecordManager, RecordRef, Shared};

impl<T: Record> RecordManager<T> {
    // =========================================================================
    // Run / Exit
    // =========================================================================

    /// Start the flush worker
    ///
    /// Every start replays a bomb file left by an earlier exit, in this
    /// process or a previous one. After a panic, run restarts the worker;
    /// queued and failed ops are kept.
    pub fn run(&self) -> Result<()> {
        let s = &self.shared;
        let _lifecycle = s.lifecycle.lock();

        let prev = s.state.get();
        if prev == ManagerState::Normal {
            return Ok(());
        }

        let replayed = s.recover_bomb()?;
        if replayed > 0 {
            info!(table = %s.table(), ops = replayed, "replayed bomb file");
        }

        // Reap a worker that stopped after a panic
        if let Some(handle) = s.worker.lock().take() {
            let _ = handle.join();
        }

        s.intake_open.store(true, Ordering::Release);
        s.state.set(ManagerState::Normal);

        let worker = Arc::clone(s);
        let handle = thread::Builder::new()
            .name(format!("persist-{}", s.base_table))
            .spawn(move || worker.worker_loop());
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                s.state.set(prev);
                s.intake_open.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        *s.worker.lock() = Some(handle);

        info!(table = %s.table(), from = %prev, "manager running");
        Ok(())
    }

    /// Stop accepting mutations, flush everything and stop the worker
    ///
    /// Ops that still cannot be written after `exit_flush_retries` attempts
    /// are saved to the bomb file and replayed by the next process.
    pub fn exit(&self) -> Result<ExitReport> {
        let s = &self.shared;
        let _lifecycle = s.lifecycle.lock();

        s.intake_open.store(false, Ordering::Release);
        // Wait for mutations already admitted
        drop(s.gate.write());

        let handle = s.worker.lock().take();
        if let Some(handle) = handle {
            let mut msg = Message::Exit;
            while !handle.is_finished() {
                match s.pipeline.tx.send_timeout(msg, s.config.flush_interval) {
                    Ok(()) | Err(SendTimeoutError::Disconnected(_)) => break,
                    Err(SendTimeoutError::Timeout(back)) => msg = back,
                }
            }
            if handle.join().is_err() {
                error!(table = %s.table(), "flush worker terminated abnormally");
            }
        }

        let mut report = ExitReport::default();
        for attempt in 0..=s.config.exit_flush_retries {
            match s.drain_inline() {
                FlushOutcome::Applied(n) => report.flushed += n,
                FlushOutcome::Empty => {}
                outcome => warn!(table = %s.table(), attempt, ?outcome, "exit flush failed"),
            }
            if s.pipeline.backlog() == 0 {
                break;
            }
        }

        let remaining = s.pipeline.take_pending();
        if !remaining.is_empty() {
            match s.write_bomb(&remaining) {
                Ok(n) => {
                    report.bombed = n;
                    report.bomb_path = Some(s.bomb.path().to_path_buf());
                }
                Err(e) => {
                    // Keep the ops in memory so a later exit can try again
                    s.pipeline.push_failed(remaining);
                    s.state.set(ManagerState::Idle);
                    return Err(e);
                }
            }
            error!(
                table = %s.table(),
                ops = report.bombed,
                path = %s.bomb.path().display(),
                "unflushed ops written to bomb file"
            );
        }

        s.state.set(ManagerState::Idle);
        info!(table = %s.table(), flushed = report.flushed, bombed = report.bombed, "manager exited");
        Ok(report)
    }

    // =========================================================================
    // Load / Unload
    // =========================================================================

    /// Load every record of the table
    pub fn load_all(&self) -> Result<usize> {
        let s = &self.shared;
        s.require_running()?;
        if let Err(actual) = s.table_state.transition(LoadState::Disk, LoadState::Loading) {
            return Err(match actual {
                LoadState::Memory | LoadState::Loading => PersistError::AlreadyLoad,
                _ => PersistError::Unloading,
            });
        }

        let result = s.barrier().and_then(|()| {
            let failed = s.pipeline.fail_len();
            if failed > 0 {
                return Err(PersistError::Unflushed(failed));
            }
            let rows = s.store.load_all(&s.table())?;
            let n = rows.len();
            for row in rows {
                s.indexes.install(RecordRef::new(row))?;
            }
            Ok(n)
        });

        match result {
            Ok(n) => {
                s.table_state.set(LoadState::Memory);
                info!(table = %s.table(), records = n, "table loaded");
                Ok(n)
            }
            Err(e) => {
                s.table_state.set(LoadState::Disk);
                warn!(table = %s.table(), error = %e, "table load failed");
                Err(e)
            }
        }
    }

    /// Load one owner's records
    pub fn load(&self, owner: impl Into<FieldValue>) -> Result<usize> {
        let s = &self.shared;
        let owner = owner.into();
        let field = s.owner_field().ok_or(PersistError::NotPartitioned)?;
        s.require_running()?;
        if s.table_state.get() == LoadState::Memory {
            return Err(PersistError::AlreadyLoadAll);
        }

        let (cell, _) = s
            .owners
            .load_or_store(owner.clone(), Arc::new(StateCell::new(LoadState::Disk)));
        if let Err(actual) = cell.transition(LoadState::Disk, LoadState::Loading) {
            return Err(match actual {
                LoadState::Memory | LoadState::Loading => PersistError::AlreadyLoad,
                _ => PersistError::Unloading,
            });
        }

        let result = s.barrier().and_then(|()| {
            let failed = s.failed_for_owner(field, &owner);
            if failed > 0 {
                return Err(PersistError::Unflushed(failed));
            }
            let rows = s.store.load_owner(&s.table(), &owner)?;
            let n = rows.len();
            for row in rows {
                s.indexes.install(RecordRef::new(row))?;
            }
            Ok(n)
        });

        match result {
            Ok(n) => {
                cell.set(LoadState::Memory);
                info!(table = %s.table(), owner = %owner, records = n, "owner loaded");
                Ok(n)
            }
            Err(e) => {
                cell.set(LoadState::Disk);
                warn!(table = %s.table(), owner = %owner, error = %e, "owner load failed");
                Err(e)
            }
        }
    }

    /// Evict one owner's records after writing them back
    pub fn unload(&self, owner: impl Into<FieldValue>) -> Result<usize> {
        let s = &self.shared;
        let owner = owner.into();
        let field = s.owner_field().ok_or(PersistError::NotPartitioned)?;
        if s.pool.is_some() {
            return Err(PersistError::DeleteDisabled);
        }
        s.require_running()?;

        let cell = s.owners.load(&owner).ok_or(PersistError::AlreadyUnload)?;
        if let Err(actual) = cell.transition(LoadState::Memory, LoadState::PrepareUnloading) {
            return Err(match actual {
                LoadState::Disk => PersistError::AlreadyUnload,
                LoadState::Loading => PersistError::Loading,
                _ => PersistError::Unloading,
            });
        }

        drop(s.gate.write());
        cell.set(LoadState::Unloading);

        let victims = s.indexes.matching(field, &owner);
        let result = s.evict_and_flush(victims);

        cell.set(LoadState::Disk);

        let n = result?;
        let failed = s.failed_for_owner(field, &owner);
        if failed > 0 {
            warn!(table = %s.table(), owner = %owner, failed, "owner unloaded with unflushed ops");
            return Err(PersistError::Store(format!(
                "{} ops of owner {} are waiting for retry",
                failed, owner
            )));
        }
        info!(table = %s.table(), owner = %owner, records = n, "owner unloaded");
        Ok(n)
    }

    /// Evict every record after writing it back
    pub fn unload_all(&self) -> Result<usize> {
        let s = &self.shared;
        if s.pool.is_some() {
            return Err(PersistError::DeleteDisabled);
        }
        s.require_running()?;
        if let Err(actual) = s
            .table_state
            .transition(LoadState::Memory, LoadState::PrepareUnloading)
        {
            return Err(match actual {
                LoadState::Disk => PersistError::AlreadyUnload,
                LoadState::Loading => PersistError::Loading,
                _ => PersistError::Unloading,
            });
        }

        drop(s.gate.write());
        s.table_state.set(LoadState::Unloading);

        let victims = s.indexes.all();
        let result = s.evict_and_flush(victims);
        s.owners.clear();
        s.table_state.set(LoadState::Disk);

        let n = result?;
        let failed = s.pipeline.fail_len();
        if failed > 0 {
            return Err(PersistError::Store(format!(
                "{} ops are waiting for retry",
                failed
            )));
        }
        info!(table = %s.table(), records = n, "table unloaded");
        Ok(n)
    }

    /// Load state of one owner
    pub fn load_state(&self, owner: &FieldValue) -> LoadState {
        self.shared
            .owners
            .load(owner)
            .map(|cell| cell.get())
            .unwrap_or(LoadState::Disk)
    }

    /// Load state of the whole table
    pub fn table_state(&self) -> LoadState {
        self.shared.table_state.get()
    }

    /// Mark an owner as in memory without loading it
    ///
    /// For owners whose records are created fresh (no rows in the store yet).
    pub fn set_load_state_memory(&self, owner: impl Into<FieldValue>) -> Result<()> {
        let s = &self.shared;
        s.owner_field().ok_or(PersistError::NotPartitioned)?;
        let (cell, _) = s
            .owners
            .load_or_store(owner.into(), Arc::new(StateCell::new(LoadState::Memory)));
        cell.set(LoadState::Memory);
        Ok(())
    }

    // =========================================================================
    // Segmentation / Stats
    // =========================================================================

    /// Redirect subsequent flushes to a dated table `{base}_{YYYYMMDD}`
    ///
    /// Everything queued before the call is flushed to the current table
    /// first. In-memory records are untouched.
    pub fn segmentation(&self, at: SystemTime) -> Result<String> {
        let s = &self.shared;
        s.require_running()?;
        s.barrier()?;

        let name = segment_name(&s.base_table, at);
        s.store.create_table(&name)?;
        let prev = std::mem::replace(&mut *s.table.write(), name.clone());
        info!(from = %prev, to = %name, "table segmented");
        Ok(name)
    }

    /// Snapshot of the manager's state and counters
    pub fn stats(&self) -> ManagerStats {
        let s = &self.shared;
        let mut owners_in_memory = 0;
        s.owners.range(|_, cell| {
            if cell.get() == LoadState::Memory {
                owners_in_memory += 1;
            }
            true
        });
        ManagerStats {
            table: s.table(),
            state: s.state.get(),
            table_state: s.table_state.get(),
            records: s.indexes.len(),
            owners_in_memory,
            pipeline: s.pipeline.stats(),
        }
    }

    /// Block until every op queued so far has been flushed or failed
    pub fn sync(&self) -> Result<()> {
        self.shared.barrier()
    }
}

impl<T: Record> Shared<T> {
    fn require_running(&self) -> Result<()> {
        if self.state.get() != ManagerState::Normal {
            return Err(PersistError::Dead);
        }
        Ok(())
    }

    /// Remove records from the indices, queue their final writes and wait
    /// for the flush
    fn evict_and_flush(&self, victims: Vec<RecordRef<T>>) -> Result<usize> {
        let mut n = 0;
        for record in victims {
            if self.indexes.evict(&record)? {
                self.enqueue(PendingOp::new(
                    record.into_arc(),
                    OpKind::Unload,
                    self.full.clone(),
                ))?;
                n += 1;
            }
        }
        self.barrier()?;
        Ok(n)
    }
}

/// `{base}_{YYYYMMDD}` for the UTC date of `at`
pub(crate) fn segment_name(base: &str, at: SystemTime) -> String {
    format!("{}_{}", base, DateTime::<Utc>::from(at).format("%Y%m%d"))
}
