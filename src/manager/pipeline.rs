//! Write-back pipeline
//!
//! One worker thread per manager drains the pending-op channel into the
//! sync queue and flushes batches to the store.
//!
//! ## Flush
//! ```text
//! batch = fail queue ++ sync queue        (older ops first)
//!       → coalesce per key (optional)
//!       → Store::apply_batch
//!           ok     → ops done, pooled snapshots recycled
//!           error  → batch becomes the fail queue, retried next flush
//!           panic  → batch becomes the fail queue, manager → Panic
//! ```

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn, Level};

use crate::error::{PersistError, Result};
use crate::op::{OpKind, PendingOp};
use crate::schema::{FieldValue, Record};

use super::state::ManagerState;
use super::Shared;

/// Message carried by the pending-op channel
pub(crate) enum Message<T: Record> {
    Op(PendingOp<T>),
    /// Acknowledged after every earlier op has been flushed or failed
    Barrier(Sender<()>),
    /// Stop the worker
    Exit,
}

/// Result of one flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    Empty,
    Applied(usize),
    Failed(usize),
    Panicked(usize),
}

impl FlushOutcome {
    pub(crate) fn is_panic(self) -> bool {
        matches!(self, FlushOutcome::Panicked(_))
    }
}

/// Counters of a pipeline, as reported by `stats()`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Ops accepted into the channel
    pub enqueued: u64,
    /// Ops applied by successful flushes (after coalescing)
    pub flushed_ops: u64,
    /// Successful flushes
    pub flushes: u64,
    /// Flushes that returned an error
    pub failed_flushes: u64,
    /// Flushes that panicked
    pub panics: u64,
    /// Messages waiting in the channel
    pub queued: usize,
    /// Ops accumulated for the next flush
    pub sync_len: usize,
    /// Ops waiting for retry
    pub fail_len: usize,
    /// Duration of the most recent flush
    pub last_flush: Duration,
}

/// What `exit()` did with the ops that were still pending
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Ops applied during shutdown
    pub flushed: usize,
    /// Ops written to the bomb file because the store kept failing
    pub bombed: usize,
    /// Bomb file path, when one was written
    pub bomb_path: Option<PathBuf>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    flushed_ops: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    panics: AtomicU64,
    last_flush_micros: AtomicU64,
}

/// Queues and channel of one manager
pub(crate) struct Pipeline<T: Record> {
    pub(super) tx: Sender<Message<T>>,
    pub(super) rx: Receiver<Message<T>>,
    /// Ops received since the last flush
    sync: Mutex<Vec<PendingOp<T>>>,
    /// Ops of failed flushes, oldest first
    fail: Mutex<Vec<PendingOp<T>>>,
    /// Serializes flushes between the worker and inline drains
    flush_lock: Mutex<()>,
    counters: Counters,
}

impl<T: Record> Pipeline<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx,
            rx,
            sync: Mutex::new(Vec::new()),
            fail: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Ops not yet applied: channel, sync queue and fail queue
    pub(crate) fn backlog(&self) -> usize {
        self.tx.len() + self.sync.lock().len() + self.fail.lock().len()
    }

    /// Ops held for retry
    pub(crate) fn fail_len(&self) -> usize {
        self.fail.lock().len()
    }

    /// Put ops at the back of the fail queue
    pub(crate) fn push_failed(&self, ops: Vec<PendingOp<T>>) {
        self.fail.lock().extend(ops);
    }

    /// Take every op still held by the queues, oldest first
    pub(crate) fn take_pending(&self) -> Vec<PendingOp<T>> {
        let mut ops = std::mem::take(&mut *self.fail.lock());
        ops.append(&mut self.sync.lock());
        ops
    }

    pub(crate) fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            flushed_ops: c.flushed_ops.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
            panics: c.panics.load(Ordering::Relaxed),
            queued: self.tx.len(),
            sync_len: self.sync.lock().len(),
            fail_len: self.fail.lock().len(),
            last_flush: self.last_flush(),
        }
    }

    fn last_flush(&self) -> Duration {
        Duration::from_micros(self.counters.last_flush_micros.load(Ordering::Relaxed))
    }
}

impl<T: Record> Shared<T> {
    // -------------------------------------------------------------------------
    // Intake
    // -------------------------------------------------------------------------

    /// Fail fast with `Overloaded` when shedding is on and the channel is full
    pub(super) fn check_capacity(&self) -> Result<()> {
        if self.config.shed_on_full && self.pipeline.tx.is_full() {
            let backlog = self.pipeline.backlog();
            self.notify_overload(backlog);
            return Err(PersistError::Overloaded { backlog });
        }
        Ok(())
    }

    /// Queue an op for write-back, blocking while the channel is full
    ///
    /// If the worker stops while the channel is full, the op goes straight
    /// to the sync queue behind everything still in the channel.
    pub(super) fn enqueue(&self, op: PendingOp<T>) -> Result<()> {
        if self.config.trace_ops {
            self.trace(&op);
        }
        let mut msg = Message::Op(op);
        loop {
            match self.pipeline.tx.send_timeout(msg, self.config.flush_interval) {
                Ok(()) => break,
                Err(SendTimeoutError::Disconnected(_)) => return Err(PersistError::Dead),
                Err(SendTimeoutError::Timeout(back)) if self.worker_alive() => msg = back,
                Err(SendTimeoutError::Timeout(back)) => {
                    if let Message::Op(op) = back {
                        self.park_behind_channel(op);
                    }
                    break;
                }
            }
        }
        self.pipeline.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Move the channel's ops into the sync queue, then append `op`
    ///
    /// Barriers found in the channel are dropped; their waiters see the
    /// disconnect and drain inline.
    fn park_behind_channel(&self, op: PendingOp<T>) {
        let mut sync = self.pipeline.sync.lock();
        while let Ok(msg) = self.pipeline.rx.try_recv() {
            if let Message::Op(queued) = msg {
                sync.push(queued);
            }
        }
        sync.push(op);
        warn!(table = %self.table(), sync_len = sync.len(), "flush worker stopped, op kept in sync queue");
    }

    fn trace(&self, op: &PendingOp<T>) {
        if !tracing::enabled!(target: "persistcache::trace", Level::DEBUG) {
            return;
        }
        match self.codec.encode(op) {
            Ok(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                debug!(
                    target: "persistcache::trace",
                    table = %self.table(),
                    op = %op.kind,
                    key = ?op.key(),
                    bytes = %hex,
                    "op enqueued"
                );
            }
            Err(e) => warn!(table = %self.table(), error = %e, "failed to encode traced op"),
        }
    }

    // -------------------------------------------------------------------------
    // Worker
    // -------------------------------------------------------------------------

    /// Body of the flush worker thread
    pub(super) fn worker_loop(&self) {
        let rx = self.pipeline.rx.clone();
        let ticker = channel::tick(self.config.flush_interval);
        info!(table = %self.table(), "flush worker started");

        loop {
            crossbeam::select! {
                recv(rx) -> msg => match msg {
                    Ok(Message::Op(op)) => {
                        let full = {
                            let mut sync = self.pipeline.sync.lock();
                            sync.push(op);
                            sync.len() >= self.config.batch_size
                        };
                        if full && self.flush().is_panic() {
                            break;
                        }
                    }
                    Ok(Message::Barrier(ack)) => {
                        let outcome = self.flush();
                        let _ = ack.send(());
                        if outcome.is_panic() {
                            break;
                        }
                    }
                    Ok(Message::Exit) | Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if self.flush().is_panic() {
                        break;
                    }
                    self.check_overload();
                }
            }
        }

        info!(table = %self.table(), state = %self.state.get(), "flush worker stopped");
    }

    /// Wait until every op queued before this call is flushed or failed
    pub(super) fn barrier(&self) -> Result<()> {
        if self.worker_alive() {
            let (ack_tx, ack_rx) = channel::bounded(1);
            let mut msg = Message::Barrier(ack_tx);
            let sent = loop {
                match self.pipeline.tx.send_timeout(msg, self.config.flush_interval) {
                    Ok(()) => break true,
                    Err(SendTimeoutError::Disconnected(_)) => return Err(PersistError::Dead),
                    Err(SendTimeoutError::Timeout(back)) if self.worker_alive() => msg = back,
                    Err(SendTimeoutError::Timeout(_)) => break false,
                }
            };
            if sent {
                loop {
                    match ack_rx.recv_timeout(self.config.flush_interval) {
                        Ok(()) => return Ok(()),
                        Err(RecvTimeoutError::Timeout) if self.worker_alive() => continue,
                        // Worker died with our barrier still queued
                        Err(_) => break,
                    }
                }
            }
        }
        self.drain_inline();
        Ok(())
    }

    /// Receive everything in the channel and flush it on this thread.
    /// Only valid while no worker is consuming the channel.
    pub(super) fn drain_inline(&self) -> FlushOutcome {
        let mut acks = Vec::new();
        {
            let mut sync = self.pipeline.sync.lock();
            while let Ok(msg) = self.pipeline.rx.try_recv() {
                match msg {
                    Message::Op(op) => sync.push(op),
                    Message::Barrier(ack) => acks.push(ack),
                    Message::Exit => {}
                }
            }
        }
        let outcome = self.flush();
        for ack in acks {
            let _ = ack.send(());
        }
        outcome
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    /// Apply the fail queue and the sync queue as one batch
    pub(super) fn flush(&self) -> FlushOutcome {
        let _flushing = self.pipeline.flush_lock.lock();

        let mut batch = std::mem::take(&mut *self.pipeline.fail.lock());
        batch.append(&mut self.pipeline.sync.lock());
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        let received = batch.len();
        if self.config.merge_ops {
            batch = coalesce(batch);
        }
        let n = batch.len();
        if n == 0 {
            debug!(table = %self.table(), received, "batch coalesced away");
            return FlushOutcome::Applied(0);
        }

        let table = self.table();
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.store.apply_batch(&table, &batch)
        }));
        let elapsed = start.elapsed();
        let counters = &self.pipeline.counters;
        counters
            .last_flush_micros
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);

        match result {
            Ok(Ok(())) => {
                counters.flushes.fetch_add(1, Ordering::Relaxed);
                counters.flushed_ops.fetch_add(n as u64, Ordering::Relaxed);
                debug!(
                    table = %table,
                    ops = n,
                    received,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "batch flushed"
                );
                self.recycle(batch);
                FlushOutcome::Applied(n)
            }
            Ok(Err(e)) => {
                counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                warn!(table = %table, ops = n, error = %e, "flush failed, batch kept for retry");
                self.requeue_failed(batch);
                FlushOutcome::Failed(n)
            }
            Err(payload) => {
                counters.panics.fetch_add(1, Ordering::Relaxed);
                let err = PersistError::FlushPanic(panic_message(payload.as_ref()));
                error!(table = %table, ops = n, error = %err, "flush panicked, stopping worker");
                self.requeue_failed(batch);
                if self.state.get() == ManagerState::Normal {
                    self.state.set(ManagerState::Panic);
                }
                FlushOutcome::Panicked(n)
            }
        }
    }

    /// Put ops at the front of the fail queue
    pub(super) fn requeue_failed(&self, batch: Vec<PendingOp<T>>) {
        let mut fail = self.pipeline.fail.lock();
        let newer = std::mem::replace(&mut *fail, batch);
        fail.extend(newer);
    }

    /// Return pooled snapshots that nothing else references
    fn recycle(&self, batch: Vec<PendingOp<T>>) {
        let Some(pool) = &self.pool else {
            return;
        };
        for op in batch {
            if let Ok(record) = Arc::try_unwrap(op.record) {
                pool.release(record);
            }
        }
    }

    /// Ops in the fail queue that belong to `owner`
    pub(super) fn failed_for_owner(&self, field: &str, owner: &FieldValue) -> usize {
        self.pipeline
            .fail
            .lock()
            .iter()
            .filter(|op| op.record.field(field).as_ref() == Some(owner))
            .count()
    }

    // -------------------------------------------------------------------------
    // Overload
    // -------------------------------------------------------------------------

    fn check_overload(&self) {
        let backlog = self.pipeline.backlog();
        let last = self.pipeline.last_flush();
        if backlog > self.config.overload_backlog || last > self.config.overload_latency {
            warn!(
                table = %self.table(),
                backlog,
                last_flush_ms = last.as_millis() as u64,
                "write-back overloaded"
            );
            self.notify_overload(backlog);
        }
    }

    fn notify_overload(&self, backlog: usize) {
        let hook = self.overload.read().clone();
        if let Some(hook) = hook {
            hook.overload(backlog, self.pipeline.last_flush());
        }
    }
}

/// Merge consecutive ops on the same key
///
/// | earlier | later  | result                          |
/// |---------|--------|---------------------------------|
/// | Insert  | Update | Insert with the later snapshot  |
/// | Update  | Update | Update with the merged bitset   |
/// | Insert  | Delete | nothing                         |
/// | Update  | Delete | Delete                          |
///
/// Every other pair is kept as is, in order.
pub(crate) fn coalesce<T: Record>(batch: Vec<PendingOp<T>>) -> Vec<PendingOp<T>> {
    let mut out: Vec<Option<PendingOp<T>>> = Vec::with_capacity(batch.len());
    let mut last: HashMap<T::Key, usize> = HashMap::new();

    for op in batch {
        let key = op.key();
        if let Some(&i) = last.get(&key) {
            if let Some(prev) = out[i].as_mut() {
                match (prev.kind, op.kind) {
                    (OpKind::Insert, OpKind::Update) => {
                        prev.record = op.record;
                        continue;
                    }
                    (OpKind::Update, OpKind::Update) => {
                        prev.fields.merge(&op.fields);
                        prev.record = op.record;
                        continue;
                    }
                    (OpKind::Insert, OpKind::Delete) => {
                        out[i] = None;
                        last.remove(&key);
                        continue;
                    }
                    (OpKind::Update, OpKind::Delete) => {
                        out[i] = Some(op);
                        continue;
                    }
                    _ => {}
                }
            }
        }
        last.insert(key, out.len());
        out.push(Some(op));
    }

    out.into_iter().flatten().collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
