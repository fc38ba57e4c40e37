//! Crash recovery: bomb file replay and trace replay

use tracing::{debug, warn};

use crate::error::{PersistError, Result};
use crate::op::{OpKind, PendingOp};
use crate::schema::Record;

use super::{RecordManager, RecordRef, Shared};

impl<T: Record> RecordManager<T> {
    /// Replay ops captured from the `persistcache::trace` log
    ///
    /// Every op is decoded before any is applied; a malformed op rejects
    /// the whole set. Decoded ops are applied to the indices and queued for
    /// write-back like regular mutations.
    pub fn recover_trace<I, B>(&self, encoded: I) -> Result<usize>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let s = &self.shared;
        let ops = encoded
            .into_iter()
            .map(|bytes| s.codec.decode(bytes.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let _admitted = s.admit()?;
        let n = ops.len();
        for op in ops {
            s.replay(&op)?;
            s.enqueue(op)?;
        }
        debug!(table = %s.table(), ops = n, "trace replayed");
        Ok(n)
    }
}

impl<T: Record> Shared<T> {
    /// Replay the bomb file, if any, and delete it
    ///
    /// The file is fully validated before anything is applied. Replayed ops
    /// go to the front of the fail queue so they are written before anything
    /// queued later.
    pub(super) fn recover_bomb(&self) -> Result<usize> {
        let Some(payload) = self.bomb.read()? else {
            return Ok(0);
        };
        let ops = self
            .codec
            .decode_list(&payload)
            .map_err(|e| PersistError::InvalidBombFile(e.to_string()))?;

        for op in &ops {
            self.replay(op)?;
        }
        let n = ops.len();
        self.requeue_failed(ops);
        self.bomb.remove()?;
        Ok(n)
    }

    /// Save ops that could not be flushed, returning the number of ops now
    /// in the bomb file
    ///
    /// Ops already in an existing bomb file are kept ahead of `ops`.
    pub(super) fn write_bomb(&self, ops: &[PendingOp<T>]) -> Result<usize> {
        let mut all = match self.bomb.read()? {
            Some(payload) => self
                .codec
                .decode_list(&payload)
                .map_err(|e| PersistError::InvalidBombFile(e.to_string()))?,
            None => Vec::new(),
        };
        if !all.is_empty() {
            warn!(table = %self.table(), kept = all.len(), "appending to existing bomb file");
        }
        all.extend(ops.iter().cloned());

        let payload = self.codec.encode_list(&all)?;
        self.bomb.write(&payload)?;
        Ok(all.len())
    }

    /// Bring the indices in line with a recovered op
    fn replay(&self, op: &PendingOp<T>) -> Result<()> {
        match op.kind {
            OpKind::Insert | OpKind::Update => {
                self.indexes.install(RecordRef::from_arc(op.record.clone()))
            }
            OpKind::Delete => match self.indexes.remove(&op.key()) {
                Ok(_) | Err(PersistError::Nil) => Ok(()),
                Err(e) => Err(e),
            },
            // The record left memory when it was unloaded
            OpKind::Unload => {
                if self.indexes.get(&op.key()).is_some() {
                    warn!(table = %self.table(), key = ?op.key(), "unloaded record is cached again");
                }
                Ok(())
            }
        }
    }
}
