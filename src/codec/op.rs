//! Op codec
//!
//! Encoding of queued operations and length-prefixed op lists.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{PersistError, Result};
use crate::op::{OpKind, PendingOp};
use crate::schema::{FieldBitSet, FieldSchema, Record};

use super::{get_prefixed, need, prefix_len, RecordCodec};

/// Encodes and decodes `PendingOp<T>`
pub struct OpCodec<T> {
    records: RecordCodec<T>,
    full: FieldBitSet,
}

impl<T: Record> OpCodec<T> {
    pub fn new(schema: Arc<FieldSchema>) -> Self {
        Self {
            full: FieldBitSet::all(Arc::clone(&schema)),
            records: RecordCodec::new(schema),
        }
    }

    pub fn records(&self) -> &RecordCodec<T> {
        &self.records
    }

    /// Encode one op
    pub fn encode(&self, op: &PendingOp<T>) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_into(op, &mut buf)?;
        Ok(buf.to_vec())
    }

    fn encode_into(&self, op: &PendingOp<T>, buf: &mut BytesMut) -> Result<()> {
        let words = op.fields.words();
        let word_count = u8::try_from(words.len())
            .map_err(|_| PersistError::Codec(format!("bitset too wide: {} words", words.len())))?;

        buf.put_u8(op.kind.as_u8());
        buf.put_u8(word_count);
        for word in words {
            buf.put_u64_le(*word);
        }

        let record = self.records.encode(&op.record, &self.full)?;
        buf.put_u32_le(prefix_len(record.len(), "record")?);
        buf.put_slice(&record);
        Ok(())
    }

    /// Decode one op. The bitset must fit the schema.
    pub fn decode(&self, bytes: &[u8]) -> Result<PendingOp<T>> {
        let mut buf = bytes;
        let (kind, words, record) = read_frame(&mut buf)?;
        if buf.has_remaining() {
            return Err(PersistError::Codec(format!(
                "{} trailing bytes after op",
                buf.remaining()
            )));
        }

        let fields = FieldBitSet::from_words(Arc::clone(self.records.schema()), &words)?;
        let (record, _) = self.records.decode(record)?;
        Ok(PendingOp::new(Arc::new(record), kind, fields))
    }

    /// Encode an op list: `[count: u32]` then each op length-prefixed
    pub fn encode_list(&self, ops: &[PendingOp<T>]) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(prefix_len(ops.len(), "op list")?);
        let mut scratch = BytesMut::new();
        for op in ops {
            scratch.clear();
            self.encode_into(op, &mut scratch)?;
            buf.put_u32_le(prefix_len(scratch.len(), "op")?);
            buf.put_slice(&scratch);
        }
        Ok(buf.to_vec())
    }

    /// Decode an op list; any malformed op fails the whole list
    pub fn decode_list(&self, bytes: &[u8]) -> Result<Vec<PendingOp<T>>> {
        let mut buf = bytes;
        need(buf, 4, "op list")?;
        let count = buf.get_u32_le() as usize;

        let mut ops = Vec::with_capacity(count.min(buf.remaining() / 4));
        for _ in 0..count {
            let raw = get_prefixed(&mut buf, "op")?;
            ops.push(self.decode(raw)?);
        }
        if buf.has_remaining() {
            return Err(PersistError::Codec(format!(
                "{} trailing bytes after op list",
                buf.remaining()
            )));
        }
        Ok(ops)
    }
}

/// Framing of one op, read without knowing the record type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOp {
    pub kind: OpKind,
    pub words: Vec<u64>,
    /// Encoded record length in bytes
    pub record_len: usize,
}

impl RawOp {
    /// Number of fields this op writes
    pub fn field_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Walk an encoded op list and report each op's framing
pub fn inspect_ops(bytes: &[u8]) -> Result<Vec<RawOp>> {
    let mut buf = bytes;
    need(buf, 4, "op list")?;
    let count = buf.get_u32_le() as usize;

    let mut ops = Vec::with_capacity(count.min(buf.remaining() / 4));
    for _ in 0..count {
        let mut frame = get_prefixed(&mut buf, "op")?;
        let (kind, words, record) = read_frame(&mut frame)?;
        if frame.has_remaining() {
            return Err(PersistError::Codec(format!(
                "{} trailing bytes after op",
                frame.remaining()
            )));
        }
        ops.push(RawOp {
            kind,
            words,
            record_len: record.len(),
        });
    }
    if buf.has_remaining() {
        return Err(PersistError::Codec(format!(
            "{} trailing bytes after op list",
            buf.remaining()
        )));
    }
    Ok(ops)
}

fn read_frame<'a>(buf: &mut &'a [u8]) -> Result<(OpKind, Vec<u64>, &'a [u8])> {
    need(buf, 2, "op header")?;
    let kind = OpKind::from_u8(buf.get_u8())?;
    let word_count = buf.get_u8() as usize;

    need(buf, word_count * 8, "op bitset")?;
    let words = (0..word_count).map(|_| buf.get_u64_le()).collect();

    let record = get_prefixed(buf, "record")?;
    Ok((kind, words, record))
}
