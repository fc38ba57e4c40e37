//! Record codec
//!
//! Bitset-driven partial encoding of one record.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{PersistError, Result};
use crate::schema::{FieldBitSet, FieldKind, FieldSchema, FieldValue, Record};

use super::{get_prefixed, need, prefix_len, FLAG_ABSENT, FLAG_PRESENT};

/// Encodes and decodes records of type `T`
pub struct RecordCodec<T> {
    schema: Arc<FieldSchema>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RecordCodec<T> {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            _marker: PhantomData,
        }
    }
}

impl<T: Record> RecordCodec<T> {
    pub fn new(schema: Arc<FieldSchema>) -> Self {
        Self {
            schema,
            _marker: PhantomData,
        }
    }

    pub fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    /// Encode the fields marked in `fields`
    pub fn encode(&self, record: &T, fields: &FieldBitSet) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.schema.field_count() * 5);
        self.encode_into(record, fields, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Encode into an existing buffer
    pub fn encode_into(&self, record: &T, fields: &FieldBitSet, buf: &mut BytesMut) -> Result<()> {
        for idx in 0..self.schema.field_count() {
            if !fields.get_index(idx) {
                buf.put_u8(FLAG_ABSENT);
                continue;
            }

            let name = self.schema.name(idx);
            let kind = self.schema.kind(idx);
            let value = record
                .field(name)
                .ok_or_else(|| PersistError::UnknownField(name.to_string()))?;
            if value.kind() != kind {
                return Err(value.type_error(name, kind));
            }

            buf.put_u8(FLAG_PRESENT);
            put_value(buf, &value, name)?;
        }
        Ok(())
    }

    /// Decode a record, returning it with the bitset of fields present.
    /// Absent fields keep their `Default` value.
    pub fn decode(&self, bytes: &[u8]) -> Result<(T, FieldBitSet)> {
        let mut buf = bytes;
        let mut record = T::default();
        let mut present = FieldBitSet::new(Arc::clone(&self.schema));

        for idx in 0..self.schema.field_count() {
            let name = self.schema.name(idx);
            need(buf, 1, name)?;
            match buf.get_u8() {
                FLAG_ABSENT => {}
                FLAG_PRESENT => {
                    let value = get_value(&mut buf, self.schema.kind(idx), name)?;
                    record.set_field(name, value)?;
                    present.set_index(idx);
                }
                flag => {
                    return Err(PersistError::Codec(format!(
                        "field {:?}: invalid presence flag {:#04x}",
                        name, flag
                    )))
                }
            }
        }

        if buf.has_remaining() {
            return Err(PersistError::Codec(format!(
                "{} trailing bytes after record",
                buf.remaining()
            )));
        }
        Ok((record, present))
    }
}

fn put_value(buf: &mut BytesMut, value: &FieldValue, name: &str) -> Result<()> {
    match value {
        FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
        FieldValue::I8(v) => buf.put_i8(*v),
        FieldValue::U8(v) => buf.put_u8(*v),
        FieldValue::I16(v) => buf.put_i16_le(*v),
        FieldValue::U16(v) => buf.put_u16_le(*v),
        FieldValue::I32(v) => buf.put_i32_le(*v),
        FieldValue::U32(v) => buf.put_u32_le(*v),
        FieldValue::I64(v) => buf.put_i64_le(*v),
        FieldValue::U64(v) => buf.put_u64_le(*v),
        FieldValue::F32(v) => buf.put_f32_le(*v),
        FieldValue::F64(v) => buf.put_f64_le(*v),
        FieldValue::Str(v) => {
            buf.put_u32_le(prefix_len(v.len(), name)?);
            buf.put_slice(v.as_bytes());
        }
        FieldValue::Bytes(v) => {
            buf.put_u32_le(prefix_len(v.len(), name)?);
            buf.put_slice(v);
        }
    }
    Ok(())
}

fn get_value(buf: &mut &[u8], kind: FieldKind, name: &str) -> Result<FieldValue> {
    if let Some(width) = kind.width() {
        need(buf, width, name)?;
    }
    let value = match kind {
        FieldKind::Bool => match buf.get_u8() {
            0 => FieldValue::Bool(false),
            1 => FieldValue::Bool(true),
            other => {
                return Err(PersistError::Codec(format!(
                    "field {:?}: invalid bool byte {}",
                    name, other
                )))
            }
        },
        FieldKind::I8 => FieldValue::I8(buf.get_i8()),
        FieldKind::U8 => FieldValue::U8(buf.get_u8()),
        FieldKind::I16 => FieldValue::I16(buf.get_i16_le()),
        FieldKind::U16 => FieldValue::U16(buf.get_u16_le()),
        FieldKind::I32 => FieldValue::I32(buf.get_i32_le()),
        FieldKind::U32 => FieldValue::U32(buf.get_u32_le()),
        FieldKind::I64 => FieldValue::I64(buf.get_i64_le()),
        FieldKind::U64 => FieldValue::U64(buf.get_u64_le()),
        FieldKind::F32 => FieldValue::F32(buf.get_f32_le()),
        FieldKind::F64 => FieldValue::F64(buf.get_f64_le()),
        FieldKind::Str => {
            let raw = get_prefixed(buf, name)?;
            let s = std::str::from_utf8(raw).map_err(|e| {
                PersistError::Codec(format!("field {:?}: invalid utf-8: {}", name, e))
            })?;
            FieldValue::Str(s.to_string())
        }
        FieldKind::Bytes => FieldValue::Bytes(get_prefixed(buf, name)?.to_vec()),
    };
    Ok(value)
}
