//! Codec Module
//!
//! Binary encoding of records, queued ops and op lists.
//!
//! ## Record Format
//! ```text
//! for each field in schema order:
//!   [flag: u8]            0x80 = present, 0x00 = absent
//!   [payload]             only when present
//!     bool/i8/u8          1 byte
//!     i16/u16             2 bytes LE
//!     i32/u32/f32         4 bytes LE
//!     i64/u64/f64         8 bytes LE
//!     string/bytes        [len: u32 LE][bytes]
//! ```
//!
//! ## Op Format
//! ```text
//! ┌──────────┬────────────┬──────────────────────┬───────────┬──────────────┐
//! │ op: u8   │ words: u8  │ bitset: u64 LE × n   │ len: u32  │ record       │
//! └──────────┴────────────┴──────────────────────┴───────────┴──────────────┘
//! ```
//! The bitset marks the fields the op writes; the record itself is always
//! encoded in full so replays never depend on store state.
//!
//! ## Op List Format
//! ```text
//! [count: u32 LE] then count × ([len: u32 LE][op])
//! ```

mod op;
mod record;

pub use op::{inspect_ops, OpCodec, RawOp};
pub use record::RecordCodec;

use bytes::Buf;

use crate::error::{PersistError, Result};

/// Presence flag of an encoded field
pub(crate) const FLAG_PRESENT: u8 = 0x80;

/// Absence flag of an encoded field
pub(crate) const FLAG_ABSENT: u8 = 0x00;

/// Fail with a codec error unless `n` more bytes are available
pub(crate) fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(PersistError::Codec(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Read a `u32` length prefix followed by that many bytes
pub(crate) fn get_prefixed<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    need(buf, 4, what)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len, what)?;
    let data: &'a [u8] = *buf;
    let (head, tail) = data.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Length as a `u32` prefix
pub(crate) fn prefix_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| PersistError::Codec(format!("{} too long: {} bytes", what, len)))
}
