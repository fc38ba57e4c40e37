//! Field values
//!
//! A `FieldValue` is the dynamically typed form of one record field. It is
//! what the codec writes, what compound index keys are made of, and what
//! owner keys are compared with.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{PersistError, Result};

/// Storage class of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Str,
    Bytes,
}

impl FieldKind {
    /// Payload width in bytes, or `None` for length-prefixed kinds
    pub fn width(&self) -> Option<usize> {
        match self {
            FieldKind::Bool | FieldKind::I8 | FieldKind::U8 => Some(1),
            FieldKind::I16 | FieldKind::U16 => Some(2),
            FieldKind::I32 | FieldKind::U32 | FieldKind::F32 => Some(4),
            FieldKind::I64 | FieldKind::U64 | FieldKind::F64 => Some(8),
            FieldKind::Str | FieldKind::Bytes => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::I8 => "i8",
            FieldKind::U8 => "u8",
            FieldKind::I16 => "i16",
            FieldKind::U16 => "u16",
            FieldKind::I32 => "i32",
            FieldKind::U32 => "u32",
            FieldKind::I64 => "i64",
            FieldKind::U64 => "u64",
            FieldKind::F32 => "f32",
            FieldKind::F64 => "f64",
            FieldKind::Str => "string",
            FieldKind::Bytes => "bytes",
        }
    }
}

/// A single field value
///
/// Floats compare and hash by bit pattern, so every value can be used as
/// (part of) a map key.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::I8(_) => FieldKind::I8,
            FieldValue::U8(_) => FieldKind::U8,
            FieldValue::I16(_) => FieldKind::I16,
            FieldValue::U16(_) => FieldKind::U16,
            FieldValue::I32(_) => FieldKind::I32,
            FieldValue::U32(_) => FieldKind::U32,
            FieldValue::I64(_) => FieldKind::I64,
            FieldValue::U64(_) => FieldKind::U64,
            FieldValue::F32(_) => FieldKind::F32,
            FieldValue::F64(_) => FieldKind::F64,
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Bytes(_) => FieldKind::Bytes,
        }
    }

    /// Default value of a kind, used when a field is absent from a payload
    pub fn zero(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Bool => FieldValue::Bool(false),
            FieldKind::I8 => FieldValue::I8(0),
            FieldKind::U8 => FieldValue::U8(0),
            FieldKind::I16 => FieldValue::I16(0),
            FieldKind::U16 => FieldValue::U16(0),
            FieldKind::I32 => FieldValue::I32(0),
            FieldKind::U32 => FieldValue::U32(0),
            FieldKind::I64 => FieldValue::I64(0),
            FieldKind::U64 => FieldValue::U64(0),
            FieldKind::F32 => FieldValue::F32(0.0),
            FieldKind::F64 => FieldValue::F64(0.0),
            FieldKind::Str => FieldValue::Str(String::new()),
            FieldKind::Bytes => FieldValue::Bytes(Vec::new()),
        }
    }

    /// Error for a `set_field` call that received the wrong kind
    pub fn type_error(&self, field: &str, expected: FieldKind) -> PersistError {
        PersistError::FieldType {
            field: field.to_string(),
            expected: expected.name(),
            actual: self.kind().name(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any integer kind to i64 (u64 values above i64::MAX return None)
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::I8(v) => Some(v as i64),
            FieldValue::U8(v) => Some(v as i64),
            FieldValue::I16(v) => Some(v as i64),
            FieldValue::U16(v) => Some(v as i64),
            FieldValue::I32(v) => Some(v as i64),
            FieldValue::U32(v) => Some(v as i64),
            FieldValue::I64(v) => Some(v),
            FieldValue::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            (F32(a), F32(b)) => a.to_bits() == b.to_bits(),
            (F64(a), F64(b)) => a.to_bits() == b.to_bits(),
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            FieldValue::Bool(v) => v.hash(state),
            FieldValue::I8(v) => v.hash(state),
            FieldValue::U8(v) => v.hash(state),
            FieldValue::I16(v) => v.hash(state),
            FieldValue::U16(v) => v.hash(state),
            FieldValue::I32(v) => v.hash(state),
            FieldValue::U32(v) => v.hash(state),
            FieldValue::I64(v) => v.hash(state),
            FieldValue::U64(v) => v.hash(state),
            FieldValue::F32(v) => v.to_bits().hash(state),
            FieldValue::F64(v) => v.to_bits().hash(state),
            FieldValue::Str(v) => v.hash(state),
            FieldValue::Bytes(v) => v.hash(state),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::I8(v) => write!(f, "{}", v),
            FieldValue::U8(v) => write!(f, "{}", v),
            FieldValue::I16(v) => write!(f, "{}", v),
            FieldValue::U16(v) => write!(f, "{}", v),
            FieldValue::I32(v) => write!(f, "{}", v),
            FieldValue::U32(v) => write!(f, "{}", v),
            FieldValue::I64(v) => write!(f, "{}", v),
            FieldValue::U64(v) => write!(f, "{}", v),
            FieldValue::F32(v) => write!(f, "{}", v),
            FieldValue::F64(v) => write!(f, "{}", v),
            FieldValue::Str(v) => write!(f, "{:?}", v),
            FieldValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

macro_rules! field_value_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(v: $ty) -> Self {
                    FieldValue::$variant(v)
                }
            }

            impl TryFrom<FieldValue> for $ty {
                type Error = PersistError;

                fn try_from(v: FieldValue) -> Result<Self> {
                    match v {
                        FieldValue::$variant(inner) => Ok(inner),
                        other => Err(PersistError::FieldType {
                            field: String::new(),
                            expected: FieldKind::$variant.name(),
                            actual: other.kind().name(),
                        }),
                    }
                }
            }
        )*
    };
}

field_value_conversions! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => Str,
    Vec<u8> => Bytes,
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<&[u8]> for FieldValue {
    fn from(v: &[u8]) -> Self {
        FieldValue::Bytes(v.to_vec())
    }
}

/// Ordered tuple of field values keying a secondary index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompoundKey(Vec<FieldValue>);

impl CompoundKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self(values)
    }

    /// Key of a single-column index
    pub fn single(value: impl Into<FieldValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.0
    }
}

impl From<Vec<FieldValue>> for CompoundKey {
    fn from(values: Vec<FieldValue>) -> Self {
        Self(values)
    }
}

impl fmt::Display for CompoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}
