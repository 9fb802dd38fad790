//! Metadata key/value model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant tag for GGUF metadata values.
///
/// Numeric values match those in the GGUF specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum ValueType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

impl ValueType {
    /// Convert from the raw u32 discriminant in the file.
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::U8),
            1 => Some(Self::I8),
            2 => Some(Self::U16),
            3 => Some(Self::I16),
            4 => Some(Self::U32),
            5 => Some(Self::I32),
            6 => Some(Self::F32),
            7 => Some(Self::Bool),
            8 => Some(Self::String),
            9 => Some(Self::Array),
            10 => Some(Self::U64),
            11 => Some(Self::I64),
            12 => Some(Self::F64),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Short lowercase name used in staged documents.
    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Array => "array",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F64 => "f64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "u8" => Self::U8,
            "i8" => Self::I8,
            "u16" => Self::U16,
            "i16" => Self::I16,
            "u32" => Self::U32,
            "i32" => Self::I32,
            "f32" => Self::F32,
            "bool" => Self::Bool,
            "string" => Self::String,
            "array" => Self::Array,
            "u64" => Self::U64,
            "i64" => Self::I64,
            "f64" => Self::F64,
            _ => return None,
        })
    }

    /// Encoded size of a fixed-width scalar, `None` for strings and arrays.
    pub const fn scalar_size(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::String | Self::Array => None,
        }
    }

    /// Smallest number of bytes a value of this type can occupy on disk.
    pub(crate) const fn min_encoded_size(self) -> usize {
        match self.scalar_size() {
            Some(n) => n,
            // string: u64 length; array: u32 element type + u64 count
            None => match self {
                Self::String => 8,
                _ => 12,
            },
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::U8 | Self::I8 | Self::U16 | Self::I16 | Self::U32 | Self::I32 | Self::U64 | Self::I64
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed GGUF metadata value.
///
/// Arrays carry their element tag so that empty arrays keep their type
/// across a round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(ValueType, Vec<MetadataValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::U8(_) => ValueType::U8,
            Self::I8(_) => ValueType::I8,
            Self::U16(_) => ValueType::U16,
            Self::I16(_) => ValueType::I16,
            Self::U32(_) => ValueType::U32,
            Self::I32(_) => ValueType::I32,
            Self::F32(_) => ValueType::F32,
            Self::Bool(_) => ValueType::Bool,
            Self::String(_) => ValueType::String,
            Self::Array(..) => ValueType::Array,
            Self::U64(_) => ValueType::U64,
            Self::I64(_) => ValueType::I64,
            Self::F64(_) => ValueType::F64,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of any integer-typed scalar; negative values yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::U64(v) => Some(v),
            Self::I8(v) => u64::try_from(v).ok(),
            Self::I16(v) => u64::try_from(v).ok(),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<(ValueType, &[MetadataValue])> {
        match self {
            Self::Array(ty, items) => Some((*ty, items)),
            _ => None,
        }
    }

    /// String items of a string array.
    pub fn as_string_array(&self) -> Option<Vec<&str>> {
        match self {
            Self::Array(ValueType::String, items) => items.iter().map(Self::as_str).collect(),
            _ => None,
        }
    }

    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array(ValueType::String, items.into_iter().map(|s| Self::String(s.into())).collect())
    }

    /// Build an integer of type `ty` from `v`, `None` if it does not fit.
    pub fn integer_of(ty: ValueType, v: u64) -> Option<Self> {
        Some(match ty {
            ValueType::U8 => Self::U8(u8::try_from(v).ok()?),
            ValueType::I8 => Self::I8(i8::try_from(v).ok()?),
            ValueType::U16 => Self::U16(u16::try_from(v).ok()?),
            ValueType::I16 => Self::I16(i16::try_from(v).ok()?),
            ValueType::U32 => Self::U32(u32::try_from(v).ok()?),
            ValueType::I32 => Self::I32(i32::try_from(v).ok()?),
            ValueType::U64 => Self::U64(v),
            ValueType::I64 => Self::I64(i64::try_from(v).ok()?),
            _ => return None,
        })
    }

    /// `true` if every array (recursively) holds only items of its declared element type.
    pub fn is_homogeneous(&self) -> bool {
        match self {
            Self::Array(ty, items) => {
                items.iter().all(|item| item.value_type() == *ty && item.is_homogeneous())
            }
            _ => true,
        }
    }
}

/// A single key-value metadata entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: MetadataValue,
}

impl MetadataEntry {
    pub fn new(key: impl Into<String>, value: MetadataValue) -> Self {
        Self { key: key.into(), value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_tags_roundtrip() {
        for n in 0u32..=12 {
            let ty = ValueType::from_u32(n).expect("known tag");
            assert_eq!(ty.as_u32(), n);
            assert_eq!(ValueType::from_name(ty.name()), Some(ty));
        }
        assert!(ValueType::from_u32(13).is_none());
        assert!(ValueType::from_name("float").is_none());
    }

    #[test]
    fn as_u64_rejects_negative() {
        assert_eq!(MetadataValue::I32(7).as_u64(), Some(7));
        assert_eq!(MetadataValue::I32(-1).as_u64(), None);
        assert_eq!(MetadataValue::F32(1.0).as_u64(), None);
    }

    #[test]
    fn integer_of_respects_width() {
        assert_eq!(MetadataValue::integer_of(ValueType::U8, 255), Some(MetadataValue::U8(255)));
        assert_eq!(MetadataValue::integer_of(ValueType::U8, 256), None);
        assert_eq!(MetadataValue::integer_of(ValueType::String, 1), None);
    }

    #[test]
    fn homogeneity_is_recursive() {
        let ok = MetadataValue::Array(
            ValueType::Array,
            vec![MetadataValue::Array(ValueType::U8, vec![MetadataValue::U8(1)])],
        );
        assert!(ok.is_homogeneous());

        let bad = MetadataValue::Array(
            ValueType::Array,
            vec![MetadataValue::Array(ValueType::U8, vec![MetadataValue::I8(1)])],
        );
        assert!(!bad.is_homogeneous());
    }
}
