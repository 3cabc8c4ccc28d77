//! Engine-neutral guest values exchanged between the marshaler and the Lua adapter.

use serde::{Deserialize, Serialize};

/// Largest integer an f64 represents exactly.
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(String),
    Bytes(Vec<u8>),
    Buffer(TypedBuffer),
    /// Milliseconds since 1970-01-01 UTC.
    Date(f64),
    Array(Vec<ScriptValue>),
    Object(Vec<(String, ScriptValue)>),
}

impl ScriptValue {
    pub fn is_nullish(&self) -> bool {
        matches!(self, ScriptValue::Null | ScriptValue::Undefined)
    }

    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        match self {
            ScriptValue::Object(pairs) => pairs
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, ScriptValue)>) -> Self {
        ScriptValue::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn string(value: impl Into<String>) -> Self {
        ScriptValue::String(value.into())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ScriptValue::Undefined => "undefined",
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Number(_) => "number",
            ScriptValue::BigInt(_) => "bigint",
            ScriptValue::String(_) => "string",
            ScriptValue::Bytes(_) => "bytes",
            ScriptValue::Buffer(_) => "buffer",
            ScriptValue::Date(_) => "date",
            ScriptValue::Array(_) => "array",
            ScriptValue::Object(_) => "object",
        }
    }

    /// Truthiness used when a boolean is required.
    pub fn truthy(&self) -> bool {
        match self {
            ScriptValue::Undefined | ScriptValue::Null => false,
            ScriptValue::Bool(v) => *v,
            ScriptValue::Number(v) => *v != 0.0 && !v.is_nan(),
            ScriptValue::BigInt(v) => *v != 0,
            ScriptValue::String(v) => !v.is_empty(),
            ScriptValue::Bytes(v) => !v.is_empty(),
            _ => true,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BufferKind {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
}

impl BufferKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(Self::Uint8),
            "int8" => Some(Self::Int8),
            "uint16" => Some(Self::Uint16),
            "int16" => Some(Self::Int16),
            "uint32" => Some(Self::Uint32),
            "int32" => Some(Self::Int32),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
        }
    }

    pub fn width(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 => 4,
        }
    }
}

/// Fixed-width numeric buffer; `bytes` holds little-endian elements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedBuffer {
    pub kind: BufferKind,
    pub bytes: Vec<u8>,
}

impl TypedBuffer {
    pub fn zeroed(kind: BufferKind, len: usize) -> Self {
        Self {
            kind,
            bytes: vec![0; len * kind.width()],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.kind.width()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<i64> {
        let width = self.kind.width();
        let raw = self.bytes.get(idx * width..(idx + 1) * width)?;
        Some(match self.kind {
            BufferKind::Uint8 => raw[0] as i64,
            BufferKind::Int8 => raw[0] as i8 as i64,
            BufferKind::Uint16 => u16::from_le_bytes([raw[0], raw[1]]) as i64,
            BufferKind::Int16 => i16::from_le_bytes([raw[0], raw[1]]) as i64,
            BufferKind::Uint32 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
            BufferKind::Int32 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
        })
    }

    /// Stores `value` wrapped to the element width; false when `idx` is out of range.
    pub fn set(&mut self, idx: usize, value: i64) -> bool {
        let width = self.kind.width();
        let Some(slot) = self.bytes.get_mut(idx * width..(idx + 1) * width) else {
            return false;
        };
        let le = value.to_le_bytes();
        slot.copy_from_slice(&le[..width]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_buffer_wraps_to_element_width() {
        let mut buffer = TypedBuffer::zeroed(BufferKind::Int16, 2);
        assert_eq!(buffer.bytes.len(), 4);
        assert!(buffer.set(0, -2));
        assert!(buffer.set(1, 70_000));
        assert!(!buffer.set(2, 1));
        assert_eq!(buffer.get(0), Some(-2));
        assert_eq!(buffer.get(1), Some(70_000i64 as i16 as i64));
        assert_eq!(buffer.bytes[..2], [0xfe, 0xff]);
    }

    #[test]
    fn truthiness_follows_script_rules() {
        assert!(!ScriptValue::Number(0.0).truthy());
        assert!(!ScriptValue::Number(f64::NAN).truthy());
        assert!(!ScriptValue::string("").truthy());
        assert!(ScriptValue::Array(Vec::new()).truthy());
        assert!(ScriptValue::BigInt(-1).truthy());
    }
}
