//! Scalar value model shared by measurement points, filters and codecs.
//!
//! Every sample slot carries a kind tag; the kind declared for a field and
//! the kind of any value injected into it must match.  The deprecated
//! `long` token maps to [`ValueKind::Int32`] with clamping on overflow.

use std::fmt;

/// Kind tag for a sample slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Bool,
    String,
    Blob,
    Guid,
    Unknown,
}

impl ValueKind {
    /// Canonical wire token for this kind, as used in schema declarations.
    pub fn token(self) -> &'static str {
        match self {
            ValueKind::Int32 => "int32",
            ValueKind::UInt32 => "uint32",
            ValueKind::Int64 => "int64",
            ValueKind::UInt64 => "uint64",
            ValueKind::Double => "double",
            ValueKind::Bool => "bool",
            ValueKind::String => "string",
            ValueKind::Blob => "blob",
            ValueKind::Guid => "guid",
            ValueKind::Unknown => "unknown",
        }
    }

    /// Parse a type token, accepting the legacy aliases.
    ///
    /// `int` and `integer` map to `int32`, `float` to `double`.  `long`
    /// also maps to `int32` (values get clamped) and is reported with a
    /// warning at the declaration site.
    pub fn from_token(token: &str) -> Option<ValueKind> {
        match token {
            "int32" => Some(ValueKind::Int32),
            "uint32" => Some(ValueKind::UInt32),
            "int64" => Some(ValueKind::Int64),
            "uint64" => Some(ValueKind::UInt64),
            "double" => Some(ValueKind::Double),
            "bool" => Some(ValueKind::Bool),
            "string" => Some(ValueKind::String),
            "blob" => Some(ValueKind::Blob),
            "guid" => Some(ValueKind::Guid),
            "int" | "integer" => Some(ValueKind::Int32),
            "float" => Some(ValueKind::Double),
            "long" => {
                tracing::warn!("type token 'long' is deprecated, mapping to int32 with clamping");
                Some(ValueKind::Int32)
            }
            _ => None,
        }
    }

    /// True for the kinds the numeric filters accept.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueKind::Int32
                | ValueKind::UInt32
                | ValueKind::Int64
                | ValueKind::UInt64
                | ValueKind::Double
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A single measurement value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Bool(bool),
    String(String),
    Blob(Vec<u8>),
    Guid(u64),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int32(_) => ValueKind::Int32,
            Value::UInt32(_) => ValueKind::UInt32,
            Value::Int64(_) => ValueKind::Int64,
            Value::UInt64(_) => ValueKind::UInt64,
            Value::Double(_) => ValueKind::Double,
            Value::Bool(_) => ValueKind::Bool,
            Value::String(_) => ValueKind::String,
            Value::Blob(_) => ValueKind::Blob,
            Value::Guid(_) => ValueKind::Guid,
        }
    }

    /// Clamp a deprecated `long` into an `Int32` value.
    pub fn from_long(v: i64) -> Value {
        if v > i64::from(i32::MAX) {
            tracing::warn!(value = v, "long value clamped to i32::MAX");
            Value::Int32(i32::MAX)
        } else if v < i64::from(i32::MIN) {
            tracing::warn!(value = v, "long value clamped to i32::MIN");
            Value::Int32(i32::MIN)
        } else {
            Value::Int32(v as i32)
        }
    }

    /// The zero/empty value of a kind, used when a field fails conversion
    /// but the row is still inserted.
    pub fn default_of(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Int32 => Value::Int32(0),
            ValueKind::UInt32 => Value::UInt32(0),
            ValueKind::Int64 => Value::Int64(0),
            ValueKind::UInt64 => Value::UInt64(0),
            ValueKind::Double => Value::Double(0.0),
            ValueKind::Bool => Value::Bool(false),
            ValueKind::String => Value::String(String::new()),
            ValueKind::Blob => Value::Blob(Vec::new()),
            ValueKind::Guid | ValueKind::Unknown => Value::Guid(0),
        }
    }

    /// Numeric payload as a double, for the aggregating filters.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int32(v) => Some(f64::from(v)),
            Value::UInt32(v) => Some(f64::from(v)),
            Value::Int64(v) => Some(v as f64),
            Value::UInt64(v) => Some(v as f64),
            Value::Double(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_tokens_round_trip() {
        for kind in [
            ValueKind::Int32,
            ValueKind::UInt32,
            ValueKind::Int64,
            ValueKind::UInt64,
            ValueKind::Double,
            ValueKind::Bool,
            ValueKind::String,
            ValueKind::Blob,
            ValueKind::Guid,
        ] {
            assert_eq!(ValueKind::from_token(kind.token()), Some(kind));
        }
    }

    #[test]
    fn legacy_tokens_map() {
        assert_eq!(ValueKind::from_token("int"), Some(ValueKind::Int32));
        assert_eq!(ValueKind::from_token("integer"), Some(ValueKind::Int32));
        assert_eq!(ValueKind::from_token("long"), Some(ValueKind::Int32));
        assert_eq!(ValueKind::from_token("float"), Some(ValueKind::Double));
        assert_eq!(ValueKind::from_token("varchar"), None);
    }

    #[test]
    fn long_values_clamp() {
        assert_eq!(Value::from_long(12), Value::Int32(12));
        assert_eq!(Value::from_long(i64::MAX), Value::Int32(i32::MAX));
        assert_eq!(Value::from_long(i64::MIN), Value::Int32(i32::MIN));
    }

    #[test]
    fn numeric_kinds() {
        assert!(ValueKind::Double.is_numeric());
        assert!(ValueKind::UInt64.is_numeric());
        assert!(!ValueKind::String.is_numeric());
        assert!(!ValueKind::Blob.is_numeric());
        assert!(!ValueKind::Bool.is_numeric());
    }
}
