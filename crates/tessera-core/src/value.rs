//! Dynamic column values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A column value as bound into a mutation or read from a row.
///
/// Identifiers, versions, scalar properties and snapshots all carry
/// `Value`s, so the engine never needs to know a column's Rust type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    /// Decimal kept in its textual form.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    /// Microseconds since the Unix epoch. Timestamp versions use this.
    Timestamp(i64),
    Uuid([u8; 16]),
    Json(serde_json::Value),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view used for counter versions and sequence values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow textual content, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Compare two values as identifiers.
    ///
    /// Integer widths are normalized so that an `Int(3)` read back from one
    /// store and a `BigInt(3)` assigned by the application name the same row.
    pub fn same_identity(&self, other: &Value) -> bool {
        match (self.as_identity_int(), other.as_identity_int()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    fn as_identity_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Hash this value the way [`Value::same_identity`] compares it.
    pub fn hash_identity(&self, hasher: &mut impl Hasher) {
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            // Both integer widths share a tag.
            Value::Int(_) | Value::BigInt(_) => {
                2u8.hash(hasher);
                self.as_identity_int().hash(hasher);
            }
            Value::Double(f) => {
                3u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                4u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                5u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                6u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Timestamp(ts) => {
                7u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                8u8.hash(hasher);
                u.hash(hasher);
            }
            Value::Json(j) => {
                9u8.hash(hasher);
                j.to_string().hash(hasher);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Decimal(s) => write!(f, "{s}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(ts) => write!(f, "ts:{ts}"),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
