//! Storage-level values and destination column types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single storage-level value as handed to a bulk-load transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer zero of any width.
    pub fn is_zero(&self) -> bool {
        matches!(
            self,
            Value::SmallInt(0) | Value::Int(0) | Value::BigInt(0)
        )
    }

    /// Whether the value is what an unset field holds: null, `false`, zero,
    /// the nil uuid, an empty string or byte array.
    ///
    /// A transport sends such values as-is, so a database-side DEFAULT is
    /// never applied to them.
    pub fn is_empty_like(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::SmallInt(v) => *v == 0,
            Value::Int(v) => *v == 0,
            Value::BigInt(v) => *v == 0,
            Value::Double(v) => *v == 0.0,
            Value::Text(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Uuid(u) => u.is_nil(),
            Value::Timestamp(ts) => ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0,
            Value::Json(j) => j.is_null(),
        }
    }

    /// Short type label used in logs and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::SmallInt(_) => "smallint",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Double(_) => "double",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
        }
    }

    /// Whether the value can be stored in a column of `store_type`.
    /// `Null` is compatible with every type; nullability is checked separately.
    pub fn fits(&self, store_type: &StoreType) -> bool {
        match (self, store_type) {
            (Value::Null, _) => true,
            (Value::Bool(_), StoreType::Boolean) => true,
            (Value::SmallInt(_), StoreType::SmallInt | StoreType::Integer | StoreType::BigInt) => true,
            (Value::Int(_), StoreType::Integer | StoreType::BigInt) => true,
            (Value::BigInt(_), StoreType::BigInt) => true,
            (Value::Double(_), StoreType::Double) => true,
            (Value::Text(_), StoreType::Text) => true,
            (Value::Text(s), StoreType::VarChar(max)) => {
                max.map_or(true, |m| s.chars().count() <= m as usize)
            }
            (Value::Bytes(_), StoreType::Bytes) => true,
            (Value::Uuid(_), StoreType::Uuid) => true,
            (Value::Timestamp(_), StoreType::TimestampTz) => true,
            (Value::Json(_), StoreType::Json) => true,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
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

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::SmallInt(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

/// Destination column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Double,
    Text,
    /// Bounded text; `None` means unbounded.
    VarChar(Option<u32>),
    Bytes,
    Uuid,
    TimestampTz,
    Json,
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreType::Boolean => write!(f, "boolean"),
            StoreType::SmallInt => write!(f, "smallint"),
            StoreType::Integer => write!(f, "integer"),
            StoreType::BigInt => write!(f, "bigint"),
            StoreType::Double => write!(f, "double"),
            StoreType::Text => write!(f, "text"),
            StoreType::VarChar(Some(n)) => write!(f, "varchar({})", n),
            StoreType::VarChar(None) => write!(f, "varchar"),
            StoreType::Bytes => write!(f, "bytes"),
            StoreType::Uuid => write!(f, "uuid"),
            StoreType::TimestampTz => write!(f, "timestamptz"),
            StoreType::Json => write!(f, "json"),
        }
    }
}
