//! Core identifiers and key-space primitives shared by every catalog component.
//!
//! Key ranges are lexicographic over [`KeyValue`] and end-exclusive. The full
//! key space of a collection is `[MinKey, MaxKey)`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ShardingError;

/// Fully qualified collection name (`<db>.<collection>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn parse(raw: &str) -> Result<Self, ShardingError> {
        let raw = raw.trim();
        match raw.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self(raw.to_string())),
            _ => Err(ShardingError::InvalidOptions(format!(
                "invalid namespace '{raw}', expected <db>.<collection>"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn db(&self) -> &str {
        self.0.split_once('.').map(|(db, _)| db).unwrap_or(&self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a data-holding shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One shard-key value. Variant order defines the key-space order:
/// `MinKey < Int < Str < MaxKey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyValue {
    MinKey,
    Int(i64),
    Str(String),
    MaxKey,
}

impl KeyValue {
    /// Convert a JSON document field into a key value. Only integers and
    /// strings are valid shard-key values.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(KeyValue::Int),
            Value::String(s) => Some(KeyValue::Str(s.clone())),
            _ => None,
        }
    }

    pub fn is_bound_only(&self) -> bool {
        matches!(self, KeyValue::MinKey | KeyValue::MaxKey)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => f.write_str("MinKey"),
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Str(s) => write!(f, "\"{s}\""),
            KeyValue::MaxKey => f.write_str("MaxKey"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Str(value.to_string())
    }
}

/// End-exclusive chunk range `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: KeyValue,
    pub max: KeyValue,
}

impl ChunkRange {
    pub fn new(min: KeyValue, max: KeyValue) -> Result<Self, ShardingError> {
        if min >= max {
            return Err(ShardingError::InvalidOptions(format!(
                "chunk range min {min} must be less than max {max}"
            )));
        }
        Ok(Self { min, max })
    }

    /// The whole key space of a collection.
    pub fn full() -> Self {
        Self {
            min: KeyValue::MinKey,
            max: KeyValue::MaxKey,
        }
    }

    pub fn contains(&self, key: &KeyValue) -> bool {
        *key >= self.min && *key < self.max
    }

    pub fn covers(&self, other: &ChunkRange) -> bool {
        other.min >= self.min && other.max <= self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Single-field ascending shard key pattern, e.g. `{x: 1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    pub field: String,
}

impl ShardKeyPattern {
    pub fn new(field: impl Into<String>) -> Result<Self, ShardingError> {
        let field = field.into();
        if field.trim().is_empty() || field.starts_with('$') {
            return Err(ShardingError::InvalidOptions(format!(
                "invalid shard key field '{field}'"
            )));
        }
        Ok(Self { field })
    }

    /// Extract the shard-key value from a JSON document.
    pub fn extract(&self, doc: &Value) -> Result<KeyValue, ShardingError> {
        let value = doc.get(&self.field).ok_or_else(|| {
            ShardingError::InvalidOptions(format!(
                "document is missing shard key field '{}'",
                self.field
            ))
        })?;
        KeyValue::from_json(value).ok_or_else(|| {
            ShardingError::InvalidOptions(format!(
                "shard key field '{}' must be an integer or string",
                self.field
            ))
        })
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: 1}}", self.field)
    }
}

/// Logical cluster time: wall-clock seconds plus an increment that orders
/// events within the same second.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTime {
    pub secs: u64,
    pub inc: u32,
}

impl LogicalTime {
    pub const fn new(secs: u64, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Smallest time strictly greater than `self`.
    pub fn successor(self) -> Self {
        if self.inc == u32::MAX {
            Self::new(self.secs.saturating_add(1), 0)
        } else {
            Self::new(self.secs, self.inc + 1)
        }
    }

    /// Next clock reading given the current wall time.
    pub fn advance(self, now_secs: u64) -> Self {
        if now_secs > self.secs {
            Self::new(now_secs, 1)
        } else {
            self.successor()
        }
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

pub(crate) fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
