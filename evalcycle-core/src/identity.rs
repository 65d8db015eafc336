//! Identity types for evaluation scheduling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of a recipient group in a reminder fan-out.
pub type GroupId = String;

/// Persistent identity of an evaluation.
///
/// Always strictly positive; zero and negative values are rejected at parse time
/// so a decoded token can never point at an evaluation that was never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationId(i64);

impl EvaluationId {
    /// Wrap a raw id, returning `None` when it is not a valid persisted id.
    pub fn new(raw: i64) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    /// The raw database value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for EvaluationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EvaluationId {
    type Err = EvaluationIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| EvaluationIdParseError(s.to_string()))
    }
}

impl TryFrom<i64> for EvaluationId {
    type Error = EvaluationIdParseError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| EvaluationIdParseError(raw.to_string()))
    }
}

/// Error when parsing an invalid evaluation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationIdParseError(pub String);

impl fmt::Display for EvaluationIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid evaluation id: {}", self.0)
    }
}

impl std::error::Error for EvaluationIdParseError {}

/// Identity of one application node competing for cluster locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh node id (UUIDv7, timestamp-sortable).
    pub fn generate() -> Self {
        Self(format!("node-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
