//! Enum types for evaluation scheduling

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// STORED STATE
// ============================================================================

/// The only part of an evaluation's lifecycle that is persisted.
///
/// Everything else is derived from dates; these two overrides mark an
/// evaluation that is not yet (Partial) or no longer (Deleted) schedulable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StoredState {
    /// Fully configured; state follows the dates
    #[default]
    Normal,
    /// Owner has not finished configuring it
    Partial,
    /// Soft-deleted, excluded from all further scheduling
    Deleted,
}

impl StoredState {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            StoredState::Normal => "Normal",
            StoredState::Partial => "Partial",
            StoredState::Deleted => "Deleted",
        }
    }

    /// Parse from database string representation.
    ///
    /// An empty column is the historical encoding of the normal state.
    pub fn from_db_str(s: &str) -> Result<Self, StoredStateParseError> {
        match normalize_token(s).as_str() {
            "" | "normal" => Ok(StoredState::Normal),
            "partial" => Ok(StoredState::Partial),
            "deleted" => Ok(StoredState::Deleted),
            _ => Err(StoredStateParseError(s.to_string())),
        }
    }
}

impl fmt::Display for StoredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for StoredState {
    type Err = StoredStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid stored state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredStateParseError(pub String);

impl fmt::Display for StoredStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid stored state: {}", self.0)
    }
}

impl std::error::Error for StoredStateParseError {}

// ============================================================================
// LIFECYCLE STATE
// ============================================================================

/// Lifecycle state of an evaluation, derived from its dates.
///
/// The ordered states follow the timeline:
///
/// ```text
/// Partial < InQueue < Active < GracePeriod < Closed < Viewable
/// ```
///
/// `Unknown` and `Deleted` are out-of-band and never compare as before or
/// after anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Partial,
    InQueue,
    Active,
    GracePeriod,
    Closed,
    Viewable,
    Deleted,
    Unknown,
}

impl LifecycleState {
    /// The ordered states, earliest first.
    pub const ORDERED: [LifecycleState; 6] = [
        LifecycleState::Partial,
        LifecycleState::InQueue,
        LifecycleState::Active,
        LifecycleState::GracePeriod,
        LifecycleState::Closed,
        LifecycleState::Viewable,
    ];

    /// Position in the timeline, or `None` for the out-of-band states.
    pub fn rank(&self) -> Option<u8> {
        match self {
            LifecycleState::Partial => Some(0),
            LifecycleState::InQueue => Some(1),
            LifecycleState::Active => Some(2),
            LifecycleState::GracePeriod => Some(3),
            LifecycleState::Closed => Some(4),
            LifecycleState::Viewable => Some(5),
            LifecycleState::Deleted | LifecycleState::Unknown => None,
        }
    }

    /// Whether new scheduled actions may be created for an evaluation in this state.
    pub fn is_schedulable(&self) -> bool {
        self.rank().is_some_and(|rank| rank > 0)
    }

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            LifecycleState::Partial => "PARTIAL",
            LifecycleState::InQueue => "INQUEUE",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::GracePeriod => "GRACEPERIOD",
            LifecycleState::Closed => "CLOSED",
            LifecycleState::Viewable => "VIEWABLE",
            LifecycleState::Deleted => "DELETED",
            LifecycleState::Unknown => "UNKNOWN",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, LifecycleStateParseError> {
        match normalize_token(s).as_str() {
            "partial" => Ok(LifecycleState::Partial),
            "inqueue" => Ok(LifecycleState::InQueue),
            "active" => Ok(LifecycleState::Active),
            "graceperiod" => Ok(LifecycleState::GracePeriod),
            "closed" => Ok(LifecycleState::Closed),
            "viewable" => Ok(LifecycleState::Viewable),
            "deleted" => Ok(LifecycleState::Deleted),
            "unknown" => Ok(LifecycleState::Unknown),
            _ => Err(LifecycleStateParseError(s.to_string())),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for LifecycleState {
    type Err = LifecycleStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid lifecycle state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleStateParseError(pub String);

impl fmt::Display for LifecycleStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid lifecycle state: {}", self.0)
    }
}

impl std::error::Error for LifecycleStateParseError {}

// ============================================================================
// ACTION TYPE
// ============================================================================

/// Kind of scheduled action registered for an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionType {
    /// "Evaluation created" notification, fires immediately
    Created,
    /// "Now open" notification at the start date
    Active,
    /// One reminder fan-out on the configured interval
    Reminder,
    /// "Results available" notification at the effective view date
    Viewable,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [
        ActionType::Created,
        ActionType::Active,
        ActionType::Reminder,
        ActionType::Viewable,
    ];

    /// Convert to the token representation.
    ///
    /// Upper-case ASCII only, so it can never contain the action token separator.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ActionType::Created => "CREATED",
            ActionType::Active => "ACTIVE",
            ActionType::Reminder => "REMINDER",
            ActionType::Viewable => "VIEWABLE",
        }
    }

    /// Parse from the token representation. Exact match only.
    pub fn from_db_str(s: &str) -> Result<Self, ActionTypeParseError> {
        match s {
            "CREATED" => Ok(ActionType::Created),
            "ACTIVE" => Ok(ActionType::Active),
            "REMINDER" => Ok(ActionType::Reminder),
            "VIEWABLE" => Ok(ActionType::Viewable),
            _ => Err(ActionTypeParseError(s.to_string())),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for ActionType {
    type Err = ActionTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid action type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTypeParseError(pub String);

impl fmt::Display for ActionTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid action type: {}", self.0)
    }
}

impl std::error::Error for ActionTypeParseError {}

// ============================================================================
// STRING CONVERSIONS
// ============================================================================

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
