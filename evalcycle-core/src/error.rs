//! Error types for evaluation scheduling

use crate::{EvaluationId, LifecycleState};
use thiserror::Error;

/// Entity kinds that can be missing from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Evaluation,
    ScheduledAction,
    Lock,
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: String },

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors. These are caller bugs and are rejected immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Evaluation {evaluation_id} is {state}, cannot {operation}")]
    StateConflict {
        evaluation_id: EvaluationId,
        state: LifecycleState,
        operation: String,
    },

    #[error("Evaluation has not been persisted yet")]
    Unpersisted,
}

/// Decode failures on persisted tokens. Recoverable: the entry is stale or foreign.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed {kind} token {token:?}: {reason}")]
    Malformed {
        kind: &'static str,
        token: String,
        reason: String,
    },
}

/// Cluster lock faults. Never the same thing as "lock busy".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock {lock_id} state indeterminate: {reason}")]
    Indeterminate { lock_id: String, reason: String },

    #[error("Lock {lock_id} lost by holder {holder_id} before the action finished")]
    Lost { lock_id: String, holder_id: String },
}

/// Failures reported by the task queue or notification ports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("Task queue rejected {token}: {reason}")]
    TaskQueue { token: String, reason: String },

    #[error("Notification delivery failed for evaluation {evaluation_id}: {reason}")]
    Notification {
        evaluation_id: EvaluationId,
        reason: String,
    },

    #[error("Group membership lookup failed for evaluation {evaluation_id}: {reason}")]
    GroupMembership {
        evaluation_id: EvaluationId,
        reason: String,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for the scheduling subsystem.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl EvalError {
    /// Shorthand for an invalid-argument validation error.
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EvalError::Validation(ValidationError::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// Shorthand for a storage outage.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        EvalError::Storage(StorageError::Unavailable {
            reason: reason.into(),
        })
    }

    /// Whether the task queue should simply redeliver later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EvalError::Storage(StorageError::Unavailable { .. })
                | EvalError::Storage(StorageError::LockPoisoned)
                | EvalError::Lock(_)
                | EvalError::Port(_)
        )
    }
}

/// Result type alias for scheduling operations.
pub type EvalResult<T> = Result<T, EvalError>;

// =============================================================================
// TESTS
// =============================================================================
