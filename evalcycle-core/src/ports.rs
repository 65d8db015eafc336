//! Outbound ports
//!
//! The scheduler talks to the host platform only through these traits. The
//! platform supplies a delayed task queue, notification delivery and group
//! membership; tests supply recording doubles.

use crate::{EvalResult, EvaluationId, GroupId, Timestamp};

/// Delayed-invocation facility.
///
/// Each registration is addressed by an opaque token. Delivery is
/// at-least-once: a token may fire on any node, more than once.
pub trait TaskQueuePort: Send + Sync {
    /// Register `token` to fire at `fire_at`, replacing any registration with
    /// the same token.
    fn schedule_at(&self, token: &str, fire_at: Timestamp) -> EvalResult<()>;

    /// Remove a registration. Removing an unknown token is not an error.
    fn cancel(&self, token: &str) -> EvalResult<()>;
}

/// Outbound messages to evaluation participants.
pub trait NotificationPort: Send + Sync {
    fn send_created(&self, evaluation_id: EvaluationId) -> EvalResult<()>;

    fn send_active(&self, evaluation_id: EvaluationId) -> EvalResult<()>;

    /// Remind one recipient group that has not responded yet.
    fn send_reminder(&self, evaluation_id: EvaluationId, group_id: &str) -> EvalResult<()>;

    fn send_viewable(&self, evaluation_id: EvaluationId) -> EvalResult<()>;
}

/// Who still owes a response.
pub trait GroupMembershipPort: Send + Sync {
    /// Groups with at least one member who has not responded, in a stable
    /// order across calls.
    fn unresponded_groups(&self, evaluation_id: EvaluationId) -> EvalResult<Vec<GroupId>>;
}
