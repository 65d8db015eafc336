//! Persisted entities

use crate::{ActionKey, EvaluationId, StoredState, Timestamp};
use serde::{Deserialize, Serialize};

/// A course evaluation moving along its timeline.
///
/// Only the fields the lifecycle engine reads are modelled here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// `None` until the evaluation is first persisted.
    pub id: Option<EvaluationId>,
    pub title: String,
    /// Always set for a persisted evaluation.
    pub start_date: Option<Timestamp>,
    /// `None` means open-ended: the evaluation stays active indefinitely.
    pub due_date: Option<Timestamp>,
    /// `None` collapses the grace period to zero length.
    pub stop_date: Option<Timestamp>,
    /// `None` means results are viewable as soon as the evaluation closes.
    pub view_date: Option<Timestamp>,
    pub instructor_view_date: Option<Timestamp>,
    pub student_view_date: Option<Timestamp>,
    #[serde(default)]
    pub stored_state: StoredState,
}

impl Evaluation {
    /// A new, not yet persisted evaluation in the Partial state.
    pub fn draft(title: impl Into<String>, start_date: Timestamp) -> Self {
        Self {
            id: None,
            title: title.into(),
            start_date: Some(start_date),
            due_date: None,
            stop_date: None,
            view_date: None,
            instructor_view_date: None,
            student_view_date: None,
            stored_state: StoredState::Partial,
        }
    }

    /// Moment the evaluation stops accepting responses, grace period included.
    ///
    /// `None` when the evaluation is open-ended.
    pub fn close_date(&self) -> Option<Timestamp> {
        self.stop_date.or(self.due_date)
    }

    /// Moment results become viewable: the view date, else the close date.
    pub fn effective_view_date(&self) -> Option<Timestamp> {
        self.view_date.or_else(|| self.close_date())
    }

    pub fn is_deleted(&self) -> bool {
        self.stored_state == StoredState::Deleted
    }
}

/// One pending invocation registered with the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub key: ActionKey,
    pub fire_at: Timestamp,
    /// False between the store write and a successful queue registration.
    /// A record left in this state needs rescheduling.
    pub queued: bool,
    /// Reminder batch token while a fan-out is in flight.
    pub progress: Option<String>,
}

impl ScheduledAction {
    /// A record about to be registered with the queue.
    pub fn pending(key: ActionKey, fire_at: Timestamp) -> Self {
        Self {
            key,
            fire_at,
            queued: false,
            progress: None,
        }
    }

    /// Whether the record is due at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.fire_at <= now
    }
}
