//! Evalcycle Test Utilities
//!
//! Shared test infrastructure for the evalcycle workspace:
//! - Recording doubles for the task queue, notification and membership ports
//! - A manual clock and a lock store that can be made to fail
//! - Proptest generators, fixtures and custom assertions

// Re-export storage implementations from their source crate
pub use evalcycle_storage::{
    EvaluationStore, LockStore, MockStorage, PersistencePort, ScheduledActionStore, SqliteStorage,
};

// Re-export core types for convenience
pub use evalcycle_core::{
    ActionKey, ActionType, Clock, ClusterLockRecord, EntityType, EvalError, EvalResult, Evaluation,
    EvaluationId, GroupId, GroupMembershipPort, LifecycleState, LockError, NodeId,
    NotificationPort, PortError, ReminderBatchStatus, ScheduledAction, StorageError, StoredState,
    TaskQueuePort, Timestamp, TokenError, ValidationError,
};

use chrono::{Duration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// CLOCK
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<Timestamp>,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        *self.now.write().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.read().unwrap_or_else(|p| p.into_inner())
    }
}

// ============================================================================
// PORT DOUBLES
// ============================================================================

/// One call observed by [`RecordingTaskQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCall {
    Schedule { token: String, fire_at: Timestamp },
    Cancel { token: String },
}

/// In-memory task queue that records every call.
///
/// Registrations are kept by token, so re-registering replaces the old entry
/// the way a real delayed-job queue does.
#[derive(Debug, Default)]
pub struct RecordingTaskQueue {
    registrations: Mutex<HashMap<String, Timestamp>>,
    calls: Mutex<Vec<QueueCall>>,
    fail_next_schedules: AtomicUsize,
}

impl RecordingTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `schedule_at` calls fail.
    pub fn fail_next_schedules(&self, n: usize) {
        self.fail_next_schedules.store(n, Ordering::SeqCst);
    }

    pub fn registered(&self, token: &str) -> Option<Timestamp> {
        guard(&self.registrations).get(token).copied()
    }

    pub fn registered_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = guard(&self.registrations).keys().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Tokens registered to fire at or before `now`, earliest first.
    pub fn due_tokens(&self, now: Timestamp) -> Vec<String> {
        let mut due: Vec<(Timestamp, String)> = guard(&self.registrations)
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(token, at)| (*at, token.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, token)| token).collect()
    }

    /// Remove and return the due tokens, as a queue does on delivery.
    pub fn take_due(&self, now: Timestamp) -> Vec<String> {
        let due = self.due_tokens(now);
        let mut registrations = guard(&self.registrations);
        for token in &due {
            registrations.remove(token);
        }
        due
    }

    pub fn calls(&self) -> Vec<QueueCall> {
        guard(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        guard(&self.calls).clear();
    }

    pub fn schedule_count(&self) -> usize {
        guard(&self.calls)
            .iter()
            .filter(|c| matches!(c, QueueCall::Schedule { .. }))
            .count()
    }
}

impl TaskQueuePort for RecordingTaskQueue {
    fn schedule_at(&self, token: &str, fire_at: Timestamp) -> EvalResult<()> {
        let failing = self
            .fail_next_schedules
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PortError::TaskQueue {
                token: token.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        guard(&self.registrations).insert(token.to_string(), fire_at);
        guard(&self.calls).push(QueueCall::Schedule {
            token: token.to_string(),
            fire_at,
        });
        Ok(())
    }

    fn cancel(&self, token: &str) -> EvalResult<()> {
        guard(&self.registrations).remove(token);
        guard(&self.calls).push(QueueCall::Cancel {
            token: token.to_string(),
        });
        Ok(())
    }
}

/// One message observed by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Notification {
    Created(EvaluationId),
    Active(EvaluationId),
    Reminder(EvaluationId, GroupId),
    Viewable(EvaluationId),
}

/// Notification port that records every message.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail_once_for_groups: Mutex<HashSet<GroupId>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next reminder sent to `group_id`, then succeed again.
    pub fn fail_once_for_group(&self, group_id: impl Into<GroupId>) {
        guard(&self.fail_once_for_groups).insert(group_id.into());
    }

    pub fn sent(&self) -> Vec<Notification> {
        guard(&self.sent).clone()
    }

    pub fn count(&self, notification: &Notification) -> usize {
        guard(&self.sent).iter().filter(|n| *n == notification).count()
    }

    pub fn reminders_for(&self, evaluation_id: EvaluationId) -> Vec<GroupId> {
        guard(&self.sent)
            .iter()
            .filter_map(|n| match n {
                Notification::Reminder(id, group) if *id == evaluation_id => Some(group.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, notification: Notification) -> EvalResult<()> {
        guard(&self.sent).push(notification);
        Ok(())
    }
}

impl NotificationPort for RecordingNotifier {
    fn send_created(&self, evaluation_id: EvaluationId) -> EvalResult<()> {
        self.record(Notification::Created(evaluation_id))
    }

    fn send_active(&self, evaluation_id: EvaluationId) -> EvalResult<()> {
        self.record(Notification::Active(evaluation_id))
    }

    fn send_reminder(&self, evaluation_id: EvaluationId, group_id: &str) -> EvalResult<()> {
        if guard(&self.fail_once_for_groups).remove(group_id) {
            return Err(PortError::Notification {
                evaluation_id,
                reason: format!("injected failure for {}", group_id),
            }
            .into());
        }
        self.record(Notification::Reminder(evaluation_id, group_id.to_string()))
    }

    fn send_viewable(&self, evaluation_id: EvaluationId) -> EvalResult<()> {
        self.record(Notification::Viewable(evaluation_id))
    }
}

/// Membership port backed by a fixed table.
#[derive(Debug, Default)]
pub struct StaticGroups {
    groups: Mutex<HashMap<EvaluationId, Vec<GroupId>>>,
}

impl StaticGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, evaluation_id: EvaluationId, groups: &[&str]) {
        guard(&self.groups).insert(
            evaluation_id,
            groups.iter().map(|g| g.to_string()).collect(),
        );
    }
}

impl GroupMembershipPort for StaticGroups {
    fn unresponded_groups(&self, evaluation_id: EvaluationId) -> EvalResult<Vec<GroupId>> {
        Ok(guard(&self.groups)
            .get(&evaluation_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Store wrapper whose lock operations can be switched to fail.
///
/// Used to show that an unreachable lock table yields an indeterminate
/// outcome instead of a silent "busy".
#[derive(Debug)]
pub struct FlakyLockStore<S> {
    inner: S,
    failing: AtomicBool,
}

impl<S> FlakyLockStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self) -> EvalResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EvalError::unavailable("injected lock store outage"));
        }
        Ok(())
    }
}

impl<S: EvaluationStore> EvaluationStore for FlakyLockStore<S> {
    fn evaluation_insert(&self, eval: &Evaluation) -> EvalResult<EvaluationId> {
        self.inner.evaluation_insert(eval)
    }

    fn evaluation_get(&self, id: EvaluationId) -> EvalResult<Option<Evaluation>> {
        self.inner.evaluation_get(id)
    }

    fn evaluation_save(&self, eval: &Evaluation) -> EvalResult<()> {
        self.inner.evaluation_save(eval)
    }

    fn evaluation_list_schedulable(&self) -> EvalResult<Vec<EvaluationId>> {
        self.inner.evaluation_list_schedulable()
    }
}

impl<S: LockStore> LockStore for FlakyLockStore<S> {
    fn lock_try_insert(&self, record: &ClusterLockRecord, now: Timestamp) -> EvalResult<bool> {
        self.check()?;
        self.inner.lock_try_insert(record, now)
    }

    fn lock_renew(
        &self,
        lock_id: &str,
        holder_id: &NodeId,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> EvalResult<bool> {
        self.check()?;
        self.inner.lock_renew(lock_id, holder_id, now, expires_at)
    }

    fn lock_compare_and_delete(&self, lock_id: &str, holder_id: &NodeId) -> EvalResult<bool> {
        self.check()?;
        self.inner.lock_compare_and_delete(lock_id, holder_id)
    }

    fn lock_get(&self, lock_id: &str) -> EvalResult<Option<ClusterLockRecord>> {
        self.check()?;
        self.inner.lock_get(lock_id)
    }
}

impl<S: ScheduledActionStore> ScheduledActionStore for FlakyLockStore<S> {
    fn scheduled_action_get(&self, key: ActionKey) -> EvalResult<Option<ScheduledAction>> {
        self.inner.scheduled_action_get(key)
    }

    fn scheduled_action_put(&self, action: &ScheduledAction) -> EvalResult<()> {
        self.inner.scheduled_action_put(action)
    }

    fn scheduled_action_delete(&self, key: ActionKey) -> EvalResult<bool> {
        self.inner.scheduled_action_delete(key)
    }

    fn scheduled_action_list(&self, evaluation_id: EvaluationId) -> EvalResult<Vec<ScheduledAction>> {
        self.inner.scheduled_action_list(evaluation_id)
    }

    fn scheduled_action_list_all(&self) -> EvalResult<Vec<ScheduledAction>> {
        self.inner.scheduled_action_list_all()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for evalcycle types.

    use super::*;
    use proptest::prelude::*;

    /// Timestamps between 2020 and 2030, whole seconds.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or(Timestamp::UNIX_EPOCH)
        })
    }

    pub fn arb_evaluation_id() -> impl Strategy<Value = EvaluationId> {
        (1i64..i64::MAX).prop_filter_map("positive id", EvaluationId::new)
    }

    pub fn arb_action_type() -> impl Strategy<Value = ActionType> {
        prop_oneof![
            Just(ActionType::Created),
            Just(ActionType::Active),
            Just(ActionType::Reminder),
            Just(ActionType::Viewable),
        ]
    }

    pub fn arb_action_key() -> impl Strategy<Value = ActionKey> {
        (arb_evaluation_id(), arb_action_type()).prop_map(|(id, t)| ActionKey::new(id, t))
    }

    pub fn arb_group_id() -> impl Strategy<Value = GroupId> {
        "[a-z][a-z0-9:_-]{0,15}"
    }

    /// A valid reminder position: `1 <= current <= total`.
    pub fn arb_reminder_status() -> impl Strategy<Value = ReminderBatchStatus> {
        (1u32..500)
            .prop_flat_map(|total| (Just(total), 1..=total, arb_group_id()))
            .prop_filter_map("valid status", |(total, current, group)| {
                ReminderBatchStatus::new(total, current, group).ok()
            })
    }

    /// A persisted evaluation with arbitrary optional dates around a start.
    pub fn arb_evaluation() -> impl Strategy<Value = Evaluation> {
        let offset = || prop::option::of(-200_000i64..2_000_000);
        (arb_evaluation_id(), arb_timestamp(), offset(), offset(), offset()).prop_map(
            |(id, start, due, stop, view)| {
                let at = |secs: i64| start + Duration::seconds(secs);
                let mut eval = Evaluation::draft("generated", start);
                eval.id = Some(id);
                eval.stored_state = StoredState::Normal;
                eval.due_date = due.map(at);
                eval.stop_date = stop.map(at);
                eval.view_date = view.map(at);
                eval
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built evaluations for common scenarios.

    use super::*;

    /// Fixed reference instant used across scenario tests.
    pub fn base_time() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 9, 15, 8, 0, 0)
            .single()
            .unwrap_or(Timestamp::UNIX_EPOCH)
    }

    /// Unsaved evaluation with explicit dates.
    pub fn evaluation_with_dates(
        start: Timestamp,
        due: Option<Timestamp>,
        stop: Option<Timestamp>,
        view: Option<Timestamp>,
    ) -> Evaluation {
        let mut eval = Evaluation::draft("Course evaluation", start);
        eval.stored_state = StoredState::Normal;
        eval.due_date = due;
        eval.stop_date = stop;
        eval.view_date = view;
        eval
    }

    /// Starts in one day, due a week later, results a day after.
    pub fn queued_evaluation(now: Timestamp) -> Evaluation {
        evaluation_with_dates(
            now + Duration::days(1),
            Some(now + Duration::days(8)),
            None,
            Some(now + Duration::days(9)),
        )
    }

    /// Started yesterday, due in two weeks.
    pub fn active_evaluation(now: Timestamp) -> Evaluation {
        evaluation_with_dates(
            now - Duration::days(1),
            Some(now + Duration::days(14)),
            None,
            None,
        )
    }

    /// Started yesterday with no due date.
    pub fn open_ended_evaluation(now: Timestamp) -> Evaluation {
        evaluation_with_dates(now - Duration::days(1), None, None, None)
    }

    /// Every date already in the past, no explicit view date.
    pub fn finished_evaluation(now: Timestamp) -> Evaluation {
        evaluation_with_dates(
            now - Duration::days(10),
            Some(now - Duration::days(3)),
            Some(now - Duration::days(2)),
            None,
        )
    }

    pub fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for evalcycle errors.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &EvalResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &EvalResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that an EvalResult is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &EvalResult<T>) {
        match result {
            Err(EvalError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert that an EvalResult is a NotFound storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &EvalResult<T>, entity_type: EntityType) {
        match result {
            Err(EvalError::Storage(StorageError::NotFound { entity_type: et, .. })) => {
                assert_eq!(*et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", entity_type, other),
        }
    }

    /// Assert that an EvalResult is an indeterminate lock error.
    #[track_caller]
    pub fn assert_lock_indeterminate<T: std::fmt::Debug>(result: &EvalResult<T>) {
        match result {
            Err(EvalError::Lock(LockError::Indeterminate { .. })) => {}
            other => panic!("Expected Indeterminate lock error, got: {:?}", other),
        }
    }

    /// Assert that a decode produced a malformed-token error.
    #[track_caller]
    pub fn assert_malformed<T: std::fmt::Debug>(result: &Result<T, TokenError>) {
        match result {
            Err(TokenError::Malformed { .. }) => {}
            other => panic!("Expected Malformed token error, got: {:?}", other),
        }
    }

    /// Assert that every date an evaluation carries respects
    /// `start <= due <= stop < view`.
    #[track_caller]
    pub fn assert_dates_ordered(eval: &Evaluation) {
        if let (Some(start), Some(due)) = (eval.start_date, eval.due_date) {
            assert!(start <= due, "start {} after due {}", start, due);
        }
        if let (Some(due), Some(stop)) = (eval.due_date, eval.stop_date) {
            assert!(due <= stop, "due {} after stop {}", due, stop);
        }
        if let (Some(close), Some(view)) = (eval.close_date(), eval.view_date) {
            assert!(close < view, "view {} not after close {}", view, close);
        }
    }
}
