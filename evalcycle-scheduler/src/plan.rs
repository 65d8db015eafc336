//! Scheduling decisions
//!
//! Pure functions deciding when each action type should fire and what a fired
//! action should do. No I/O, so every rule is unit-testable; the scheduler
//! applies the decisions against the ports.

use evalcycle_core::{
    derive_state, ActionType, Evaluation, LifecycleState, ScheduledAction, Timestamp,
};

/// Why a schedule is being computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Created,
    DatesChanged,
}

/// First `start + k * interval` (k >= 1) strictly after `now` and strictly
/// before the due date, if any.
pub fn next_reminder_at(
    eval: &Evaluation,
    now: Timestamp,
    interval: chrono::Duration,
) -> Option<Timestamp> {
    let start = eval.start_date?;
    let step_ms = interval.num_milliseconds();
    if step_ms <= 0 {
        return None;
    }
    let elapsed_ms = (now - start).num_milliseconds();
    let k = if elapsed_ms < 0 {
        1
    } else {
        elapsed_ms.div_euclid(step_ms).checked_add(1)?
    };
    let offset = chrono::Duration::try_milliseconds(k.checked_mul(step_ms)?)?;
    let at = start.checked_add_signed(offset)?;
    match eval.due_date {
        Some(due) if at >= due => None,
        _ => Some(at),
    }
}

/// Desired fire time for one action type, or `None` when nothing should be
/// pending.
///
/// `pending` is the current record for the key, if any: a past date only
/// yields a fire time when something is already pending for it or the
/// evaluation is being created, otherwise an action that already fired would
/// fire again.
pub fn desired_fire_time(
    eval: &Evaluation,
    action_type: ActionType,
    now: Timestamp,
    trigger: Trigger,
    reminder_interval: Option<chrono::Duration>,
    pending: Option<&ScheduledAction>,
) -> Option<Timestamp> {
    let state = derive_state(eval, now, true);
    if !state.is_schedulable() {
        return None;
    }
    let creating = trigger == Trigger::Created;
    let open = matches!(state, LifecycleState::InQueue | LifecycleState::Active);

    match action_type {
        // Only creation adds one; later passes keep an existing record so an
        // unqueued one gets re-registered.
        ActionType::Created => {
            if creating {
                Some(now)
            } else {
                pending.map(|p| p.fire_at)
            }
        }
        ActionType::Active => {
            let start = eval.start_date?;
            (open && (start > now || creating || pending.is_some())).then_some(start)
        }
        ActionType::Reminder => {
            if !open {
                return None;
            }
            next_reminder_at(eval, now, reminder_interval?)
        }
        ActionType::Viewable => {
            eval.due_date?;
            let view = eval.effective_view_date()?;
            (view > now || creating || pending.is_some()).then_some(view)
        }
    }
}

/// What reconciliation should do with one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPlan {
    /// Nothing pending and nothing wanted.
    Idle,
    /// Pending record already matches.
    Unchanged,
    /// Pending record is due and will be delivered; it re-derives state on fire.
    LeavePending,
    /// Pending record stayed due past the grace period, so its delivery was
    /// consumed without being performed. Register the same record again.
    Requeue,
    Cancel,
    /// Cancel any registration, then register at this time.
    Replace(Timestamp),
}

/// `redeliver_after` is how long a queued, due record may wait for its
/// delivery. A busy or early fire consumes the queue entry without performing
/// the action, so an older record is registered again.
pub fn plan_key(
    desired: Option<Timestamp>,
    pending: Option<&ScheduledAction>,
    now: Timestamp,
    redeliver_after: chrono::Duration,
) -> KeyPlan {
    match (desired, pending) {
        (None, None) => KeyPlan::Idle,
        (None, Some(_)) => KeyPlan::Cancel,
        (Some(_), Some(p)) if p.queued && delivery_overdue(p, now, redeliver_after) => {
            KeyPlan::Requeue
        }
        (Some(at), Some(p)) if p.queued && p.fire_at == at => KeyPlan::Unchanged,
        (Some(_), Some(p)) if p.queued && p.is_due(now) => KeyPlan::LeavePending,
        (Some(at), _) => KeyPlan::Replace(at),
    }
}

fn delivery_overdue(
    pending: &ScheduledAction,
    now: Timestamp,
    redeliver_after: chrono::Duration,
) -> bool {
    pending
        .fire_at
        .checked_add_signed(redeliver_after)
        .is_some_and(|deadline| deadline < now)
}

/// What a fired action should do, given the state derived at fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirePlan {
    Notify,
    FanOutReminders,
    /// The evaluation left the state this action belongs to.
    Abort,
}

pub fn plan_fire(action_type: ActionType, state: Option<LifecycleState>) -> FirePlan {
    let Some(state) = state else {
        return FirePlan::Abort;
    };
    let applies = match action_type {
        ActionType::Created => state.is_schedulable(),
        ActionType::Active | ActionType::Reminder => state == LifecycleState::Active,
        ActionType::Viewable => state == LifecycleState::Viewable,
    };
    match (applies, action_type) {
        (false, _) => FirePlan::Abort,
        (true, ActionType::Reminder) => FirePlan::FanOutReminders,
        (true, _) => FirePlan::Notify,
    }
}
