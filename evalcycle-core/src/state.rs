//! Lifecycle state derivation
//!
//! Pure projection from an evaluation's override flag and dates to a
//! [`LifecycleState`]. Never fails: malformed input degrades to `Unknown` so
//! display and scheduling code always get an answer.

use crate::{EvalResult, Evaluation, LifecycleState, StoredState, Timestamp, ValidationError};

/// Derive the lifecycle state of `eval` at `now`.
///
/// With `include_special_states` the Partial and Deleted overrides win over
/// the dates; without it only the dates are considered.
pub fn derive_state(eval: &Evaluation, now: Timestamp, include_special_states: bool) -> LifecycleState {
    if include_special_states {
        if eval.id.is_none() || eval.stored_state == StoredState::Partial {
            return LifecycleState::Partial;
        }
        if eval.stored_state == StoredState::Deleted {
            return LifecycleState::Deleted;
        }
    }

    let Some(start) = eval.start_date else {
        return LifecycleState::Unknown;
    };

    if start > now {
        return LifecycleState::InQueue;
    }
    match eval.due_date {
        None => return LifecycleState::Active,
        Some(due) if due > now => return LifecycleState::Active,
        Some(_) => {}
    }
    if eval.stop_date.is_some_and(|stop| stop > now) {
        return LifecycleState::GracePeriod;
    }
    match eval.view_date {
        None => LifecycleState::Viewable,
        Some(view) if view > now => LifecycleState::Closed,
        Some(_) => LifecycleState::Viewable,
    }
}

/// True when `state` comes after `reference` in the timeline.
///
/// Out-of-band states (Unknown, Deleted) are never after anything.
pub fn check_state_after(state: LifecycleState, reference: LifecycleState, include_equal: bool) -> bool {
    match (state.rank(), reference.rank()) {
        (Some(a), Some(b)) => a > b || (include_equal && a == b),
        _ => false,
    }
}

/// True when `state` comes before `reference` in the timeline.
///
/// Out-of-band states (Unknown, Deleted) are never before anything.
pub fn check_state_before(state: LifecycleState, reference: LifecycleState, include_equal: bool) -> bool {
    match (state.rank(), reference.rank()) {
        (Some(a), Some(b)) => a < b || (include_equal && a == b),
        _ => false,
    }
}

/// Refuse `operation` once `eval` has reached `limit`.
///
/// Used by edit paths, e.g. the start date cannot change once Active.
pub fn ensure_not_reached(
    eval: &Evaluation,
    now: Timestamp,
    limit: LifecycleState,
    operation: &str,
) -> EvalResult<()> {
    let state = derive_state(eval, now, true);
    if check_state_after(state, limit, true) {
        let evaluation_id = eval.id.ok_or(ValidationError::Unpersisted)?;
        return Err(ValidationError::StateConflict {
            evaluation_id,
            state,
            operation: operation.to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EvaluationId;
    use chrono::{Duration, TimeZone, Utc};

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 5, 15, 12, 0, 0).unwrap()
    }

    fn persisted(start: Duration) -> Evaluation {
        let mut eval = Evaluation::draft("state", now() + start);
        eval.id = EvaluationId::new(42);
        eval.stored_state = StoredState::Normal;
        eval
    }

    #[test]
    fn test_unsaved_is_partial() {
        let eval = Evaluation::draft("unsaved", now());
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::Partial);
        assert_eq!(derive_state(&eval, now(), false), LifecycleState::Active);
    }

    #[test]
    fn test_deleted_override() {
        let mut eval = persisted(-Duration::days(1));
        eval.stored_state = StoredState::Deleted;
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::Deleted);
        assert_eq!(derive_state(&eval, now(), false), LifecycleState::Active);
    }

    #[test]
    fn test_future_start_is_in_queue() {
        let eval = persisted(Duration::hours(1));
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::InQueue);
    }

    #[test]
    fn test_past_start_without_due_is_active() {
        let eval = persisted(-Duration::days(30));
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::Active);
    }

    #[test]
    fn test_grace_period_and_closed() {
        let mut eval = persisted(-Duration::days(3));
        eval.due_date = Some(now() - Duration::hours(1));
        eval.stop_date = Some(now() + Duration::hours(1));
        eval.view_date = Some(now() + Duration::days(1));
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::GracePeriod);

        eval.stop_date = Some(now() - Duration::minutes(1));
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::Closed);
    }

    #[test]
    fn test_all_past_without_view_is_viewable() {
        let mut eval = persisted(-Duration::days(3));
        eval.due_date = Some(now() - Duration::days(2));
        eval.stop_date = Some(now() - Duration::days(1));
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::Viewable);
    }

    #[test]
    fn test_boundaries_are_exclusive() {
        let mut eval = persisted(Duration::zero());
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::Active);
        eval.due_date = Some(now());
        eval.view_date = Some(now());
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::Viewable);
    }

    #[test]
    fn test_missing_start_is_unknown() {
        let mut eval = persisted(Duration::zero());
        eval.start_date = None;
        assert_eq!(derive_state(&eval, now(), true), LifecycleState::Unknown);
        assert_eq!(derive_state(&eval, now(), false), LifecycleState::Unknown);
    }

    #[test]
    fn test_ordering_checks() {
        use LifecycleState::*;
        assert!(check_state_after(Closed, Active, false));
        assert!(!check_state_after(Active, Active, false));
        assert!(check_state_after(Active, Active, true));
        assert!(check_state_before(InQueue, Active, false));
        assert!(check_state_before(Partial, Viewable, true));
        assert!(!check_state_after(Unknown, Partial, true));
        assert!(!check_state_before(Deleted, Viewable, true));
        assert!(!check_state_after(Viewable, Deleted, true));
    }

    #[test]
    fn test_ensure_not_reached() {
        let eval = persisted(-Duration::hours(1));
        let err = ensure_not_reached(&eval, now(), LifecycleState::Active, "change start date")
            .unwrap_err();
        assert!(err.to_string().contains("change start date"));

        let queued = persisted(Duration::hours(1));
        assert!(ensure_not_reached(&queued, now(), LifecycleState::Active, "change start date").is_ok());
    }
}
