//! Date normalization
//!
//! Repairs an evaluation's start/due/stop/view dates so that they respect the
//! minimum open window and the ordering `start <= due <= stop < view`.
//! Dates are only ever pushed later, never earlier.

use crate::{EvalError, EvalResult, Evaluation, Timestamp};
use chrono::Duration;

/// Gap placed between the close of an evaluation and a repaired view date.
pub const VIEW_DATE_EPSILON_SECS: i64 = 5;

/// Which fields a normalization pass moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub due_changed: bool,
    pub stop_changed: bool,
    pub view_changed: bool,
}

impl NormalizeReport {
    pub fn changed(&self) -> bool {
        self.due_changed || self.stop_changed || self.view_changed
    }
}

/// Normalize the dates of `eval` in place and return the resulting due date.
///
/// # Errors
/// `InvalidArgument` when `min_gap_hours` is zero or negative, or when a
/// repaired date would fall outside the representable range.
pub fn normalize_dates(eval: &mut Evaluation, min_gap_hours: i64) -> EvalResult<Option<Timestamp>> {
    normalize_dates_with_report(eval, min_gap_hours).map(|_| eval.due_date)
}

/// Same as [`normalize_dates`] but reports which fields moved.
pub fn normalize_dates_with_report(
    eval: &mut Evaluation,
    min_gap_hours: i64,
) -> EvalResult<NormalizeReport> {
    if min_gap_hours <= 0 {
        return Err(EvalError::invalid_argument(
            "min_gap_hours",
            format!("must be positive, got {}", min_gap_hours),
        ));
    }
    let min_gap = Duration::try_hours(min_gap_hours).ok_or_else(|| {
        EvalError::invalid_argument("min_gap_hours", format!("{} is out of range", min_gap_hours))
    })?;

    let mut report = NormalizeReport::default();

    // Open-ended evaluations are exempt from the minimum window.
    let (Some(start), Some(due)) = (eval.start_date, eval.due_date) else {
        return Ok(report);
    };

    // Everything is computed before the evaluation is touched, so an
    // out-of-range date leaves it unchanged.
    let due = if due - start < min_gap {
        report.due_changed = true;
        shift(start, min_gap, "due_date")?
    } else {
        due
    };

    let stop = match eval.stop_date {
        Some(stop) if stop < due => {
            report.stop_changed = true;
            Some(due)
        }
        stop => stop,
    };

    let close = stop.unwrap_or(due);
    let view = match eval.view_date {
        Some(view) if view <= close => {
            report.view_changed = true;
            Some(shift(close, Duration::seconds(VIEW_DATE_EPSILON_SECS), "view_date")?)
        }
        view => view,
    };

    eval.due_date = Some(due);
    eval.stop_date = stop;
    eval.view_date = view;
    Ok(report)
}

fn shift(from: Timestamp, by: Duration, field: &str) -> EvalResult<Timestamp> {
    from.checked_add_signed(by)
        .ok_or_else(|| EvalError::invalid_argument(field, "repaired date is out of range"))
}

/// Whole hours between two instants, truncated toward zero.
pub fn hours_between(from: Timestamp, to: Timestamp) -> i64 {
    (to - from).num_hours()
}
