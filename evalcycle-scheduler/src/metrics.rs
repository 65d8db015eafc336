//! Scheduler counters
//!
//! Plain atomics with a point-in-time snapshot; the host decides how to
//! export them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for scheduling activity since startup.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Queue registrations made (including re-registrations)
    pub actions_scheduled: AtomicU64,

    /// Queue registrations cancelled
    pub actions_cancelled: AtomicU64,

    /// Overdue actions handed back to the queue after a lost delivery
    pub actions_requeued: AtomicU64,

    /// Fired actions whose side effect ran
    pub actions_performed: AtomicU64,

    /// Fired actions dropped because the evaluation left the required state
    pub actions_aborted: AtomicU64,

    /// Fires skipped because another node held the lock
    pub fires_busy: AtomicU64,

    /// Fires that found no pending, due record
    pub fires_stale: AtomicU64,

    /// Tokens that failed to decode
    pub tokens_dropped: AtomicU64,

    /// Individual reminder notifications sent
    pub reminders_sent: AtomicU64,

    /// Reconciliation sweeps completed on this node
    pub reconcile_runs: AtomicU64,

    /// Keys skipped during reconciliation because their lock was held
    pub keys_busy: AtomicU64,

    /// Errors surfaced to callers
    pub errors: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            actions_scheduled: self.actions_scheduled.load(Ordering::Relaxed),
            actions_cancelled: self.actions_cancelled.load(Ordering::Relaxed),
            actions_requeued: self.actions_requeued.load(Ordering::Relaxed),
            actions_performed: self.actions_performed.load(Ordering::Relaxed),
            actions_aborted: self.actions_aborted.load(Ordering::Relaxed),
            fires_busy: self.fires_busy.load(Ordering::Relaxed),
            fires_stale: self.fires_stale.load(Ordering::Relaxed),
            tokens_dropped: self.tokens_dropped.load(Ordering::Relaxed),
            reminders_sent: self.reminders_sent.load(Ordering::Relaxed),
            reconcile_runs: self.reconcile_runs.load(Ordering::Relaxed),
            keys_busy: self.keys_busy.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of scheduler metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub actions_scheduled: u64,
    pub actions_cancelled: u64,
    pub actions_requeued: u64,
    pub actions_performed: u64,
    pub actions_aborted: u64,
    pub fires_busy: u64,
    pub fires_stale: u64,
    pub tokens_dropped: u64,
    pub reminders_sent: u64,
    pub reconcile_runs: u64,
    pub keys_busy: u64,
    pub errors: u64,
}

impl MetricsSnapshot {
    /// JSON form for status endpoints.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = SchedulerMetrics::new();
        SchedulerMetrics::incr(&metrics.actions_scheduled);
        SchedulerMetrics::incr(&metrics.actions_scheduled);
        SchedulerMetrics::incr(&metrics.fires_busy);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.actions_scheduled, 2);
        assert_eq!(snapshot.fires_busy, 1);
        assert_eq!(snapshot.errors, 0);
    }

    #[test]
    fn test_snapshot_json() {
        let snapshot = MetricsSnapshot {
            reminders_sent: 4,
            ..MetricsSnapshot::default()
        };
        let json = snapshot.to_json();
        assert_eq!(json["reminders_sent"], 4);
        assert_eq!(json["tokens_dropped"], 0);
    }
}
