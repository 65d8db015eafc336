//! Scheduler configuration

use crate::constants::{
    DEFAULT_LOCK_TTL_SECS, DEFAULT_MIN_GAP_HOURS, DEFAULT_RECONCILE_INTERVAL_SECS,
    ENV_LOCK_TTL_SECS, ENV_MIN_GAP_HOURS, ENV_NODE_ID, ENV_RECONCILE_INTERVAL_SECS,
    ENV_REMINDER_INTERVAL_DAYS, MAX_MIN_GAP_HOURS, MIN_LOCK_TTL_SECS, MIN_REMINDER_INTERVAL_SECS,
    PRODUCTION_REMINDER_INTERVAL_DAYS,
};
use evalcycle_core::{ConfigError, NodeId};
use std::time::Duration;

const SECS_PER_DAY: u64 = 86_400;

/// Configuration for one scheduler node.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum hours between start and due date (default: 24)
    pub min_gap_hours: i64,

    /// Spacing of reminder runs from the start date. `None` disables reminders.
    pub reminder_interval: Option<Duration>,

    /// TTL of every cluster lock this node takes (default: 10 minutes)
    pub lock_ttl: Duration,

    /// How often the background sweep reconciles every evaluation (default: 5 minutes)
    pub reconcile_interval: Duration,

    /// Identity used as lock holder. Must differ between nodes.
    pub node_id: NodeId,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_gap_hours: DEFAULT_MIN_GAP_HOURS,
            reminder_interval: None,
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            node_id: NodeId::generate(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl SchedulerConfig {
    /// Create SchedulerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `EVALCYCLE_MIN_GAP_HOURS`: Minimum open window (default: 24)
    /// - `EVALCYCLE_REMINDER_INTERVAL_DAYS`: Reminder spacing, `0` disables (default: disabled)
    /// - `EVALCYCLE_LOCK_TTL_SECS`: Cluster lock TTL (default: 600)
    /// - `EVALCYCLE_RECONCILE_INTERVAL_SECS`: Sweep interval (default: 300)
    /// - `EVALCYCLE_NODE_ID`: Lock holder identity (default: generated)
    ///
    /// Unparseable values fall back to the default; call [`validate`](Self::validate)
    /// to reject out-of-range ones.
    pub fn from_env() -> Self {
        let min_gap_hours = env_parse(ENV_MIN_GAP_HOURS).unwrap_or(DEFAULT_MIN_GAP_HOURS);

        let reminder_interval = env_parse::<u64>(ENV_REMINDER_INTERVAL_DAYS)
            .filter(|days| *days > 0)
            .map(|days| Duration::from_secs(days.saturating_mul(SECS_PER_DAY)));

        let lock_ttl = Duration::from_secs(
            env_parse(ENV_LOCK_TTL_SECS).unwrap_or(DEFAULT_LOCK_TTL_SECS),
        );

        let reconcile_interval = Duration::from_secs(
            env_parse(ENV_RECONCILE_INTERVAL_SECS).unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS),
        );

        let node_id = std::env::var(ENV_NODE_ID)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(NodeId::new)
            .unwrap_or_else(NodeId::generate);

        Self {
            min_gap_hours,
            reminder_interval,
            lock_ttl,
            reconcile_interval,
            node_id,
        }
    }

    /// Short intervals for local runs and tests.
    pub fn development() -> Self {
        Self {
            min_gap_hours: 1,
            reminder_interval: Some(Duration::from_secs(SECS_PER_DAY)),
            lock_ttl: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(10),
            node_id: NodeId::generate(),
        }
    }

    /// Weekly reminders and the default lock and sweep timings.
    pub fn production() -> Self {
        Self {
            reminder_interval: Some(Duration::from_secs(
                PRODUCTION_REMINDER_INTERVAL_DAYS * SECS_PER_DAY,
            )),
            ..Self::default()
        }
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_reminder_interval(mut self, interval: Option<Duration>) -> Self {
        self.reminder_interval = interval;
        self
    }

    /// Reject configurations that would break scheduling invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_gap_hours <= 0 {
            return Err(invalid(
                "min_gap_hours",
                self.min_gap_hours,
                "must be positive",
            ));
        }
        if self.min_gap_hours > MAX_MIN_GAP_HOURS {
            return Err(invalid(
                "min_gap_hours",
                self.min_gap_hours,
                format!("must be at most {}", MAX_MIN_GAP_HOURS),
            ));
        }
        if self.lock_ttl < Duration::from_secs(MIN_LOCK_TTL_SECS) {
            return Err(invalid(
                "lock_ttl",
                format!("{:?}", self.lock_ttl),
                format!("must be at least {}s", MIN_LOCK_TTL_SECS),
            ));
        }
        if let Some(interval) = self.reminder_interval {
            if interval < Duration::from_secs(MIN_REMINDER_INTERVAL_SECS) {
                return Err(invalid(
                    "reminder_interval",
                    format!("{:?}", interval),
                    format!("must be at least {}s", MIN_REMINDER_INTERVAL_SECS),
                ));
            }
        }
        if self.reconcile_interval.is_zero() {
            return Err(invalid("reconcile_interval", "0s", "must be positive"));
        }
        if self.node_id.as_str().is_empty() {
            return Err(invalid("node_id", "", "must not be empty"));
        }
        Ok(())
    }

    /// Reminder interval as a calendar duration, if reminders are enabled.
    pub(crate) fn reminder_step(&self) -> Option<chrono::Duration> {
        self.reminder_interval
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .filter(|d| *d > chrono::Duration::zero())
    }

    /// How long a queued action may stay overdue before reconciliation
    /// assumes its delivery was lost and registers it again.
    pub(crate) fn redelivery_grace(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lock_ttl).unwrap_or(chrono::Duration::MAX)
    }
}

fn invalid(field: &str, value: impl ToString, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}
