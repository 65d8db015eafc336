//! Constants for the evaluation scheduler
//!
//! Defaults for every tunable live here so config, tests and docs agree.

// ============================================================================
// DATE NORMALIZATION
// ============================================================================

/// Default minimum open window between start and due date, in hours
pub const DEFAULT_MIN_GAP_HOURS: i64 = 24;

/// Largest accepted minimum open window, in hours (one leap year)
pub const MAX_MIN_GAP_HOURS: i64 = 8_784;

// ============================================================================
// REMINDERS
// ============================================================================

/// Reminder interval used by `SchedulerConfig::production()`, in days
pub const PRODUCTION_REMINDER_INTERVAL_DAYS: u64 = 7;

/// Smallest accepted reminder interval, in seconds (1 hour)
pub const MIN_REMINDER_INTERVAL_SECS: u64 = 3600;

// ============================================================================
// CLUSTER LOCK
// ============================================================================

/// Default lock TTL in seconds (10 minutes).
///
/// Held locks are renewed after every reminder group, so this only has to
/// cover the slowest single step, not a whole fan-out.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 600;

/// Smallest accepted lock TTL, in seconds
pub const MIN_LOCK_TTL_SECS: u64 = 5;

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Default interval between reconciliation sweeps, in seconds (5 minutes)
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;

// ============================================================================
// ENVIRONMENT VARIABLES
// ============================================================================

pub const ENV_MIN_GAP_HOURS: &str = "EVALCYCLE_MIN_GAP_HOURS";
pub const ENV_REMINDER_INTERVAL_DAYS: &str = "EVALCYCLE_REMINDER_INTERVAL_DAYS";
pub const ENV_LOCK_TTL_SECS: &str = "EVALCYCLE_LOCK_TTL_SECS";
pub const ENV_RECONCILE_INTERVAL_SECS: &str = "EVALCYCLE_RECONCILE_INTERVAL_SECS";
pub const ENV_NODE_ID: &str = "EVALCYCLE_NODE_ID";
pub const ENV_LOG_FORMAT: &str = "EVALCYCLE_LOG_FORMAT";

// ============================================================================
// LOGGING
// ============================================================================

/// Filter applied when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "evalcycle_scheduler=info,evalcycle_storage=info,warn";
