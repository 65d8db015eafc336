//! Evalcycle Scheduler - Lifecycle Notification Engine
//!
//! Schedules the CREATED, ACTIVE, REMINDER and VIEWABLE notifications of
//! course evaluations on a delayed task queue, and performs each one exactly
//! once across a cluster of nodes sharing one store. A periodic
//! reconciliation task repairs anything a crash or outage left behind.

pub mod cluster_lock;
pub mod config;
pub mod constants;
pub mod jobs;
pub mod metrics;
pub mod plan;
pub mod scheduler;
pub mod telemetry;

// Re-export commonly used types
pub use cluster_lock::{ClusterLock, Execution, HeldLock};
pub use config::SchedulerConfig;
pub use jobs::reconcile_task;
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use plan::{next_reminder_at, FirePlan, KeyPlan, Trigger};
pub use scheduler::{
    FireOutcome, JobScheduler, KeyChange, ReconcileSummary, ScheduleSummary, SchedulerPorts,
};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
