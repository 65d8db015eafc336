//! Reconciliation Background Task
//!
//! Runs [`JobScheduler::reconcile_all`] on a fixed interval until shutdown.
//! Only one node sweeps at a time; the others see the global lock busy and
//! wait for their next tick. Port calls block, so each sweep runs on the
//! blocking pool.

use crate::cluster_lock::Execution;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::JobScheduler;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Background task that periodically reconciles every evaluation.
///
/// # Arguments
///
/// * `scheduler` - Scheduler whose `reconcile_interval` drives the timer
/// * `shutdown_rx` - Watch receiver for shutdown signal
///
/// # Returns
///
/// The scheduler's metrics, for a final report
pub async fn reconcile_task(
    scheduler: Arc<JobScheduler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SchedulerMetrics> {
    let metrics = scheduler.metrics();
    let period = scheduler.config().reconcile_interval;

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        node_id = %scheduler.node_id(),
        interval_secs = period.as_secs(),
        "Reconcile task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Reconcile task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                run_sweep(&scheduler, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        reconcile_runs = snapshot.reconcile_runs,
        actions_scheduled = snapshot.actions_scheduled,
        actions_cancelled = snapshot.actions_cancelled,
        errors = snapshot.errors,
        "Reconcile task completed"
    );

    metrics
}

async fn run_sweep(scheduler: &Arc<JobScheduler>, metrics: &SchedulerMetrics) {
    let worker = Arc::clone(scheduler);
    match tokio::task::spawn_blocking(move || worker.reconcile_all()).await {
        Ok(Ok(Execution::Executed(summary))) => {
            if summary.scheduled > 0 || summary.cancelled > 0 || summary.orphans_removed > 0 {
                tracing::info!(
                    scheduled = summary.scheduled,
                    cancelled = summary.cancelled,
                    orphans_removed = summary.orphans_removed,
                    "Reconcile sweep repaired drift"
                );
            } else {
                tracing::trace!(evaluations = summary.evaluations, "Reconcile sweep found no drift");
            }
        }
        Ok(Ok(Execution::Skipped)) => {
            tracing::debug!("Reconcile sweep held by another node, skipping");
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Reconcile sweep failed");
        }
        Err(e) => {
            tracing::error!(error = %e, "Reconcile sweep panicked");
            SchedulerMetrics::incr(&metrics.errors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::SchedulerPorts;
    use evalcycle_core::SystemClock;
    use evalcycle_test_utils::fixtures::{node, queued_evaluation};
    use evalcycle_test_utils::{
        EvaluationStore, MockStorage, RecordingNotifier, RecordingTaskQueue, StaticGroups,
    };
    use std::time::Duration;

    #[tokio::test]
    async fn test_reconcile_task_runs_and_stops() {
        let store = Arc::new(MockStorage::new());
        let queue = Arc::new(RecordingTaskQueue::new());
        let id = store
            .evaluation_insert(&queued_evaluation(chrono::Utc::now()))
            .unwrap();

        let mut config = SchedulerConfig::default().with_node_id(node("sweeper"));
        config.reconcile_interval = Duration::from_millis(50);
        let scheduler = Arc::new(
            JobScheduler::new(
                config,
                SchedulerPorts {
                    store: store.clone(),
                    queue: queue.clone(),
                    notifier: Arc::new(RecordingNotifier::new()),
                    groups: Arc::new(StaticGroups::new()),
                    clock: Arc::new(SystemClock),
                },
            )
            .unwrap(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconcile_task(Arc::clone(&scheduler), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();
        let metrics = handle.await.unwrap();

        let snapshot = metrics.snapshot();
        assert!(snapshot.reconcile_runs >= 1);
        assert_eq!(snapshot.errors, 0);
        // The sweep registered the ACTIVE and VIEWABLE actions the evaluation was missing.
        assert!(queue.registered(&format!("{}/ACTIVE", id)).is_some());
        assert!(queue.registered(&format!("{}/VIEWABLE", id)).is_some());
        assert!(queue.registered(&format!("{}/CREATED", id)).is_none());
    }
}
