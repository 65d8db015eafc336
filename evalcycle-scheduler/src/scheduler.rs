//! Job scheduler
//!
//! Keeps one pending [`ScheduledAction`] per (evaluation, action type) in
//! step with the evaluation's dates, and performs fired actions exactly once
//! across the cluster. Every key is touched only under its own cluster lock,
//! whose id is the key's action token.

use crate::cluster_lock::{ClusterLock, Execution, HeldLock};
use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetrics;
use crate::plan::{desired_fire_time, plan_fire, plan_key, FirePlan, KeyPlan, Trigger};
use evalcycle_core::{
    derive_state, normalize_dates_with_report, ActionKey, ActionType, Clock, EntityType,
    EvalError, EvalResult, Evaluation, EvaluationId, GroupMembershipPort, NodeId,
    NotificationPort, ReminderBatchStatus, ScheduledAction, StorageError, TaskQueuePort,
    Timestamp, RECONCILE_LOCK_ID,
};
use evalcycle_storage::{EvaluationStore, PersistencePort, ScheduledActionStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the scheduler talks to.
#[derive(Clone)]
pub struct SchedulerPorts {
    pub store: Arc<dyn PersistencePort>,
    pub queue: Arc<dyn TaskQueuePort>,
    pub notifier: Arc<dyn NotificationPort>,
    pub groups: Arc<dyn GroupMembershipPort>,
    pub clock: Arc<dyn Clock>,
}

/// What happened to one action key during scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    Unchanged,
    Scheduled(Timestamp),
    Cancelled,
    /// A due record was left for the queue to deliver.
    LeftPending,
    /// Another node held the key; the next sweep picks it up.
    Busy,
}

/// Per-key result of scheduling one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub evaluation_id: EvaluationId,
    pub changes: Vec<(ActionType, KeyChange)>,
}

impl ScheduleSummary {
    fn new(evaluation_id: EvaluationId) -> Self {
        Self {
            evaluation_id,
            changes: Vec::with_capacity(ActionType::ALL.len()),
        }
    }

    pub fn change_for(&self, action_type: ActionType) -> Option<KeyChange> {
        self.changes
            .iter()
            .find(|(t, _)| *t == action_type)
            .map(|(_, change)| *change)
    }

    pub fn scheduled_count(&self) -> usize {
        self.count(|c| matches!(c, KeyChange::Scheduled(_)))
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(|c| matches!(c, KeyChange::Cancelled))
    }

    pub fn busy_count(&self) -> usize {
        self.count(|c| matches!(c, KeyChange::Busy))
    }

    /// True when no key was scheduled or cancelled.
    pub fn is_noop(&self) -> bool {
        self.scheduled_count() == 0 && self.cancelled_count() == 0
    }

    fn count(&self, pred: impl Fn(&KeyChange) -> bool) -> usize {
        self.changes.iter().filter(|(_, c)| pred(c)).count()
    }
}

/// Result of delivering one action token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Token did not decode.
    Dropped,
    /// Another node holds the key.
    Busy,
    /// No pending, due record: already handled or moved.
    Stale,
    Performed(ActionType),
    /// Evaluation left the state the action belongs to; nothing sent.
    Aborted(ActionType),
}

/// Result of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub evaluations: usize,
    pub scheduled: usize,
    pub cancelled: usize,
    pub busy_keys: usize,
    pub orphans_removed: usize,
    pub errors: usize,
}

/// Cluster-safe scheduler for evaluation lifecycle notifications.
pub struct JobScheduler {
    config: SchedulerConfig,
    store: Arc<dyn PersistencePort>,
    queue: Arc<dyn TaskQueuePort>,
    notifier: Arc<dyn NotificationPort>,
    groups: Arc<dyn GroupMembershipPort>,
    clock: Arc<dyn Clock>,
    locks: ClusterLock<dyn PersistencePort>,
    metrics: Arc<SchedulerMetrics>,
}

impl JobScheduler {
    /// Build a scheduler after validating `config`.
    pub fn new(config: SchedulerConfig, ports: SchedulerPorts) -> EvalResult<Self> {
        config.validate()?;
        let locks = ClusterLock::new(Arc::clone(&ports.store), Arc::clone(&ports.clock));
        Ok(Self {
            config,
            store: ports.store,
            queue: ports.queue,
            notifier: ports.notifier,
            groups: ports.groups,
            clock: ports.clock,
            locks,
            metrics: Arc::new(SchedulerMetrics::new()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Schedule every action for a newly persisted evaluation.
    ///
    /// Repairs the stored dates first. CREATED fires now; ACTIVE fires at
    /// the start date, or now if the evaluation already started.
    pub fn on_evaluation_created(&self, id: EvaluationId) -> EvalResult<ScheduleSummary> {
        let result = self.reschedule(id, Trigger::Created);
        self.track(result)
    }

    /// Move pending ACTIVE, REMINDER and VIEWABLE actions to the current
    /// stored dates. Keys whose fire time did not move are left untouched;
    /// records that never reached the queue are registered again.
    pub fn on_evaluation_date_changed(&self, id: EvaluationId) -> EvalResult<ScheduleSummary> {
        let result = self.reschedule(id, Trigger::DatesChanged);
        self.track(result)
    }

    /// Handle a token delivered by the task queue.
    ///
    /// # Errors
    /// Storage, port and lock faults propagate and leave the pending record
    /// in place so the queue can redeliver.
    pub fn on_action_fired(&self, token: &str) -> EvalResult<FireOutcome> {
        let key = match ActionKey::decode(token) {
            Ok(key) => key,
            Err(e) => {
                SchedulerMetrics::incr(&self.metrics.tokens_dropped);
                warn!(token, error = %e, "Dropping undecodable action token");
                return Ok(FireOutcome::Dropped);
            }
        };

        let result = self.locks.run_exclusively(
            &key.encode(),
            &self.config.node_id,
            self.config.lock_ttl,
            |held| self.perform(key, held),
        );
        match self.track(result)? {
            Execution::Executed(outcome) => Ok(outcome),
            Execution::Skipped => {
                SchedulerMetrics::incr(&self.metrics.fires_busy);
                debug!(token = %key, "Action held by another node");
                Ok(FireOutcome::Busy)
            }
        }
    }

    /// Cancel every pending action of an evaluation.
    pub fn remove_scheduled_invocations(&self, id: EvaluationId) -> EvalResult<ScheduleSummary> {
        let result = self.remove_all(id);
        self.track(result)
    }

    /// Drop everything pending for a soft-deleted evaluation.
    ///
    /// The caller persists the Deleted flag; an action firing meanwhile
    /// re-derives the state and aborts.
    pub fn on_evaluation_deleted(&self, id: EvaluationId) -> EvalResult<ScheduleSummary> {
        info!(evaluation_id = %id, "Evaluation deleted, removing scheduled actions");
        self.remove_scheduled_invocations(id)
    }

    /// Reconcile every schedulable evaluation under the global sweep lock,
    /// then remove records left behind by evaluations that are no longer
    /// schedulable.
    ///
    /// Per-evaluation failures are counted and the sweep continues.
    pub fn reconcile_all(&self) -> EvalResult<Execution<ReconcileSummary>> {
        let result = self.locks.run_exclusively(
            RECONCILE_LOCK_ID,
            &self.config.node_id,
            self.config.lock_ttl,
            |held| self.sweep(held),
        );
        let result = self.track(result)?;
        if !result.was_executed() {
            debug!(node_id = %self.config.node_id, "Reconcile sweep running elsewhere");
        }
        Ok(result)
    }

    fn track<T>(&self, result: EvalResult<T>) -> EvalResult<T> {
        if result.is_err() {
            SchedulerMetrics::incr(&self.metrics.errors);
        }
        result
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn reschedule(&self, id: EvaluationId, trigger: Trigger) -> EvalResult<ScheduleSummary> {
        let eval = self.load_normalized(id)?;
        let mut summary = ScheduleSummary::new(id);

        for action_type in ActionType::ALL {
            let key = ActionKey::new(id, action_type);
            let change = match self.locks.run_exclusively(
                &key.encode(),
                &self.config.node_id,
                self.config.lock_ttl,
                |_| self.reconcile_key(&eval, key, trigger),
            )? {
                Execution::Executed(change) => change,
                Execution::Skipped => {
                    SchedulerMetrics::incr(&self.metrics.keys_busy);
                    debug!(token = %key, "Key busy, leaving it for the next sweep");
                    KeyChange::Busy
                }
            };
            summary.changes.push((action_type, change));
        }

        Ok(summary)
    }

    fn load_normalized(&self, id: EvaluationId) -> EvalResult<Evaluation> {
        let mut eval = self.store.evaluation_get(id)?.ok_or_else(|| StorageError::NotFound {
            entity_type: EntityType::Evaluation,
            id: id.to_string(),
        })?;

        let report = normalize_dates_with_report(&mut eval, self.config.min_gap_hours)?;
        if report.changed() {
            self.store.evaluation_save(&eval)?;
            info!(
                evaluation_id = %id,
                due_changed = report.due_changed,
                stop_changed = report.stop_changed,
                view_changed = report.view_changed,
                "Repaired evaluation dates"
            );
        }
        Ok(eval)
    }

    /// Bring one key in line with the evaluation. Caller holds the key's lock.
    fn reconcile_key(
        &self,
        eval: &Evaluation,
        key: ActionKey,
        trigger: Trigger,
    ) -> EvalResult<KeyChange> {
        let now = self.clock.now();
        let pending = self.store.scheduled_action_get(key)?;
        let desired = desired_fire_time(
            eval,
            key.action_type,
            now,
            trigger,
            self.config.reminder_step(),
            pending.as_ref(),
        );

        match plan_key(
            desired,
            pending.as_ref(),
            now,
            self.config.redelivery_grace(),
        ) {
            KeyPlan::Idle | KeyPlan::Unchanged => Ok(KeyChange::Unchanged),
            KeyPlan::LeavePending => {
                debug!(token = %key, "Due action left for delivery");
                Ok(KeyChange::LeftPending)
            }
            KeyPlan::Requeue => match pending {
                Some(record) => {
                    self.requeue(record, now)?;
                    Ok(KeyChange::Scheduled(now))
                }
                None => Ok(KeyChange::Unchanged),
            },
            KeyPlan::Cancel => {
                self.cancel_key(key)?;
                Ok(KeyChange::Cancelled)
            }
            KeyPlan::Replace(fire_at) => {
                self.register(key, fire_at, pending.is_some(), now)?;
                Ok(KeyChange::Scheduled(fire_at))
            }
        }
    }

    /// Cancel-then-create. The record is written unqueued first so a failure
    /// between the store and the queue leaves something the next
    /// reconciliation re-registers.
    fn register(
        &self,
        key: ActionKey,
        fire_at: Timestamp,
        replacing: bool,
        now: Timestamp,
    ) -> EvalResult<()> {
        let token = key.encode();
        if replacing {
            self.queue.cancel(&token)?;
            SchedulerMetrics::incr(&self.metrics.actions_cancelled);
        }

        let mut record = ScheduledAction::pending(key, fire_at);
        self.store.scheduled_action_put(&record)?;
        self.queue.schedule_at(&token, fire_at.max(now))?;
        record.queued = true;
        self.store.scheduled_action_put(&record)?;

        SchedulerMetrics::incr(&self.metrics.actions_scheduled);
        info!(
            evaluation_id = %key.evaluation_id,
            action_type = %key.action_type,
            fire_at = %fire_at,
            replaced = replacing,
            "Action scheduled"
        );
        Ok(())
    }

    /// Hand an overdue record back to the queue unchanged, keeping its
    /// original fire time and any reminder progress.
    fn requeue(&self, mut record: ScheduledAction, now: Timestamp) -> EvalResult<()> {
        let key = record.key;
        let token = key.encode();
        self.queue.cancel(&token)?;

        record.queued = false;
        self.store.scheduled_action_put(&record)?;
        self.queue.schedule_at(&token, now)?;
        record.queued = true;
        self.store.scheduled_action_put(&record)?;

        SchedulerMetrics::incr(&self.metrics.actions_requeued);
        warn!(
            evaluation_id = %key.evaluation_id,
            action_type = %key.action_type,
            fire_at = %record.fire_at,
            "Overdue action was never performed, registered again"
        );
        Ok(())
    }

    fn cancel_key(&self, key: ActionKey) -> EvalResult<()> {
        self.queue.cancel(&key.encode())?;
        self.store.scheduled_action_delete(key)?;
        SchedulerMetrics::incr(&self.metrics.actions_cancelled);
        info!(
            evaluation_id = %key.evaluation_id,
            action_type = %key.action_type,
            "Action cancelled"
        );
        Ok(())
    }

    fn remove_all(&self, id: EvaluationId) -> EvalResult<ScheduleSummary> {
        let mut summary = ScheduleSummary::new(id);
        for key in ActionKey::all_for(id) {
            let change = match self.locks.run_exclusively(
                &key.encode(),
                &self.config.node_id,
                self.config.lock_ttl,
                |_| self.remove_key(key),
            )? {
                Execution::Executed(change) => change,
                Execution::Skipped => {
                    SchedulerMetrics::incr(&self.metrics.keys_busy);
                    KeyChange::Busy
                }
            };
            summary.changes.push((key.action_type, change));
        }
        Ok(summary)
    }

    fn remove_key(&self, key: ActionKey) -> EvalResult<KeyChange> {
        if self.store.scheduled_action_get(key)?.is_none() {
            return Ok(KeyChange::Unchanged);
        }
        self.cancel_key(key)?;
        Ok(KeyChange::Cancelled)
    }

    // ------------------------------------------------------------------
    // Firing
    // ------------------------------------------------------------------

    fn perform(
        &self,
        key: ActionKey,
        held: &mut HeldLock<'_, dyn PersistencePort>,
    ) -> EvalResult<FireOutcome> {
        let now = self.clock.now();
        let Some(record) = self
            .store
            .scheduled_action_get(key)?
            .filter(|record| record.is_due(now))
        else {
            SchedulerMetrics::incr(&self.metrics.fires_stale);
            debug!(token = %key, "No due record, nothing to do");
            return Ok(FireOutcome::Stale);
        };

        let eval = self.store.evaluation_get(key.evaluation_id)?;
        let state = eval.as_ref().map(|e| derive_state(e, now, true));

        let eval = match (plan_fire(key.action_type, state), eval) {
            (FirePlan::Notify, _) => {
                self.notify(key)?;
                None
            }
            (FirePlan::FanOutReminders, Some(eval)) => {
                self.send_reminders(key, record, held)?;
                Some(eval)
            }
            (FirePlan::Abort, _) | (FirePlan::FanOutReminders, None) => {
                self.store.scheduled_action_delete(key)?;
                SchedulerMetrics::incr(&self.metrics.actions_aborted);
                info!(
                    evaluation_id = %key.evaluation_id,
                    action_type = %key.action_type,
                    state = ?state,
                    "Action aborted, evaluation left the required state"
                );
                return Ok(FireOutcome::Aborted(key.action_type));
            }
        };

        self.store.scheduled_action_delete(key)?;
        SchedulerMetrics::incr(&self.metrics.actions_performed);
        info!(
            evaluation_id = %key.evaluation_id,
            action_type = %key.action_type,
            "Action performed"
        );

        // The next reminder is chained here; the key's lock is already held.
        if let Some(eval) = eval {
            let change = self.reconcile_key(&eval, key, Trigger::DatesChanged)?;
            debug!(token = %key, change = ?change, "Next reminder");
        }

        Ok(FireOutcome::Performed(key.action_type))
    }

    fn notify(&self, key: ActionKey) -> EvalResult<()> {
        let id = key.evaluation_id;
        match key.action_type {
            ActionType::Created => self.notifier.send_created(id),
            ActionType::Active => self.notifier.send_active(id),
            ActionType::Viewable => self.notifier.send_viewable(id),
            ActionType::Reminder => Err(EvalError::invalid_argument(
                "action_type",
                "reminders are sent per recipient group",
            )),
        }
    }

    /// Send one reminder per unresponded group, persisting progress before
    /// each send and renewing the lock after it. A redelivery resumes at the
    /// group that was in flight.
    fn send_reminders(
        &self,
        key: ActionKey,
        mut record: ScheduledAction,
        held: &mut HeldLock<'_, dyn PersistencePort>,
    ) -> EvalResult<()> {
        let id = key.evaluation_id;
        let groups = self.groups.unresponded_groups(id)?;
        let total = u32::try_from(groups.len())
            .map_err(|_| EvalError::invalid_argument("groups", "too many recipient groups"))?;

        let resume_at = match record.progress.as_deref() {
            None => 0,
            Some(token) => match ReminderBatchStatus::decode(token) {
                Ok(status) => status.resume_index(&groups),
                Err(e) => {
                    warn!(evaluation_id = %id, error = %e, "Discarding unreadable reminder progress");
                    0
                }
            },
        };
        if resume_at > 0 {
            info!(evaluation_id = %id, resume_at, total, "Resuming reminder batch");
        }

        for (current, group) in (1..=total).zip(groups.iter()).skip(resume_at) {
            let status = ReminderBatchStatus::new(total, current, group.as_str())?;
            record.progress = Some(status.encode());
            self.store.scheduled_action_put(&record)?;

            self.notifier.send_reminder(id, group)?;
            SchedulerMetrics::incr(&self.metrics.reminders_sent);
            held.renew()?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation sweep
    // ------------------------------------------------------------------

    fn sweep(&self, held: &mut HeldLock<'_, dyn PersistencePort>) -> EvalResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let ids = self.store.evaluation_list_schedulable()?;

        for &id in &ids {
            summary.evaluations += 1;
            match self.reschedule(id, Trigger::DatesChanged) {
                Ok(result) => {
                    summary.scheduled += result.scheduled_count();
                    summary.cancelled += result.cancelled_count();
                    summary.busy_keys += result.busy_count();
                }
                Err(e) => {
                    summary.errors += 1;
                    SchedulerMetrics::incr(&self.metrics.errors);
                    warn!(evaluation_id = %id, error = %e, "Reconcile failed for evaluation");
                }
            }
            held.renew()?;
        }

        let live: BTreeSet<EvaluationId> = ids.into_iter().collect();
        for action in self.store.scheduled_action_list_all()? {
            let key = action.key;
            if live.contains(&key.evaluation_id) {
                continue;
            }
            match self.locks.run_exclusively(
                &key.encode(),
                &self.config.node_id,
                self.config.lock_ttl,
                |_| self.remove_orphan(key),
            ) {
                Ok(Execution::Executed(true)) => summary.orphans_removed += 1,
                Ok(Execution::Executed(false)) => {}
                Ok(Execution::Skipped) => summary.busy_keys += 1,
                Err(e) => {
                    summary.errors += 1;
                    SchedulerMetrics::incr(&self.metrics.errors);
                    warn!(token = %key, error = %e, "Failed to remove orphaned action");
                }
            }
        }

        SchedulerMetrics::incr(&self.metrics.reconcile_runs);
        info!(
            evaluations = summary.evaluations,
            scheduled = summary.scheduled,
            cancelled = summary.cancelled,
            busy_keys = summary.busy_keys,
            orphans_removed = summary.orphans_removed,
            errors = summary.errors,
            "Reconcile sweep completed"
        );
        Ok(summary)
    }

    /// Re-checked under the key lock: the evaluation may have become
    /// schedulable since the sweep listed them.
    fn remove_orphan(&self, key: ActionKey) -> EvalResult<bool> {
        let now = self.clock.now();
        let live = self
            .store
            .evaluation_get(key.evaluation_id)?
            .is_some_and(|eval| derive_state(&eval, now, true).is_schedulable());
        if live || self.store.scheduled_action_get(key)?.is_none() {
            return Ok(false);
        }
        self.cancel_key(key)?;
        Ok(true)
    }
}
