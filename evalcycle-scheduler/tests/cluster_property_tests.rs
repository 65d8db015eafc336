//! Property-Based Tests for Cluster Exclusivity
//!
//! Several scheduler nodes share one store and one queue. Whatever the
//! interleaving, a lock has one holder, a guarded action runs once, and
//! every unresponded group receives exactly one reminder per run.

use chrono::Duration;
use evalcycle_core::{Clock, ClusterLockRecord, LockOutcome, SystemClock, RECONCILE_LOCK_ID};
use evalcycle_scheduler::{ClusterLock, Execution, FireOutcome, JobScheduler, SchedulerPorts};
use evalcycle_storage::{EvaluationStore, LockStore, ScheduledActionStore};
use evalcycle_test_utils::assertions::assert_lock_indeterminate;
use evalcycle_test_utils::fixtures::{base_time, evaluation_with_dates, node, queued_evaluation};
use evalcycle_test_utils::{
    ActionKey, ActionType, EvaluationId, FlakyLockStore, MockStorage, Notification,
    ReminderBatchStatus, ScheduledAction,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

#[path = "support/cluster.rs"]
mod cluster_support;
use cluster_support::Cluster;

const TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// Evaluation 42: active since an hour ago, due in ten days.
fn active_42(cluster: &Cluster, groups: &[&str]) -> EvaluationId {
    let now = base_time();
    let id = cluster.insert_as(
        &evaluation_with_dates(now - Duration::hours(1), Some(now + Duration::days(10)), None, None),
        42,
    );
    assert_eq!(id.get(), 42);
    cluster.groups.set(id, groups);
    id
}

/// Move the clock to the first reminder of [`active_42`].
fn reach_first_reminder(cluster: &Cluster) {
    cluster
        .clock
        .set(base_time() - Duration::hours(1) + Duration::days(2));
}

// ============================================================================
// LOCK EXCLUSIVITY
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// N nodes racing for one lock id: exactly one wins.
    #[test]
    fn prop_one_node_acquires(nodes in 2usize..10) {
        let locks = ClusterLock::new(Arc::new(MockStorage::new()), Arc::new(SystemClock));
        let barrier = Barrier::new(nodes);
        let winners = AtomicUsize::new(0);

        thread::scope(|s| {
            for i in 0..nodes {
                let locks = &locks;
                let barrier = &barrier;
                let winners = &winners;
                s.spawn(move || {
                    barrier.wait();
                    let holder = node(&format!("node-{}", i));
                    if locks.try_acquire("42/REMINDER", &holder, TTL).is_acquired() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        prop_assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    /// A reminder run interrupted at any group still reaches every group
    /// exactly once after redelivery.
    #[test]
    fn prop_reminders_resume_without_duplicates(
        group_count in 1usize..8,
        fail_at in 0usize..8,
    ) {
        let cluster = Cluster::new();
        let names: Vec<String> = (0..group_count).map(|i| format!("g{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let id = active_42(&cluster, &refs);
        let a = cluster.node("node-a");
        let b = cluster.node("node-b");
        a.on_evaluation_created(id).unwrap();
        reach_first_reminder(&cluster);

        let fail_at = fail_at % group_count;
        cluster.notifier.fail_once_for_group(names[fail_at].clone());

        let token = format!("{}/REMINDER", id);
        prop_assert!(a.on_action_fired(&token).is_err());
        prop_assert_eq!(
            b.on_action_fired(&token).unwrap(),
            FireOutcome::Performed(ActionType::Reminder)
        );
        prop_assert_eq!(cluster.notifier.reminders_for(id), names);
    }
}

#[test]
fn test_guarded_action_runs_once_while_held() {
    let locks = ClusterLock::new(Arc::new(MockStorage::new()), Arc::new(SystemClock));
    let runs = AtomicUsize::new(0);
    let (acquired_tx, acquired_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        let locks = &locks;
        let runs = &runs;
        let first = s.spawn(move || {
            locks.run_exclusively("42/ACTIVE", &node("node-a"), TTL, |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                acquired_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
        });

        acquired_rx.recv().unwrap();
        let second = locks
            .run_exclusively("42/ACTIVE", &node("node-b"), TTL, |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(second, Execution::Skipped);

        release_tx.send(()).unwrap();
        assert_eq!(first.join().unwrap().unwrap(), Execution::Executed(()));
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unreachable_lock_table_is_indeterminate() {
    let store = Arc::new(FlakyLockStore::new(MockStorage::new()));
    let locks = ClusterLock::new(Arc::clone(&store), Arc::new(SystemClock));
    store.set_failing(true);

    assert!(matches!(
        locks.try_acquire("42/ACTIVE", &node("node-a"), TTL),
        LockOutcome::Indeterminate(_)
    ));
    let guarded = locks.run_exclusively("42/ACTIVE", &node("node-a"), TTL, |_| Ok(()));
    assert_lock_indeterminate(&guarded);

    store.set_failing(false);
    assert!(locks.try_acquire("42/ACTIVE", &node("node-a"), TTL).is_acquired());
}

// ============================================================================
// FIRING ACROSS NODES
// ============================================================================

#[test]
fn test_two_nodes_firing_reminder_send_once() {
    let cluster = Cluster::new();
    let id = active_42(&cluster, &["g1", "g2", "g3"]);
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");
    a.on_evaluation_created(id).unwrap();
    reach_first_reminder(&cluster);

    let token = "42/REMINDER";
    let barrier = Barrier::new(2);
    let outcomes: Vec<FireOutcome> = thread::scope(|s| {
        let handles: Vec<_> = [&a, &b]
            .into_iter()
            .map(|n| {
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    n.on_action_fired(token).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let performed = outcomes
        .iter()
        .filter(|o| **o == FireOutcome::Performed(ActionType::Reminder))
        .count();
    assert_eq!(performed, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, FireOutcome::Performed(_) | FireOutcome::Busy | FireOutcome::Stale)));
    assert_eq!(cluster.notifier.reminders_for(id), vec!["g1", "g2", "g3"]);
}

#[test]
fn test_redelivery_after_release_is_stale() {
    let cluster = Cluster::new();
    let id = active_42(&cluster, &["g1"]);
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");
    a.on_evaluation_created(id).unwrap();

    assert_eq!(
        a.on_action_fired("42/CREATED").unwrap(),
        FireOutcome::Performed(ActionType::Created)
    );
    assert_eq!(b.on_action_fired("42/CREATED").unwrap(), FireOutcome::Stale);
    assert_eq!(cluster.notifier.count(&Notification::Created(id)), 1);
    assert_eq!(b.metrics().snapshot().fires_stale, 1);
}

#[test]
fn test_busy_key_then_takeover_after_expiry() {
    let cluster = Cluster::new();
    let id = active_42(&cluster, &["g1"]);
    let b = cluster.node("node-b");
    b.on_evaluation_created(id).unwrap();

    // node-a took the lock and died without releasing it.
    let crashed = ClusterLock::new(cluster.store.clone(), cluster.clock.clone());
    let LockOutcome::Acquired(_abandoned) =
        crashed.try_acquire("42/ACTIVE", &node("node-a"), TTL)
    else {
        panic!("node-a should acquire");
    };

    assert_eq!(b.on_action_fired("42/ACTIVE").unwrap(), FireOutcome::Busy);
    assert!(cluster.notifier.sent().iter().all(|n| *n != Notification::Active(id)));

    cluster.clock.advance(Duration::seconds(61));
    assert_eq!(
        b.on_action_fired("42/ACTIVE").unwrap(),
        FireOutcome::Performed(ActionType::Active)
    );
    assert_eq!(cluster.notifier.count(&Notification::Active(id)), 1);
    assert_eq!(b.metrics().snapshot().fires_busy, 1);
}

#[test]
fn test_reminder_progress_survives_failure() {
    let cluster = Cluster::new();
    let id = active_42(&cluster, &["g1", "g2", "g3"]);
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");
    a.on_evaluation_created(id).unwrap();
    reach_first_reminder(&cluster);
    cluster.notifier.fail_once_for_group("g2");

    assert!(a.on_action_fired("42/REMINDER").is_err());
    let key = ActionKey::new(id, ActionType::Reminder);
    let record = cluster.store.scheduled_action_get(key).unwrap().unwrap();
    let progress = ReminderBatchStatus::decode(record.progress.as_deref().unwrap()).unwrap();
    assert_eq!((progress.total(), progress.current(), progress.group_id()), (3, 2, "g2"));
    assert_eq!(cluster.store.lock_get("42/REMINDER").unwrap(), None);

    // A membership change between attempts: g1 answered in the meantime.
    cluster.groups.set(id, &["g2", "g3"]);
    assert_eq!(
        b.on_action_fired("42/REMINDER").unwrap(),
        FireOutcome::Performed(ActionType::Reminder)
    );
    assert_eq!(cluster.notifier.reminders_for(id), vec!["g1", "g2", "g3"]);
}

#[test]
fn test_fire_with_unreachable_lock_table_keeps_record() {
    let cluster = Cluster::new();
    let flaky = Arc::new(FlakyLockStore::new(MockStorage::new()));
    let a = JobScheduler::new(
        Cluster::config("node-a"),
        SchedulerPorts {
            store: flaky.clone(),
            ..cluster.ports()
        },
    )
    .unwrap();

    let id = flaky.evaluation_insert(&queued_evaluation(base_time())).unwrap();
    a.on_evaluation_created(id).unwrap();

    flaky.set_failing(true);
    let token = format!("{}/CREATED", id);
    assert_lock_indeterminate(&a.on_action_fired(&token));
    assert!(flaky
        .scheduled_action_get(ActionKey::new(id, ActionType::Created))
        .unwrap()
        .is_some());
    assert!(cluster.notifier.sent().is_empty());

    flaky.set_failing(false);
    assert_eq!(
        a.on_action_fired(&token).unwrap(),
        FireOutcome::Performed(ActionType::Created)
    );
}

// ============================================================================
// LOST DELIVERIES
// ============================================================================

#[test]
fn test_delivery_lost_to_busy_key_is_registered_again() {
    let cluster = Cluster::new();
    let a = cluster.node("node-a");
    let now = base_time();
    let start = now + Duration::days(1);
    let id = cluster.insert(&queued_evaluation(now));
    a.on_evaluation_created(id).unwrap();
    cluster.deliver_due(&a);
    let token = format!("{}/ACTIVE", id);

    // node-b is reconciling the key at the moment the queue delivers it.
    cluster.clock.set(start);
    let other = ClusterLock::new(cluster.store.clone(), cluster.clock.clone());
    let LockOutcome::Acquired(held) = other.try_acquire(&token, &node("node-b"), TTL) else {
        panic!("node-b should acquire");
    };
    let outcomes = cluster.deliver_due(&a);
    assert!(matches!(outcomes.as_slice(), [Ok(FireOutcome::Busy)]));
    other.release(held);
    assert_eq!(cluster.queue.registered(&token), None);

    // Inside the grace period the record is still trusted to the queue.
    let summary = a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!(summary.scheduled, 0);

    cluster.clock.advance(Duration::minutes(11));
    let summary = a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!(summary.scheduled, 1);
    assert_eq!(
        cluster.queue.registered(&token),
        Some(start + Duration::minutes(11))
    );
    let record = cluster
        .store
        .scheduled_action_get(ActionKey::new(id, ActionType::Active))
        .unwrap()
        .unwrap();
    assert_eq!(record.fire_at, start);
    assert!(record.queued);

    let outcomes = cluster.deliver_due(&a);
    assert!(matches!(
        outcomes.as_slice(),
        [Ok(FireOutcome::Performed(ActionType::Active))]
    ));
    assert_eq!(cluster.notifier.count(&Notification::Active(id)), 1);
    assert_eq!(a.metrics().snapshot().actions_requeued, 1);

    // Performed once; nothing left to bring back.
    let summary = a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!(summary.scheduled, 0);
}

#[test]
fn test_early_delivery_is_registered_again() {
    let cluster = Cluster::new();
    let a = cluster.node("node-a");
    let now = base_time();
    let start = now + Duration::days(1);
    let id = cluster.insert(&queued_evaluation(now));
    a.on_evaluation_created(id).unwrap();
    cluster.deliver_due(&a);
    let token = format!("{}/ACTIVE", id);

    // The queue's clock runs ahead of this node's.
    cluster.clock.set(start - Duration::seconds(30));
    let delivered = cluster.queue.take_due(start);
    assert_eq!(delivered, vec![token.clone()]);
    assert_eq!(a.on_action_fired(&token).unwrap(), FireOutcome::Stale);

    cluster.clock.set(start + Duration::minutes(11));
    let summary = a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!(summary.scheduled, 1);
    cluster.deliver_due(&a);
    assert_eq!(cluster.notifier.count(&Notification::Active(id)), 1);
}

#[test]
fn test_requeued_reminder_keeps_progress() {
    let cluster = Cluster::new();
    let id = active_42(&cluster, &["g1", "g2", "g3"]);
    let a = cluster.node("node-a");
    a.on_evaluation_created(id).unwrap();
    cluster.deliver_due(&a);
    reach_first_reminder(&cluster);
    cluster.notifier.fail_once_for_group("g2");
    assert_eq!(cluster.queue.take_due(cluster.clock.now()), vec!["42/REMINDER".to_string()]);
    assert!(a.on_action_fired("42/REMINDER").is_err());

    // The failed attempt consumed the delivery.
    cluster.clock.advance(Duration::minutes(11));
    let summary = a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!(summary.scheduled, 1);
    let record = cluster
        .store
        .scheduled_action_get(ActionKey::new(id, ActionType::Reminder))
        .unwrap()
        .unwrap();
    assert_eq!(record.progress.as_deref(), Some("3:2:g2"));

    cluster.deliver_due(&a);
    assert_eq!(cluster.notifier.reminders_for(id), vec!["g1", "g2", "g3"]);
}

// ============================================================================
// RECONCILIATION
// ============================================================================

#[test]
fn test_reconcile_sweep_is_exclusive() {
    let cluster = Cluster::new();
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let sweep = ClusterLock::new(cluster.store.clone(), cluster.clock.clone());
    let LockOutcome::Acquired(held) = sweep.try_acquire(RECONCILE_LOCK_ID, b.node_id(), TTL) else {
        panic!("node-b should take the sweep lock");
    };
    assert_eq!(a.reconcile_all().unwrap(), Execution::Skipped);

    sweep.release(held);
    assert!(a.reconcile_all().unwrap().was_executed());
    assert_eq!(a.metrics().snapshot().reconcile_runs, 1);
}

#[test]
fn test_reconcile_repairs_drift() {
    let cluster = Cluster::new();
    let node_a = cluster.node("node-a");
    let now = base_time();

    // Never reached the queue.
    let stranded = cluster.insert(&queued_evaluation(now));
    cluster
        .store
        .scheduled_action_put(&ScheduledAction::pending(
            ActionKey::new(stranded, ActionType::Active),
            now + Duration::days(1),
        ))
        .unwrap();

    // Records left behind by an evaluation that went back to draft.
    let mut drafted = queued_evaluation(now);
    let orphaned = cluster.insert(&drafted);
    node_a.on_evaluation_created(orphaned).unwrap();
    drafted.id = Some(orphaned);
    drafted.stored_state = evalcycle_test_utils::StoredState::Partial;
    cluster.store.evaluation_save(&drafted).unwrap();

    let summary = node_a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!(summary.evaluations, 1);
    assert_eq!(summary.orphans_removed, 4);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.scheduled, 3);

    assert_eq!(
        cluster.queue.registered(&format!("{}/ACTIVE", stranded)),
        Some(now + Duration::days(1))
    );
    assert!(cluster.store.scheduled_action_list(orphaned).unwrap().is_empty());
    assert!(cluster
        .queue
        .registered_tokens()
        .iter()
        .all(|t| !t.starts_with(&format!("{}/", orphaned))));

    // A second sweep finds nothing left to do.
    let again = node_a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!((again.scheduled, again.cancelled, again.orphans_removed), (0, 0, 0));
}

#[test]
fn test_reconcile_skips_busy_keys() {
    let cluster = Cluster::new();
    let a = cluster.node("node-a");
    let now = base_time();
    let id = cluster.insert(&queued_evaluation(now));
    let token = format!("{}/VIEWABLE", id);

    let other = ClusterLock::new(cluster.store.clone(), cluster.clock.clone());
    let LockOutcome::Acquired(held) = other.try_acquire(&token, &node("node-b"), TTL) else {
        panic!("node-b should acquire");
    };

    let summary = a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!(summary.busy_keys, 1);
    assert_eq!(cluster.queue.registered(&token), None);

    other.release(held);
    let summary = a.reconcile_all().unwrap().executed().unwrap();
    assert_eq!(summary.busy_keys, 0);
    assert_eq!(cluster.queue.registered(&token), Some(now + Duration::days(9)));
    assert_eq!(a.metrics().snapshot().keys_busy, 1);
}

#[test]
fn test_lock_rows_do_not_leak() {
    let cluster = Cluster::new();
    let a = cluster.node("node-a");
    let id = active_42(&cluster, &["g1", "g2"]);
    a.on_evaluation_created(id).unwrap();
    reach_first_reminder(&cluster);
    cluster.deliver_due(&a);
    a.reconcile_all().unwrap();

    assert_eq!(cluster.store.lock_count().unwrap(), 0);
    let leftover: Option<ClusterLockRecord> = cluster.store.lock_get(RECONCILE_LOCK_ID).unwrap();
    assert!(leftover.is_none());
}
