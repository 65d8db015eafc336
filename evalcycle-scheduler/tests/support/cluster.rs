//! Shared in-memory cluster for scheduler integration tests.
//!
//! Every node built from one `Cluster` shares the store, queue, notifier,
//! membership table and clock, the way real nodes share a database and a
//! task queue.

#![allow(dead_code)]

use evalcycle_scheduler::{FireOutcome, JobScheduler, SchedulerConfig, SchedulerPorts};
use evalcycle_test_utils::fixtures::{base_time, node};
use evalcycle_test_utils::{
    EvalResult, Evaluation, EvaluationId, EvaluationStore, ManualClock, MockStorage,
    RecordingNotifier, RecordingTaskQueue, StaticGroups,
};
use std::sync::Arc;
use std::time::Duration;

pub const DAY_SECS: u64 = 86_400;

pub struct Cluster {
    pub store: Arc<MockStorage>,
    pub queue: Arc<RecordingTaskQueue>,
    pub notifier: Arc<RecordingNotifier>,
    pub groups: Arc<StaticGroups>,
    pub clock: Arc<ManualClock>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MockStorage::new()),
            queue: Arc::new(RecordingTaskQueue::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            groups: Arc::new(StaticGroups::new()),
            clock: Arc::new(ManualClock::new(base_time())),
        }
    }

    /// Config shared by test nodes: reminders every two days.
    pub fn config(name: &str) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_node_id(node(name))
            .with_reminder_interval(Some(Duration::from_secs(2 * DAY_SECS)))
    }

    pub fn node(&self, name: &str) -> JobScheduler {
        self.node_with(Self::config(name))
    }

    pub fn node_with(&self, config: SchedulerConfig) -> JobScheduler {
        JobScheduler::new(config, self.ports()).expect("valid test config")
    }

    pub fn ports(&self) -> SchedulerPorts {
        SchedulerPorts {
            store: self.store.clone(),
            queue: self.queue.clone(),
            notifier: self.notifier.clone(),
            groups: self.groups.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn insert(&self, eval: &Evaluation) -> EvaluationId {
        self.store.evaluation_insert(eval).expect("insert evaluation")
    }

    /// Insert `eval` so that it receives the id `want`, padding the table
    /// with unschedulable drafts.
    pub fn insert_as(&self, eval: &Evaluation, want: i64) -> EvaluationId {
        loop {
            let next = self.store.evaluation_count().expect("count") as i64 + 1;
            if next == want {
                return self.insert(eval);
            }
            assert!(next < want, "table already past id {}", want);
            self.insert(&Evaluation::draft("filler", base_time()));
        }
    }

    pub fn stored(&self, id: EvaluationId) -> Evaluation {
        self.store
            .evaluation_get(id)
            .expect("read evaluation")
            .expect("evaluation exists")
    }

    /// Deliver every due registration to `node`, as the queue would.
    pub fn deliver_due(&self, node: &JobScheduler) -> Vec<EvalResult<FireOutcome>> {
        let now = evalcycle_test_utils::Clock::now(self.clock.as_ref());
        self.queue
            .take_due(now)
            .iter()
            .map(|token| node.on_action_fired(token))
            .collect()
    }
}
