//! Evalcycle Storage - Storage Traits and Implementations
//!
//! Defines the persistence seams of the scheduler: evaluations, the shared
//! cluster lock table and the scheduled-action records. Every node of a
//! cluster must point at the same store for the lock guarantees to hold.

mod sqlite;

pub use sqlite::SqliteStorage;

use evalcycle_core::{
    ActionKey, ClusterLockRecord, EntityType, EvalError, EvalResult, Evaluation, EvaluationId,
    NodeId, ScheduledAction, StorageError, StoredState, Timestamp, ValidationError,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// STORAGE TRAITS
// ============================================================================

/// Persistence for evaluations.
pub trait EvaluationStore: Send + Sync {
    /// Insert a new evaluation and assign its id.
    ///
    /// # Errors
    /// `InvalidArgument` when the evaluation already carries an id.
    fn evaluation_insert(&self, eval: &Evaluation) -> EvalResult<EvaluationId>;

    fn evaluation_get(&self, id: EvaluationId) -> EvalResult<Option<Evaluation>>;

    /// Overwrite a persisted evaluation.
    ///
    /// # Errors
    /// `Unpersisted` without an id, `NotFound` when no row exists.
    fn evaluation_save(&self, eval: &Evaluation) -> EvalResult<()>;

    /// Ids of every evaluation that is neither Partial nor Deleted.
    fn evaluation_list_schedulable(&self) -> EvalResult<Vec<EvaluationId>>;
}

/// Shared lock table with atomic compare-and-set semantics.
pub trait LockStore: Send + Sync {
    /// Insert `record` unless an unexpired row with the same lock id exists.
    ///
    /// Returns `true` when this call won. An expired row is overwritten
    /// atomically; a live row, even one held by the same holder, is not.
    fn lock_try_insert(&self, record: &ClusterLockRecord, now: Timestamp) -> EvalResult<bool>;

    /// Move the expiry of a row still held by `holder_id` at `now`.
    fn lock_renew(
        &self,
        lock_id: &str,
        holder_id: &NodeId,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> EvalResult<bool>;

    /// Delete the row only if `holder_id` owns it. Returns whether a row went.
    fn lock_compare_and_delete(&self, lock_id: &str, holder_id: &NodeId) -> EvalResult<bool>;

    fn lock_get(&self, lock_id: &str) -> EvalResult<Option<ClusterLockRecord>>;
}

/// Records of invocations registered with the task queue.
pub trait ScheduledActionStore: Send + Sync {
    fn scheduled_action_get(&self, key: ActionKey) -> EvalResult<Option<ScheduledAction>>;

    /// Insert or replace the record for `action.key`.
    fn scheduled_action_put(&self, action: &ScheduledAction) -> EvalResult<()>;

    /// Returns whether a record was removed.
    fn scheduled_action_delete(&self, key: ActionKey) -> EvalResult<bool>;

    fn scheduled_action_list(&self, evaluation_id: EvaluationId) -> EvalResult<Vec<ScheduledAction>>;

    /// Every record, ordered by evaluation id then action type.
    fn scheduled_action_list_all(&self) -> EvalResult<Vec<ScheduledAction>>;
}

/// Everything the scheduler needs from the shared store.
pub trait PersistencePort: EvaluationStore + LockStore + ScheduledActionStore {}

impl<T: EvaluationStore + LockStore + ScheduledActionStore> PersistencePort for T {}

fn is_schedulable(eval: &Evaluation) -> bool {
    eval.id.is_some() && eval.stored_state == StoredState::Normal
}

// ============================================================================
// MOCK STORAGE
// ============================================================================

/// In-memory storage for tests and single-process use.
///
/// Each compare-and-set runs under one write guard, which gives the same
/// atomicity a database row constraint gives the SQLite adapter.
#[derive(Debug, Default)]
pub struct MockStorage {
    evaluations: Arc<RwLock<HashMap<EvaluationId, Evaluation>>>,
    locks: Arc<RwLock<HashMap<String, ClusterLockRecord>>>,
    actions: Arc<RwLock<HashMap<ActionKey, ScheduledAction>>>,
}

fn read<T>(lock: &RwLock<T>) -> EvalResult<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| StorageError::LockPoisoned.into())
}

fn write<T>(lock: &RwLock<T>) -> EvalResult<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| StorageError::LockPoisoned.into())
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all stored data.
    pub fn clear(&self) -> EvalResult<()> {
        write(&self.evaluations)?.clear();
        write(&self.locks)?.clear();
        write(&self.actions)?.clear();
        Ok(())
    }

    pub fn evaluation_count(&self) -> EvalResult<usize> {
        Ok(read(&self.evaluations)?.len())
    }

    pub fn lock_count(&self) -> EvalResult<usize> {
        Ok(read(&self.locks)?.len())
    }

    pub fn scheduled_action_count(&self) -> EvalResult<usize> {
        Ok(read(&self.actions)?.len())
    }
}

impl EvaluationStore for MockStorage {
    fn evaluation_insert(&self, eval: &Evaluation) -> EvalResult<EvaluationId> {
        if eval.id.is_some() {
            return Err(EvalError::invalid_argument("id", "already assigned"));
        }
        let mut evaluations = write(&self.evaluations)?;
        let next = evaluations.keys().map(|id| id.get()).max().unwrap_or(0) + 1;
        let id = EvaluationId::new(next).ok_or_else(|| EvalError::unavailable("id space exhausted"))?;
        let mut stored = eval.clone();
        stored.id = Some(id);
        evaluations.insert(id, stored);
        Ok(id)
    }

    fn evaluation_get(&self, id: EvaluationId) -> EvalResult<Option<Evaluation>> {
        Ok(read(&self.evaluations)?.get(&id).cloned())
    }

    fn evaluation_save(&self, eval: &Evaluation) -> EvalResult<()> {
        let id = eval.id.ok_or(ValidationError::Unpersisted)?;
        let mut evaluations = write(&self.evaluations)?;
        let slot = evaluations.get_mut(&id).ok_or(StorageError::NotFound {
            entity_type: EntityType::Evaluation,
            id: id.to_string(),
        })?;
        *slot = eval.clone();
        Ok(())
    }

    fn evaluation_list_schedulable(&self) -> EvalResult<Vec<EvaluationId>> {
        let evaluations = read(&self.evaluations)?;
        let mut ids: Vec<EvaluationId> = evaluations
            .values()
            .filter(|e| is_schedulable(e))
            .filter_map(|e| e.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl LockStore for MockStorage {
    fn lock_try_insert(&self, record: &ClusterLockRecord, now: Timestamp) -> EvalResult<bool> {
        let mut locks = write(&self.locks)?;
        match locks.get(&record.lock_id) {
            Some(existing) if !existing.is_expired(now) => Ok(false),
            _ => {
                locks.insert(record.lock_id.clone(), record.clone());
                Ok(true)
            }
        }
    }

    fn lock_renew(
        &self,
        lock_id: &str,
        holder_id: &NodeId,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> EvalResult<bool> {
        let mut locks = write(&self.locks)?;
        match locks.get_mut(lock_id) {
            Some(existing) if existing.is_held_by(holder_id, now) => {
                existing.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn lock_compare_and_delete(&self, lock_id: &str, holder_id: &NodeId) -> EvalResult<bool> {
        let mut locks = write(&self.locks)?;
        if locks.get(lock_id).is_some_and(|l| l.holder_id == *holder_id) {
            locks.remove(lock_id);
            return Ok(true);
        }
        Ok(false)
    }

    fn lock_get(&self, lock_id: &str) -> EvalResult<Option<ClusterLockRecord>> {
        Ok(read(&self.locks)?.get(lock_id).cloned())
    }
}

impl ScheduledActionStore for MockStorage {
    fn scheduled_action_get(&self, key: ActionKey) -> EvalResult<Option<ScheduledAction>> {
        Ok(read(&self.actions)?.get(&key).cloned())
    }

    fn scheduled_action_put(&self, action: &ScheduledAction) -> EvalResult<()> {
        write(&self.actions)?.insert(action.key, action.clone());
        Ok(())
    }

    fn scheduled_action_delete(&self, key: ActionKey) -> EvalResult<bool> {
        Ok(write(&self.actions)?.remove(&key).is_some())
    }

    fn scheduled_action_list(&self, evaluation_id: EvaluationId) -> EvalResult<Vec<ScheduledAction>> {
        let actions = read(&self.actions)?;
        let mut list: Vec<ScheduledAction> = actions
            .values()
            .filter(|a| a.key.evaluation_id == evaluation_id)
            .cloned()
            .collect();
        list.sort_by_key(|a| a.key);
        Ok(list)
    }

    fn scheduled_action_list_all(&self) -> EvalResult<Vec<ScheduledAction>> {
        let mut list: Vec<ScheduledAction> = read(&self.actions)?.values().cloned().collect();
        list.sort_by_key(|a| a.key);
        Ok(list)
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
