//! Cluster-wide mutual exclusion over the shared lock table
//!
//! Every firing and reconciliation path runs inside [`ClusterLock::run_exclusively`].
//! Acquisition is one atomic conditional insert; expired rows are taken over
//! at acquisition time, so a crashed holder blocks others for at most one TTL.

use evalcycle_core::{
    Acquired, Clock, ClusterLockRecord, EvalResult, Lock, LockError, LockOutcome, NodeId,
    ReleaseOutcome,
};
use evalcycle_storage::LockStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Whether a guarded action ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution<T> {
    Executed(T),
    /// Another holder had the lock. Not an error.
    Skipped,
}

impl<T> Execution<T> {
    pub fn executed(self) -> Option<T> {
        match self {
            Execution::Executed(value) => Some(value),
            Execution::Skipped => None,
        }
    }

    pub fn was_executed(&self) -> bool {
        matches!(self, Execution::Executed(_))
    }
}

/// Lock primitive bound to one store and clock.
pub struct ClusterLock<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: ?Sized> Clone for ClusterLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: LockStore + ?Sized> ClusterLock<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// One acquisition attempt. Never retries.
    pub fn try_acquire(&self, lock_id: &str, holder: &NodeId, ttl: Duration) -> LockOutcome {
        let now = self.clock.now();
        let record = ClusterLockRecord::new(lock_id, holder.clone(), now, ttl);
        match self.store.lock_try_insert(&record, now) {
            Ok(true) => {
                debug!(lock_id, holder = %holder, ttl_secs = ttl.as_secs(), "Lock acquired");
                LockOutcome::Acquired(Lock::new(record))
            }
            Ok(false) => {
                debug!(lock_id, holder = %holder, "Lock busy");
                LockOutcome::Busy
            }
            Err(e) => {
                warn!(lock_id, holder = %holder, error = %e, "Lock acquisition indeterminate");
                LockOutcome::Indeterminate(e.to_string())
            }
        }
    }

    /// Release a held lock. Only deletes the row if this holder still owns it.
    pub fn release(&self, lock: Lock<Acquired>) -> ReleaseOutcome {
        let record = lock.release();
        match self
            .store
            .lock_compare_and_delete(&record.lock_id, &record.holder_id)
        {
            Ok(true) => {
                debug!(lock_id = %record.lock_id, holder = %record.holder_id, "Lock released");
                ReleaseOutcome::Released
            }
            Ok(false) => ReleaseOutcome::NotHeld,
            Err(e) => {
                warn!(lock_id = %record.lock_id, error = %e, "Lock release indeterminate");
                ReleaseOutcome::Indeterminate(e.to_string())
            }
        }
    }

    /// Extend a held lock to `now + ttl`.
    ///
    /// # Errors
    /// `LockError::Lost` when the row expired or changed hands,
    /// `LockError::Indeterminate` when the store could not answer.
    pub fn renew(&self, lock: Lock<Acquired>, ttl: Duration) -> EvalResult<Lock<Acquired>> {
        let now = self.clock.now();
        let renewed = lock.renewed(now, ttl);
        match self.store.lock_renew(
            renewed.lock_id(),
            renewed.holder_id(),
            now,
            renewed.expires_at(),
        ) {
            Ok(true) => Ok(renewed),
            Ok(false) => Err(LockError::Lost {
                lock_id: renewed.lock_id().to_string(),
                holder_id: renewed.holder_id().to_string(),
            }
            .into()),
            Err(e) => Err(LockError::Indeterminate {
                lock_id: renewed.lock_id().to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Run `action` only if this holder wins the lock.
    ///
    /// Busy yields `Skipped`; an indeterminate acquisition is an error. The
    /// lock is released whether or not the action succeeds.
    pub fn run_exclusively<T, F>(
        &self,
        lock_id: &str,
        holder: &NodeId,
        ttl: Duration,
        action: F,
    ) -> EvalResult<Execution<T>>
    where
        F: FnOnce(&mut HeldLock<'_, S>) -> EvalResult<T>,
    {
        let lock = match self.try_acquire(lock_id, holder, ttl) {
            LockOutcome::Acquired(lock) => lock,
            LockOutcome::Busy => return Ok(Execution::Skipped),
            LockOutcome::Indeterminate(reason) => {
                return Err(LockError::Indeterminate {
                    lock_id: lock_id.to_string(),
                    reason,
                }
                .into())
            }
        };

        let mut held = HeldLock {
            owner: self,
            lock: Some(lock),
            lock_id: lock_id.to_string(),
            holder: holder.clone(),
            ttl,
        };
        let result = action(&mut held);

        if let Some(lock) = held.lock.take() {
            match self.release(lock) {
                ReleaseOutcome::Released => {}
                ReleaseOutcome::NotHeld => {
                    warn!(lock_id, holder = %holder, "Lock expired before release");
                }
                ReleaseOutcome::Indeterminate(reason) => {
                    // The row expires on its own after the TTL.
                    warn!(lock_id, holder = %holder, reason = %reason, "Lock left in place");
                }
            }
        }

        result.map(Execution::Executed)
    }
}

/// Handle given to a guarded action while its lock is held.
pub struct HeldLock<'a, S: ?Sized> {
    owner: &'a ClusterLock<S>,
    /// `None` once a renewal has failed.
    lock: Option<Lock<Acquired>>,
    lock_id: String,
    holder: NodeId,
    ttl: Duration,
}

impl<S: LockStore + ?Sized> HeldLock<'_, S> {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_some()
    }

    /// Push the expiry out by one TTL from now.
    ///
    /// After a failed renewal the lock is treated as gone and the action
    /// must stop.
    pub fn renew(&mut self) -> EvalResult<()> {
        let Some(lock) = self.lock.take() else {
            return Err(LockError::Lost {
                lock_id: self.lock_id.clone(),
                holder_id: self.holder.to_string(),
            }
            .into());
        };
        let renewed = self.owner.renew(lock, self.ttl)?;
        self.lock = Some(renewed);
        Ok(())
    }
}
