//! Cluster lock typestate
//!
//! A lock can only be renewed or released while it is in the `Acquired`
//! state. The store row is the source of truth; a `Lock<Acquired>` is this
//! node's proof that its compare-and-set insert won.
//!
//! ```text
//! (free) ─── try_acquire() ──→ Acquired ─── release() ──→ (free)
//!                                  │
//!                              renew() ↺
//! ```

use crate::{NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;

/// Lock id used by the periodic reconciliation sweep.
pub const RECONCILE_LOCK_ID: &str = "reconcile";

// ============================================================================
// LOCK RECORD (persisted row, state-independent)
// ============================================================================

/// One row of the shared lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLockRecord {
    pub lock_id: String,
    pub holder_id: NodeId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl ClusterLockRecord {
    /// A record held by `holder_id` from `now` for `ttl`.
    pub fn new(lock_id: impl Into<String>, holder_id: NodeId, now: Timestamp, ttl: Duration) -> Self {
        Self {
            lock_id: lock_id.into(),
            holder_id,
            acquired_at: now,
            expires_at: expiry(now, ttl),
        }
    }

    /// An expired record may be overwritten by any node.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Whether `holder_id` holds this record at `now`.
    pub fn is_held_by(&self, holder_id: &NodeId, now: Timestamp) -> bool {
        self.holder_id == *holder_id && !self.is_expired(now)
    }
}

/// `now + ttl`, saturating at the latest representable instant.
fn expiry(now: Timestamp, ttl: Duration) -> Timestamp {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lock states.
pub trait LockState: private::Sealed + Send + Sync {}

/// Lock is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired;
impl LockState for Acquired {}

/// Lock has been released (documentation only; transitions consume the lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LockState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Acquired {}
    impl Sealed for super::Released {}
}

// ============================================================================
// LOCK TYPESTATE WRAPPER
// ============================================================================

/// A cluster lock with compile-time state tracking.
#[derive(Debug, Clone)]
pub struct Lock<S: LockState> {
    record: ClusterLockRecord,
    _state: PhantomData<S>,
}

impl<S: LockState> Lock<S> {
    pub fn record(&self) -> &ClusterLockRecord {
        &self.record
    }

    pub fn lock_id(&self) -> &str {
        &self.record.lock_id
    }

    pub fn holder_id(&self) -> &NodeId {
        &self.record.holder_id
    }

    pub fn expires_at(&self) -> Timestamp {
        self.record.expires_at
    }
}

impl Lock<Acquired> {
    /// Wrap a record whose insert just won.
    ///
    /// Only the lock store adapter should call this.
    pub fn new(record: ClusterLockRecord) -> Self {
        Lock {
            record,
            _state: PhantomData,
        }
    }

    /// Move the expiry to `now + ttl` after a successful renewal in the store.
    pub fn renewed(mut self, now: Timestamp, ttl: Duration) -> Self {
        self.record.expires_at = expiry(now, ttl);
        self
    }

    /// Consume the lock, returning the record to delete.
    pub fn release(self) -> ClusterLockRecord {
        self.record
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.record.is_expired(now)
    }

    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        self.record.remaining_duration(now)
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of one acquisition attempt.
///
/// `Busy` and `Indeterminate` are deliberately separate: the first is the
/// normal loss of a race, the second means the store could not answer.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(Lock<Acquired>),
    Busy,
    Indeterminate(String),
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }
}

/// Result of one release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The row was gone or belonged to another holder (e.g. after expiry).
    NotHeld,
    Indeterminate(String),
}
