//! Time source

use crate::Timestamp;
use chrono::Utc;

/// Source of "now" for every time-dependent decision.
///
/// Derivation and scheduling never read the system clock directly so tests
/// can drive them with a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}
