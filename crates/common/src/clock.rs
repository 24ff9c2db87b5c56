//! Injectable time source.

use std::sync::Arc;
use std::time::SystemTime;

/// Source of "now" for freshness and TTL comparisons.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Convenience for the common case.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
