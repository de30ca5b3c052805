//! Wall-clock access used for entity timestamps and lock ages.
//!
//! Components receive a clock handle instead of reading system time
//! directly, so tests can pin time and exercise staleness rules.

use std::sync::Arc;

/// Source of wall-clock milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Shared clock handle passed to components at construction.
pub type SharedClock = Arc<dyn Clock>;

/// System clock backed by chrono.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Returns the system clock as a shared handle.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
pub(crate) mod test_clock {
    use super::Clock;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Manually advanced clock for tests.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        now: AtomicI64,
    }

    impl ManualClock {
        pub fn at(now_ms: i64) -> Self {
            Self {
                now: AtomicI64::new(now_ms),
            }
        }

        pub fn advance(&self, delta_ms: i64) {
            self.now.fetch_add(delta_ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }
    }
}
