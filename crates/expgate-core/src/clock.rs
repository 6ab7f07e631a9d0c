use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond wall clock. Lifecycle decisions take `now` through this trait
/// so tests can pin time instead of sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|v| v.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Settable clock for tests.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicU64,
}

impl FixedClock {
    pub fn new(initial: u64) -> Self {
        Self {
            now: AtomicU64::new(initial),
        }
    }

    pub fn set(&self, value: u64) {
        self.now.store(value, Ordering::Relaxed);
    }

    pub fn advance(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}
