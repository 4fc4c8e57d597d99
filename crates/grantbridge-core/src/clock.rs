//! Time source used for cooldowns, cache expiry and rate windows.

use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use crate::UtcDateTime;

/// Wall-clock abstraction. Every expiry and cooldown computation goes through it.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> UtcDateTime;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UtcDateTime {
        UtcDateTime::now()
    }
}

/// Manually advanced clock for deterministic tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<UtcDateTime>,
}

impl ManualClock {
    pub fn new(start: UtcDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().expect("manual clock lock is not poisoned");
        *now = now.saturating_add(duration);
    }

    pub fn set(&self, value: UtcDateTime) {
        let mut now = self.now.lock().expect("manual clock lock is not poisoned");
        *now = value;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(UtcDateTime::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UtcDateTime {
        *self.now.lock().expect("manual clock lock is not poisoned")
    }
}
