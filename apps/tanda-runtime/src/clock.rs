use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of `now` for expiry, lockout and ledger timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn system() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    step: std::sync::Mutex<chrono::Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(initial: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: std::sync::Mutex::new(initial),
            step: std::sync::Mutex::new(chrono::Duration::zero()),
        })
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    /// Moves time forward by `step` after every read.
    pub fn tick_on_read(&self, step: chrono::Duration) {
        if let Ok(mut current) = self.step.lock() {
            *current = step;
        }
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let step = self
            .step
            .lock()
            .map(|step| *step)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.now
            .lock()
            .map(|mut now| {
                let read = *now;
                *now += step;
                read
            })
            .unwrap_or_else(|_| Utc::now())
    }
}
