//! Clock seam so timeout and eviction logic is testable at exact instants.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn unix_micros(&self) -> i64;

    fn unix_seconds(&self) -> i64 {
        self.unix_micros() / 1_000_000
    }

    /// Network-adjusted wall clock. The system clock offers no adjustment;
    /// tests may skew it independently.
    fn adjusted_seconds(&self) -> i64 {
        self.unix_seconds()
    }
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_micros() as i64)
            .unwrap_or(0)
    }
}

/// Settable clock for tests.
#[derive(Default)]
pub struct MockClock {
    micros: AtomicI64,
}

impl MockClock {
    pub fn new(seconds: i64) -> Self {
        Self {
            micros: AtomicI64::new(seconds * 1_000_000),
        }
    }

    pub fn set_seconds(&self, seconds: i64) {
        self.micros.store(seconds * 1_000_000, Ordering::Relaxed);
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.micros.fetch_add(seconds * 1_000_000, Ordering::Relaxed);
    }

    pub fn advance_micros(&self, micros: i64) {
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }
}

impl Clock for MockClock {
    fn unix_micros(&self) -> i64 {
        self.micros.load(Ordering::Relaxed)
    }
}

/// Next send instant for periodic broadcasts, exponentially distributed
/// around the average interval so peers cannot predict the schedule.
pub fn poisson_next_send(now_micros: i64, average_interval_seconds: i64) -> i64 {
    let uniform: f64 = rand::random::<f64>().max(1e-12);
    let delay = -uniform.ln() * average_interval_seconds as f64 * 1_000_000.0;
    now_micros + delay as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances() {
        let clock = MockClock::new(100);
        assert_eq!(clock.unix_seconds(), 100);
        clock.advance_seconds(5);
        assert_eq!(clock.unix_seconds(), 105);
        clock.advance_micros(500_000);
        assert_eq!(clock.unix_micros(), 105_500_000);
    }

    #[test]
    fn poisson_is_in_the_future() {
        for _ in 0..32 {
            assert!(poisson_next_send(1_000_000, 30) > 1_000_000);
        }
    }
}
