use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Monotonic + wall time, injectable so tests can control the passage of
/// time instead of sleeping for real.
pub trait Clock: Send + Sync + 'static {
    fn now_wall(&self) -> DateTime<Utc>;
    fn now_mono(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_mono(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only advances when told to, for deterministic tests of
/// the rate limiter, retry controller and quota rollover.
#[cfg(any(test, feature = "test-util"))]
pub mod test_clock {
    use super::{Clock, DateTime, Duration, Instant, Utc};
    use std::sync::Mutex;

    pub struct TestClock {
        wall: Mutex<DateTime<Utc>>,
        mono: Mutex<Instant>,
    }

    impl TestClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                wall: Mutex::new(start),
                mono: Mutex::new(Instant::now()),
            }
        }

        pub fn advance(&self, by: Duration) {
            let mut wall = self.wall.lock().unwrap();
            *wall += by;
            let mut mono = self.mono.lock().unwrap();
            *mono += by.to_std().unwrap_or_default();
        }
    }

    impl Clock for TestClock {
        fn now_wall(&self) -> DateTime<Utc> {
            *self.wall.lock().unwrap()
        }

        fn now_mono(&self) -> Instant {
            *self.mono.lock().unwrap()
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use test_clock::TestClock;
