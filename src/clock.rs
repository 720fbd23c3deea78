//! A time interface that can be replaced by a fake time implementation
//! during testing.
//!
//! The engine never looks at the wall clock. It asks a [`Clock`] for the
//! monotonic time elapsed since the clock's epoch and does all deadline
//! arithmetic on the resulting [`Duration`] values.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

//------------ Clock ---------------------------------------------------------

/// A source of monotonic time.
pub trait Clock: Debug {
    /// Returns the time elapsed since the clock's epoch.
    fn now(&self) -> Duration;
}

//------------ SystemClock ---------------------------------------------------

/// Implementation of the [Clock] trait using [`Instant`].
#[derive(Clone, Debug)]
pub struct SystemClock {
    /// The moment the clock was created.
    start: Instant,
}

impl SystemClock {
    /// Creates a new system clock with its epoch at the current time.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

//------------ FakeClock -----------------------------------------------------

/// Implementation of the [Clock] trait to fake the passing of time, for
/// example for testing.
///
/// Clones share the same time, so a test can keep one handle and hand
/// another to the channel.
#[derive(Clone, Debug, Default)]
pub struct FakeClock {
    /// The current fake time.
    now: Arc<Mutex<Duration>>,
}

impl FakeClock {
    /// Creates a new fake clock at time zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// Advances the current time by `adjust`.
    pub fn adjust(&self, adjust: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = (*now).checked_add(adjust).unwrap();
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}

//============ Test ==========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fake_clock_shares_time_across_clones() {
        let clock = FakeClock::new();
        let other = clock.clone();
        assert_eq!(clock.now(), Duration::ZERO);
        other.adjust(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(1500));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now();
        assert!(clock.now() >= first);
    }
}
