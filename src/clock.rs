//! Injectable wall-clock time.
//!
//! The timer gates of the client operate on wall-clock timestamps that are
//! persisted between invocations. To keep them testable, everything that
//! needs to know the current time receives it through the [`Clock`] trait
//! rather than asking the system directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;


//------------ Clock ---------------------------------------------------------

/// A source of the current time in seconds since the Unix epoch.
pub trait Clock {
    fn now(&self) -> u64;
}


//------------ SystemClock ---------------------------------------------------

/// The real wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0)
    }
}


//------------ ManualClock ---------------------------------------------------

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Creates a new clock showing the given time.
    pub fn new(now: u64) -> Self {
        ManualClock(AtomicU64::new(now))
    }

    /// Sets the clock to the given time.
    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::Relaxed)
    }

    /// Advances the clock by the given number of seconds.
    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
