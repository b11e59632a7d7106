//! Time source abstraction.
//!
//! Every limiter reads time through an injectable [`Clock`] so that tests
//! (and callers replaying traffic) control the timeline. Remote backends
//! receive the client's notion of "now" as a script argument, so the same
//! clock governs local and remote decisions.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64 {
        unix_millis(self.now())
    }
}

/// Milliseconds since the Unix epoch for `t`, saturating at zero for
/// pre-epoch times.
pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// The default clock, backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
///
/// Intended for tests and deterministic replays: construct it at a fixed
/// point, then [`advance`](ManualClock::advance) it between verdicts.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    /// A manual clock starting at the Unix epoch.
    pub fn new() -> Self {
        Self::starting_at(UNIX_EPOCH)
    }

    /// A manual clock starting at `start`.
    pub fn starting_at(start: SystemTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += delta;
    }

    /// Set the clock to an absolute time. Times in the past are accepted;
    /// the limiters themselves clamp negative elapsed spans to zero.
    pub fn set(&self, at: SystemTime) {
        *self.now.lock().expect("clock lock poisoned") = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock poisoned")
    }
}
