use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const NANOSECONDS_PER_SECOND: i64 = 1_000_000_000;

/// Source of host time.
///
/// Production uses [`StdHostClock`]; tests drive the virtual clock deterministically through
/// [`FakeHostClock`].
pub trait HostClock: Send + Sync {
    /// Monotonic host time in nanoseconds.
    fn now_ns(&self) -> i64;

    /// Host cycle-counter reading backing the tick clock when icount is off.
    ///
    /// Unlike [`HostClock::now_ns`] this is allowed to jump backwards (e.g. across a host
    /// suspend/resume); the tick clock absorbs such jumps.
    fn ticks(&self) -> i64;

    /// Block the calling thread for `duration` of host time.
    fn sleep(&self, duration: Duration);
}

#[derive(Debug)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    fn ticks(&self) -> i64 {
        self.now_ns()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually advanced host clock. `sleep` advances time instead of blocking and records the
/// requested duration.
#[derive(Debug, Default)]
pub struct FakeHostClock {
    now_ns: AtomicI64,
    ticks: AtomicI64,
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeHostClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.advance_ns(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX));
    }

    pub fn advance_ns(&self, ns: i64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
        self.ticks.fetch_add(ns, Ordering::SeqCst);
    }

    /// Move the cycle counter to an arbitrary value, including backwards.
    pub fn set_ticks(&self, ticks: i64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    /// Durations passed to [`HostClock::sleep`] so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> i64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn ticks(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
    }
}
