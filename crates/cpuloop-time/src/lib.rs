//! Virtual time for the vCPU scheduler.
//!
//! Guest virtual time is either host time with the stopped intervals removed, or (icount mode)
//! derived from the number of executed guest instructions. Everything here is driven by an
//! injectable [`HostClock`], so unit tests can run the clock deterministically with
//! [`FakeHostClock`].

mod clock;
mod host;
mod icount;
mod snapshot;
mod timer_queue;
mod warp;

pub use clock::{VmClock, WARP_INACTIVE};
pub use host::{FakeHostClock, HostClock, StdHostClock, NANOSECONDS_PER_SECOND};
pub use icount::{
    next_shift, DriftInfo, IcountConfig, IcountConfigError, IcountMode, ADAPTIVE_INITIAL_SHIFT,
    ALIGN_MAX_ADVANCE_NS, ICOUNT_RT_ADJUST_PERIOD_NS, ICOUNT_VM_ADJUST_PERIOD_NS,
    ICOUNT_WOBBLE_NS, MAX_ICOUNT_SHIFT, MAX_SLICE_DEADLINE_NS,
};
pub use snapshot::{
    AdjustTimersSnapshot, IcountSnapshot, SnapshotError, TimersSnapshot, WarpTimerSnapshot,
    TIMERS_SNAPSHOT_MAGIC, TIMERS_SNAPSHOT_VERSION,
};
pub use timer_queue::{ClockTimers, ClockType, TimerId, TimerQueue};
pub use warp::WarpAction;
