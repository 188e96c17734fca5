//! The sequenced clock state shared by every vCPU thread and the control thread.
//!
//! Virtual time comes from one of two sources:
//! - ticks mode: host time with the intervals the VM was stopped removed
//!   (`clock_offset`/`ticks_offset` absorb the gaps on every enable/disable);
//! - icount mode: `icount_bias + (icount << icount_time_shift)`.
//!
//! Multi-field reads go through a [`SeqCount`] so readers never observe a half-applied update.
//! Writes additionally require the global execution lock, which guarantees a single writer.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use cpuloop_sync::{assert_bql_held, yield_point, SeqCount};

use crate::host::HostClock;
use crate::icount::IcountConfig;
use crate::timer_queue::ClockType;

/// `warp_start` value meaning "no warp in flight".
pub const WARP_INACTIVE: i64 = -1;

pub struct VmClock {
    pub(crate) host: Arc<dyn HostClock>,
    pub(crate) icount_config: IcountConfig,
    pub(crate) seq: SeqCount,

    // Written only with the global execution lock held.
    pub(crate) ticks_prev: AtomicI64,
    pub(crate) ticks_offset: AtomicI64,

    pub(crate) clock_offset: AtomicI64,
    pub(crate) ticks_enabled: AtomicBool,

    /// Compensates for varying guest execution speed.
    pub(crate) icount_bias: AtomicI64,
    /// Aggregate executed-instruction count, advanced by vCPU threads without the lock.
    pub(crate) icount: AtomicI64,
    pub(crate) time_shift: AtomicU32,
    pub(crate) warp_start: AtomicI64,

    /// Previous `icount - wallclock` sample seen by the adaptive shift tuner.
    pub(crate) last_delta: AtomicI64,
    pub(crate) warned_no_timers: AtomicBool,

    /// Extremes of `guest - host` seen while aligning; only sampled with `align=on`.
    pub(crate) max_delay: AtomicI64,
    pub(crate) max_advance: AtomicI64,
}

impl VmClock {
    /// Ticks start out disabled; the run-state layer enables them when the VM starts.
    pub fn new(host: Arc<dyn HostClock>, icount_config: IcountConfig) -> Self {
        Self {
            host,
            seq: SeqCount::new(),
            ticks_prev: AtomicI64::new(0),
            ticks_offset: AtomicI64::new(0),
            clock_offset: AtomicI64::new(0),
            ticks_enabled: AtomicBool::new(false),
            icount_bias: AtomicI64::new(0),
            icount: AtomicI64::new(0),
            time_shift: AtomicU32::new(icount_config.initial_shift()),
            warp_start: AtomicI64::new(WARP_INACTIVE),
            last_delta: AtomicI64::new(0),
            warned_no_timers: AtomicBool::new(false),
            max_delay: AtomicI64::new(0),
            max_advance: AtomicI64::new(0),
            icount_config,
        }
    }

    pub fn host(&self) -> &Arc<dyn HostClock> {
        &self.host
    }

    pub fn icount_config(&self) -> &IcountConfig {
        &self.icount_config
    }

    pub fn use_icount(&self) -> bool {
        self.icount_config.enabled()
    }

    pub fn ticks_enabled(&self) -> bool {
        self.ticks_enabled.load(Ordering::SeqCst)
    }

    /// Guest ticks elapsed while the VM was running.
    ///
    /// In ticks mode the value is clamped against the previous reading, so a host counter that
    /// jumps backwards is folded into `ticks_offset` rather than exposed.
    #[track_caller]
    pub fn get_ticks(&self) -> i64 {
        assert_bql_held();
        if self.use_icount() {
            return self.get_icount();
        }

        let mut ticks = self.ticks_offset.load(Ordering::SeqCst);
        if self.ticks_enabled.load(Ordering::SeqCst) {
            ticks = ticks.wrapping_add(self.host.ticks());
        }

        let prev = self.ticks_prev.load(Ordering::SeqCst);
        if prev > ticks {
            tracing::debug!(
                prev,
                ticks,
                "host tick counter went backwards; absorbing into offset"
            );
            self.ticks_offset.fetch_add(prev - ticks, Ordering::SeqCst);
            ticks = prev;
        }

        self.ticks_prev.store(ticks, Ordering::SeqCst);
        ticks
    }

    pub(crate) fn clock_locked(&self) -> i64 {
        let mut time = self.clock_offset.load(Ordering::SeqCst);
        if self.ticks_enabled.load(Ordering::SeqCst) {
            time = time.wrapping_add(self.host.now_ns());
        }
        time
    }

    /// Monotonic nanoseconds the VM has spent running.
    pub fn get_clock(&self) -> i64 {
        self.seq.read(|| self.clock_locked())
    }

    /// Resume the tick clock. The observed clock value is continuous across the toggle.
    #[track_caller]
    pub fn enable_ticks(&self) {
        assert_bql_held();
        self.seq.write(|| {
            if !self.ticks_enabled.load(Ordering::SeqCst) {
                self.ticks_offset
                    .fetch_sub(self.host.ticks(), Ordering::SeqCst);
                yield_point();
                self.clock_offset
                    .fetch_sub(self.host.now_ns(), Ordering::SeqCst);
                self.ticks_enabled.store(true, Ordering::SeqCst);
            }
        });
    }

    /// Freeze the tick clock at its current value.
    #[track_caller]
    pub fn disable_ticks(&self) {
        assert_bql_held();
        self.seq.write(|| {
            if self.ticks_enabled.load(Ordering::SeqCst) {
                self.ticks_offset
                    .fetch_add(self.host.ticks(), Ordering::SeqCst);
                yield_point();
                let clock = self.clock_locked();
                self.clock_offset.store(clock, Ordering::SeqCst);
                self.ticks_enabled.store(false, Ordering::SeqCst);
            }
        });
    }

    pub fn get_icount_raw(&self) -> i64 {
        self.icount.load(Ordering::SeqCst)
    }

    pub(crate) fn icount_locked(&self) -> i64 {
        let bias = self.icount_bias.load(Ordering::SeqCst);
        bias.wrapping_add(self.icount_to_ns(self.get_icount_raw()))
    }

    /// Virtual time derived from the instruction counter.
    pub fn get_icount(&self) -> i64 {
        self.seq.read(|| self.icount_locked())
    }

    pub fn icount_to_ns(&self, icount: i64) -> i64 {
        icount << self.time_shift()
    }

    pub fn time_shift(&self) -> u32 {
        self.time_shift.load(Ordering::SeqCst)
    }

    pub fn icount_bias(&self) -> i64 {
        self.seq.read(|| self.icount_bias.load(Ordering::SeqCst))
    }

    /// `(icount_bias, icount)` as published together.
    pub fn bias_and_icount(&self) -> (i64, i64) {
        self.seq.read(|| {
            (
                self.icount_bias.load(Ordering::SeqCst),
                self.icount.load(Ordering::SeqCst),
            )
        })
    }

    /// Fold instructions retired by a vCPU into the aggregate counter.
    pub fn account_executed(&self, executed: i64) {
        self.icount.fetch_add(executed, Ordering::SeqCst);
    }

    /// Current warp start on the virtual-RT clock, or [`WARP_INACTIVE`].
    pub fn warp_start(&self) -> i64 {
        self.seq.read(|| self.warp_start.load(Ordering::SeqCst))
    }

    /// Guest virtual time (`ClockType::Virtual`).
    pub fn virtual_ns(&self) -> i64 {
        if self.use_icount() {
            self.get_icount()
        } else {
            self.get_clock()
        }
    }

    pub fn now(&self, clock: ClockType) -> i64 {
        match clock {
            ClockType::Realtime => self.host.now_ns(),
            ClockType::Virtual => self.virtual_ns(),
            ClockType::VirtualRt => self.get_clock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Duration;

    use cpuloop_sync::Bql;
    use proptest::prelude::*;

    use crate::host::FakeHostClock;

    fn ticks_clock() -> (Arc<FakeHostClock>, VmClock) {
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host.clone(), IcountConfig::default());
        (host, clock)
    }

    #[test]
    fn clock_is_frozen_while_ticks_are_disabled() {
        let bql = Bql::new(());
        let (host, clock) = ticks_clock();
        let _guard = bql.lock();

        host.advance(Duration::from_millis(5));
        assert_eq!(clock.get_clock(), 0);

        clock.enable_ticks();
        host.advance(Duration::from_millis(3));
        assert_eq!(clock.get_clock(), 3_000_000);

        clock.disable_ticks();
        host.advance(Duration::from_millis(100));
        assert_eq!(clock.get_clock(), 3_000_000);

        clock.enable_ticks();
        host.advance(Duration::from_millis(1));
        assert_eq!(clock.get_clock(), 4_000_000);
    }

    #[test]
    fn toggling_ticks_is_idempotent() {
        let bql = Bql::new(());
        let (host, clock) = ticks_clock();
        let _guard = bql.lock();

        clock.enable_ticks();
        host.advance_ns(10);
        clock.enable_ticks();
        assert_eq!(clock.get_ticks(), 10);
        clock.disable_ticks();
        clock.disable_ticks();
        host.advance_ns(10);
        assert_eq!(clock.get_ticks(), 10);
    }

    #[test]
    fn backwards_host_ticks_are_absorbed() {
        let bql = Bql::new(());
        let (host, clock) = ticks_clock();
        let _guard = bql.lock();

        clock.enable_ticks();
        host.advance_ns(1_000);
        assert_eq!(clock.get_ticks(), 1_000);

        // Host suspend/resume rewinds the cycle counter.
        host.set_ticks(200);
        assert_eq!(clock.get_ticks(), 1_000);

        host.set_ticks(250);
        assert_eq!(clock.get_ticks(), 1_050);
    }

    #[test]
    #[should_panic(expected = "global execution lock")]
    fn get_ticks_requires_lock() {
        let (_host, clock) = ticks_clock();
        clock.get_ticks();
    }

    #[test]
    fn icount_time_is_bias_plus_shifted_count() {
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host, IcountConfig::fixed(2));
        clock.account_executed(100);
        assert_eq!(clock.get_icount_raw(), 100);
        assert_eq!(clock.get_icount(), 400);
        assert_eq!(clock.virtual_ns(), 400);
        assert_eq!(clock.now(ClockType::Virtual), 400);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        // The writer publishes bias and icount as a pair (bias == -icount); with yield points
        // enabled it yields between the two stores, so a reader that ignored the sequence
        // counter would see mismatched pairs.
        #[test]
        fn bias_and_icount_are_never_torn(readers in 1usize..4, writes in 100i64..2_000) {
            let clock = Arc::new(VmClock::new(
                Arc::new(FakeHostClock::new()),
                IcountConfig::fixed(0),
            ));
            let done = Arc::new(AtomicBool::new(false));

            let writer = {
                let clock = clock.clone();
                let done = done.clone();
                thread::spawn(move || {
                    for k in 1..=writes {
                        clock.seq.write(|| {
                            clock.icount_bias.store(-k, Ordering::SeqCst);
                            yield_point();
                            clock.icount.store(k, Ordering::SeqCst);
                        });
                    }
                    done.store(true, Ordering::SeqCst);
                })
            };

            let handles: Vec<_> = (0..readers)
                .map(|_| {
                    let clock = clock.clone();
                    let done = done.clone();
                    thread::spawn(move || {
                        let mut torn = 0u32;
                        while !done.load(Ordering::SeqCst) {
                            let (bias, icount) = clock.bias_and_icount();
                            if bias != -icount {
                                torn += 1;
                            }
                            // icount time at shift 0 is bias + icount.
                            if clock.get_icount() != 0 {
                                torn += 1;
                            }
                        }
                        torn
                    })
                })
                .collect();

            writer.join().unwrap();
            for handle in handles {
                prop_assert_eq!(handle.join().unwrap(), 0);
            }
        }
    }
}
