//! Warping virtual time across idle periods in icount mode.
//!
//! While every vCPU is idle no instructions retire, so icount time would stand still and pending
//! virtual timers would never fire. The warp controller moves `icount_bias` forward instead:
//! immediately in no-sleep mode, or after the matching amount of host time has passed otherwise.

use std::sync::atomic::Ordering;

use cpuloop_sync::assert_bql_held;

use crate::clock::{VmClock, WARP_INACTIVE};
use crate::timer_queue::{ClockTimers, TimerId};

/// What [`VmClock::start_warp_timer`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarpAction {
    /// Nothing to do (vCPUs busy, deterministic test mode, or no virtual timers).
    None,
    /// A virtual timer is already due; the clock's observers should be notified.
    Notify,
    /// No-sleep mode: the bias was advanced straight to the next deadline.
    Advanced { delta_ns: i64 },
    /// Sleep mode: the warp timer is armed on the virtual-RT clock.
    Armed { deadline: i64 },
}

impl VmClock {
    /// Start warping toward the nearest virtual deadline if every vCPU is idle.
    #[track_caller]
    pub fn start_warp_timer(
        &self,
        timers: &mut ClockTimers,
        all_idle: bool,
        deterministic_test: bool,
    ) -> WarpAction {
        if !self.use_icount() || !all_idle || deterministic_test {
            return WarpAction::None;
        }
        assert_bql_held();

        let sleep = self.icount_config.sleep;
        let clock = self.get_clock();
        let Some(deadline) = timers.vm.deadline_ns(self.virtual_ns()) else {
            if !sleep && !self.warned_no_timers.swap(true, Ordering::SeqCst) {
                tracing::warn!("icount sleep disabled and no active timers");
            }
            return WarpAction::None;
        };

        if deadline == 0 {
            return WarpAction::Notify;
        }

        if !sleep {
            // Nothing runs on the virtual clock until the deadline anyway; jump there now. This
            // keeps execution deterministic regardless of host speed.
            self.seq.write(|| {
                self.icount_bias.fetch_add(deadline, Ordering::SeqCst);
            });
            tracing::trace!(delta_ns = deadline, "icount warped without sleeping");
            return WarpAction::Advanced { delta_ns: deadline };
        }

        // Virtual time advances with the virtual-RT clock until the vCPUs wake up. An earlier
        // warp start that is still pending stays in place.
        self.seq.write(|| {
            let start = self.warp_start.load(Ordering::SeqCst);
            if start == WARP_INACTIVE || start > clock {
                self.warp_start.store(clock, Ordering::SeqCst);
            }
        });
        timers
            .vm_rt
            .arm_anticipate(TimerId::ICOUNT_WARP, clock + deadline);
        let deadline = timers
            .vm_rt
            .deadline(TimerId::ICOUNT_WARP)
            .unwrap_or(clock + deadline);
        tracing::trace!(deadline, "icount warp timer armed");
        WarpAction::Armed { deadline }
    }

    /// Apply the pending warp, if any. Returns true if virtual timers are now due.
    ///
    /// Invoked when the warp timer fires and whenever a vCPU is about to resume execution.
    #[track_caller]
    pub fn warp_timer_fired(&self, timers: &ClockTimers, running: bool) -> bool {
        if self.warp_start.load(Ordering::SeqCst) == WARP_INACTIVE {
            return false;
        }
        assert_bql_held();

        let applied = self.seq.write(|| {
            let mut applied = None;
            if running {
                let clock = self.clock_locked();
                let mut warp_delta = clock - self.warp_start.load(Ordering::SeqCst);
                if self.icount_config.is_adaptive() {
                    // The guest may have run ahead of real time since the warp started; warp
                    // only up to real time so the virtual clock does not overshoot.
                    let behind = (clock - self.icount_locked()).max(0);
                    warp_delta = warp_delta.min(behind);
                }
                self.icount_bias.fetch_add(warp_delta, Ordering::SeqCst);
                applied = Some(warp_delta);
            }
            self.warp_start.store(WARP_INACTIVE, Ordering::SeqCst);
            applied
        });

        if let Some(delta_ns) = applied {
            tracing::trace!(delta_ns, "icount warp applied");
        }
        timers.vm.expired(self.virtual_ns())
    }

    /// Called by a vCPU before it resumes execution: the warp timer is no longer needed since
    /// instructions will advance the clock again.
    pub fn account_warp_timer(&self, timers: &mut ClockTimers, running: bool) -> bool {
        if !self.use_icount() || !self.icount_config.sleep || !running {
            return false;
        }
        timers.vm_rt.cancel(TimerId::ICOUNT_WARP);
        self.warp_timer_fired(timers, running)
    }

    /// Advance virtual time to `dest` for an external test harness, firing every virtual timer
    /// on the way in deadline order.
    ///
    /// `run_timer` is invoked for each expired timer and may re-arm timers.
    #[track_caller]
    pub fn clock_warp_to(
        &self,
        dest: i64,
        timers: &mut ClockTimers,
        mut run_timer: impl FnMut(&mut ClockTimers, TimerId),
    ) {
        while let Some(due) = self.clock_warp_step(dest, timers) {
            for id in due {
                run_timer(timers, id);
            }
        }
    }

    /// One step of [`VmClock::clock_warp_to`]: move virtual time to the nearer of `dest` and the
    /// next virtual deadline, and hand back the timers that expired there.
    ///
    /// Returns `None` once virtual time has reached `dest`. Callers run the returned timers before
    /// the next step so that re-arms land in the right place.
    #[track_caller]
    pub fn clock_warp_step(&self, dest: i64, timers: &mut ClockTimers) -> Option<Vec<TimerId>> {
        assert!(self.use_icount(), "clock warp requires icount mode");
        assert_bql_held();

        let clock = self.virtual_ns();
        if clock >= dest {
            return None;
        }
        let mut warp = dest - clock;
        if let Some(deadline) = timers.vm.deadline_ns(clock) {
            warp = warp.min(deadline);
        }
        self.seq.write(|| {
            self.icount_bias.fetch_add(warp, Ordering::SeqCst);
        });
        Some(timers.vm.take_expired(self.virtual_ns()))
    }
}
