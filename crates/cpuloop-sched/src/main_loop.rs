//! The control thread's side: timer dispatch, clock notifications and deferred stops.

use std::time::Duration;

use cpuloop_time::{ClockType, TimerId, WarpAction};

use crate::error::Result;
use crate::scheduler::{SchedGuard, Scheduler};
use crate::vcpu;

const CLOCK_ORDER: [ClockType; 3] = [ClockType::Realtime, ClockType::VirtualRt, ClockType::Virtual];

impl Scheduler {
    /// Wake the main loop out of [`Scheduler::main_loop_wait`].
    pub fn notify_main(&self, guard: &mut SchedGuard<'_>) {
        guard.main_notified = true;
        self.main_cond.notify_all();
    }

    /// Arm timer `id` on `clock` and make sure whoever computes deadlines for that clock notices.
    pub fn timer_mod(
        &self,
        guard: &mut SchedGuard<'_>,
        clock: ClockType,
        id: TimerId,
        deadline: i64,
    ) {
        guard.timers.queue_mut(clock).arm(id, deadline);
        if clock == ClockType::Virtual {
            self.start_warp_timer(guard);
        }
        self.notify_clock(guard, clock);
    }

    pub fn timer_del(&self, guard: &mut SchedGuard<'_>, clock: ClockType, id: TimerId) {
        guard.timers.queue_mut(clock).cancel(id);
    }

    /// A deadline on `clock` changed.
    ///
    /// In icount mode the virtual clock's deadline bounds the vCPU instruction budget, so a vCPU
    /// has to leave its slice and recompute it. Every other clock is watched by the main loop.
    pub fn notify_clock(&self, guard: &mut SchedGuard<'_>, clock: ClockType) {
        if !self.clock().use_icount() || clock != ClockType::Virtual {
            self.notify_main(guard);
            return;
        }

        if vcpu::in_vcpu_thread() {
            vcpu::kick_self();
        } else if let Some(&first) = guard.cpus.keys().next() {
            if let Err(err) = self.async_run_on_cpu(guard, first, |_, _, _| {}) {
                tracing::debug!(cpu = first, error = %err, "failed to kick vCPU for new deadline");
            }
        }
    }

    /// Start warping virtual time if the VM is running and every vCPU is idle.
    pub fn start_warp_timer(&self, guard: &mut SchedGuard<'_>) {
        if !self.clock().use_icount() || !guard.is_running() {
            return;
        }
        let all_idle = self.all_cpu_threads_idle(guard);
        let action = self.clock().start_warp_timer(
            &mut guard.timers,
            all_idle,
            self.config().deterministic_test,
        );
        match action {
            WarpAction::None | WarpAction::Armed { .. } => {}
            WarpAction::Notify | WarpAction::Advanced { .. } => self.notify_main(guard),
        }
    }

    /// Advance virtual time to `dest` for a deterministic test harness, running every virtual
    /// timer that comes due along the way.
    pub fn clock_warp(
        &self,
        guard: &mut SchedGuard<'_>,
        dest: i64,
        mut on_timer: impl FnMut(&mut SchedGuard<'_>, ClockType, TimerId),
    ) {
        // Each batch runs before the next step, so timers re-armed by `on_timer` fire within
        // this warp at their own deadline.
        while let Some(due) = self.clock().clock_warp_step(dest, &mut guard.timers) {
            for id in due {
                self.dispatch_timer(guard, ClockType::Virtual, id, &mut on_timer);
            }
        }
    }

    /// Fire every expired timer. Internal timers are handled here; the rest go to `on_timer`.
    pub fn run_timers(
        &self,
        guard: &mut SchedGuard<'_>,
        mut on_timer: impl FnMut(&mut SchedGuard<'_>, ClockType, TimerId),
    ) {
        for clock in CLOCK_ORDER {
            let now = self.clock().now(clock);
            let expired = guard.timers.queue_mut(clock).take_expired(now);
            for id in expired {
                self.dispatch_timer(guard, clock, id, &mut on_timer);
            }
        }
    }

    fn dispatch_timer(
        &self,
        guard: &mut SchedGuard<'_>,
        clock: ClockType,
        id: TimerId,
        on_timer: &mut impl FnMut(&mut SchedGuard<'_>, ClockType, TimerId),
    ) {
        let running = guard.is_running();
        match id {
            TimerId::THROTTLE => self.throttle_tick(guard),
            TimerId::ICOUNT_WARP => {
                if self.clock().warp_timer_fired(&guard.timers, running) {
                    self.notify_main(guard);
                }
            }
            TimerId::ICOUNT_RT => self.clock().adjust_rt_timer_fired(&mut guard.timers, running),
            TimerId::ICOUNT_VM => self.clock().adjust_vm_timer_fired(&mut guard.timers, running),
            _ => {
                tracing::trace!(?clock, timer = id.0, "timer expired");
                on_timer(guard, clock, id);
            }
        }
    }

    /// Host nanoseconds until the nearest timer the main loop has to run.
    ///
    /// In icount mode the virtual clock only moves when vCPUs execute, so its deadlines are left
    /// to the vCPUs and the warp controller.
    pub fn main_loop_deadline_ns(&self, guard: &SchedGuard<'_>) -> Option<i64> {
        CLOCK_ORDER
            .into_iter()
            .filter(|&clock| !(clock == ClockType::Virtual && self.clock().use_icount()))
            .filter_map(|clock| {
                guard
                    .timers
                    .queue(clock)
                    .deadline_ns(self.clock().now(clock))
            })
            .min()
    }

    /// One main loop iteration: act on a stop requested by a vCPU, start warping if idle, wait for
    /// a notification or the nearest deadline (at most `timeout`), then run expired timers.
    pub fn main_loop_wait(
        &self,
        guard: &mut SchedGuard<'_>,
        timeout: Duration,
        on_timer: impl FnMut(&mut SchedGuard<'_>, ClockType, TimerId),
    ) -> Result<()> {
        if let Some(state) = guard.vmstop_request.take() {
            self.vm_stop(guard, state)?;
        }
        self.start_warp_timer(guard);

        let wait = match self.main_loop_deadline_ns(guard) {
            Some(ns) => timeout.min(Duration::from_nanos(ns as u64)),
            None => timeout,
        };
        if !guard.main_notified && !wait.is_zero() {
            guard.wait_for(&self.main_cond, wait);
        }
        guard.main_notified = false;

        self.run_timers(guard, on_timer);
        Ok(())
    }
}
