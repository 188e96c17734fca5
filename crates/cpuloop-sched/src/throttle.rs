//! Duty-cycle throttling of guest execution.
//!
//! Every period, each vCPU gets a job that sleeps for the throttled share of the period with the
//! global lock released. The period grows with the percentage so the ratio of sleep to run time
//! stays `pct / (100 - pct)`.

use std::sync::atomic::Ordering;
use std::time::Duration;

use cpuloop_time::TimerId;

use crate::scheduler::{SchedGuard, Scheduler};
use crate::CpuIndex;

pub const CPU_THROTTLE_PCT_MIN: u32 = 1;
pub const CPU_THROTTLE_PCT_MAX: u32 = 99;
pub const CPU_THROTTLE_TIMESLICE_NS: i64 = 10_000_000;

/// Host time each vCPU sleeps per period at `pct` percent.
pub fn throttle_sleep_ns(pct: u32) -> i64 {
    let pct = i64::from(pct);
    CPU_THROTTLE_TIMESLICE_NS * pct / (100 - pct)
}

/// Length of one throttle period at `pct` percent: `timeslice / (1 - pct/100)`.
pub fn throttle_period_ns(pct: u32) -> i64 {
    CPU_THROTTLE_TIMESLICE_NS * 100 / (100 - i64::from(pct))
}

impl Scheduler {
    /// Throttle guest execution to `100 - pct` percent of host time. `pct` is clamped to
    /// `[CPU_THROTTLE_PCT_MIN, CPU_THROTTLE_PCT_MAX]`.
    pub fn throttle_set(&self, guard: &mut SchedGuard<'_>, pct: i64) {
        let pct = pct.clamp(
            i64::from(CPU_THROTTLE_PCT_MIN),
            i64::from(CPU_THROTTLE_PCT_MAX),
        ) as u32;
        self.throttle_percentage.store(pct, Ordering::SeqCst);

        let deadline = self.clock().get_clock() + CPU_THROTTLE_TIMESLICE_NS;
        guard.timers.vm_rt.arm(TimerId::THROTTLE, deadline);
        tracing::info!(pct, "CPU throttle set");
    }

    /// Disable throttling. The next tick finds it disabled and does not rearm.
    pub fn throttle_stop(&self) {
        self.throttle_percentage.store(0, Ordering::SeqCst);
        tracing::info!("CPU throttle stopped");
    }

    pub fn throttle_active(&self) -> bool {
        self.throttle_get_percentage() > 0
    }

    pub fn throttle_get_percentage(&self) -> u32 {
        self.throttle_percentage.load(Ordering::SeqCst)
    }

    /// Periodic throttle timer.
    pub(crate) fn throttle_tick(&self, guard: &mut SchedGuard<'_>) {
        let pct = self.throttle_get_percentage();
        if pct == 0 {
            return;
        }

        for index in guard.cpu_indices() {
            let Some(flags) = guard.flags_mut(index) else {
                continue;
            };
            if flags.throttle_scheduled {
                continue;
            }
            flags.throttle_scheduled = true;
            if let Err(err) = self.async_run_on_cpu(guard, index, throttle_job) {
                tracing::debug!(cpu = index, error = %err, "failed to queue throttle job");
            }
        }

        let deadline = self.clock().get_clock() + throttle_period_ns(pct);
        guard.timers.vm_rt.arm(TimerId::THROTTLE, deadline);
    }
}

fn throttle_job(sched: &Scheduler, guard: &mut SchedGuard<'_>, index: CpuIndex) {
    let pct = sched.throttle_get_percentage();
    if pct > 0 {
        let sleep = Duration::from_nanos(throttle_sleep_ns(pct) as u64);
        tracing::trace!(cpu = index, ?sleep, "throttling vCPU");
        let host = sched.clock().host().clone();
        guard.unlocked(|| host.sleep(sleep));
    }
    if let Some(flags) = guard.flags_mut(index) {
        flags.throttle_scheduled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use cpuloop_time::{ClockType, FakeHostClock};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::accel::{DummyAccel, DummyMode};
    use crate::scheduler::tests::dummy_sched;
    use crate::scheduler::SchedConfig;

    #[test]
    fn sleep_and_period_follow_the_duty_cycle() {
        assert_eq!(throttle_sleep_ns(50), CPU_THROTTLE_TIMESLICE_NS);
        assert_eq!(throttle_period_ns(50), 2 * CPU_THROTTLE_TIMESLICE_NS);
        assert_eq!(throttle_sleep_ns(1), 101_010);
        assert_eq!(throttle_sleep_ns(99), 99 * CPU_THROTTLE_TIMESLICE_NS);
        assert_eq!(throttle_period_ns(99), 100 * CPU_THROTTLE_TIMESLICE_NS);
    }

    #[test]
    fn stop_disables_throttle() {
        let sched = dummy_sched(DummyMode::Idle);
        let mut guard = sched.lock();
        sched.throttle_set(&mut guard, 30);
        assert!(sched.throttle_active());
        sched.throttle_stop();
        assert!(!sched.throttle_active());
        assert_eq!(sched.throttle_get_percentage(), 0);
    }

    #[test]
    fn disabled_tick_does_not_rearm() {
        let sched = dummy_sched(DummyMode::Idle);
        let mut guard = sched.lock();
        sched.throttle_set(&mut guard, 20);
        guard.timers.vm_rt.cancel(TimerId::THROTTLE);
        sched.throttle_stop();
        sched.throttle_tick(&mut guard);
        assert!(!guard.timers().vm_rt.is_armed(TimerId::THROTTLE));
    }

    #[test]
    fn tick_schedules_each_vcpu_once_per_period() {
        let host = Arc::new(FakeHostClock::new());
        let sched = Scheduler::new(
            SchedConfig::default(),
            Arc::new(DummyAccel::new(DummyMode::Busy)),
            host.clone(),
        );
        let mut guard = sched.lock();
        for _ in 0..2 {
            sched.create_vcpu(&mut guard).unwrap();
        }
        // The vCPU threads cannot drain their queues while this thread holds the lock.
        sched.throttle_set(&mut guard, 50);
        sched.throttle_tick(&mut guard);
        sched.throttle_tick(&mut guard);
        for index in guard.cpu_indices() {
            assert_eq!(guard.cpus[&index].work.len(), 1);
            assert!(guard.cpu_flags(index).unwrap().throttle_scheduled);
        }
        let now = sched.clock().now(ClockType::VirtualRt);
        assert_eq!(
            guard.timers().vm_rt.deadline(TimerId::THROTTLE),
            Some(now + 2 * CPU_THROTTLE_TIMESLICE_NS)
        );

        // Dropping the throttle before the jobs run turns them into no-ops.
        sched.throttle_stop();
        sched.vm_start(&mut guard);
        for index in guard.cpu_indices() {
            sched.run_on_cpu(&mut guard, index, |_, _, _| ()).unwrap();
            assert!(!guard.cpu_flags(index).unwrap().throttle_scheduled);
        }
        assert!(host.sleeps().is_empty());
        sched.remove_all_vcpus(&mut guard).unwrap();
    }

    proptest! {
        #[test]
        fn percentage_is_clamped(pct in any::<i64>()) {
            let sched = dummy_sched(DummyMode::Idle);
            let mut guard = sched.lock();
            sched.throttle_set(&mut guard, pct);
            prop_assert_eq!(i64::from(sched.throttle_get_percentage()), pct.clamp(1, 99));
            prop_assert!(guard.timers().vm_rt.is_armed(TimerId::THROTTLE));
        }
    }
}
