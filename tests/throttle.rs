mod harness;

use std::time::Duration;

use cpuloop_sched::{DummyMode, CPU_THROTTLE_TIMESLICE_NS};
use cpuloop_time::{ClockType, TimerId};
use harness::{Machine, MS};
use pretty_assertions::assert_eq;

#[test]
fn half_throttle_on_four_vcpus() {
    let machine = Machine::dummy(DummyMode::Idle);
    machine.boot(4);
    let sched = &machine.sched;

    let mut guard = sched.lock();
    sched.throttle_set(&mut guard, 50);
    assert!(sched.throttle_active());
    assert_eq!(
        guard.timers().vm_rt.deadline(TimerId::THROTTLE),
        Some(sched.clock().now(ClockType::VirtualRt) + CPU_THROTTLE_TIMESLICE_NS)
    );

    machine.host.advance_ns(10 * MS);
    sched.run_timers(&mut guard, |_, _, _| {});
    let tick_time = sched.clock().now(ClockType::VirtualRt);
    // The period is timeslice / (1 - 0.5).
    assert_eq!(
        guard.timers().vm_rt.deadline(TimerId::THROTTLE),
        Some(tick_time + 2 * CPU_THROTTLE_TIMESLICE_NS)
    );

    // Work runs in order, so these complete only after each vCPU's throttle job.
    for index in guard.cpu_indices() {
        sched.run_on_cpu(&mut guard, index, |_, _, _| ()).unwrap();
        assert!(!guard.cpu_flags(index).unwrap().throttle_scheduled);
    }
    assert_eq!(machine.host.sleeps(), vec![Duration::from_millis(10); 4]);

    sched.throttle_stop();
    assert!(!sched.throttle_active());
    assert_eq!(sched.throttle_get_percentage(), 0);
    drop(guard);
    machine.shutdown();
}

#[test]
fn stopped_throttle_lets_the_timer_die() {
    let machine = Machine::dummy(DummyMode::Idle);
    machine.boot(1);
    let sched = &machine.sched;

    let mut guard = sched.lock();
    sched.throttle_set(&mut guard, 75);
    sched.throttle_stop();
    machine.host.advance_ns(10 * MS);
    sched.run_timers(&mut guard, |_, _, _| {});
    assert!(!guard.timers().vm_rt.is_armed(TimerId::THROTTLE));
    assert!(!guard.cpu_flags(0).unwrap().throttle_scheduled);
    drop(guard);
    assert!(machine.host.sleeps().is_empty());
    machine.shutdown();
}
