mod harness;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpuloop_sched::{
    Accelerator, BackendError, CpuIndex, RunState, SliceContext, SliceExit, VcpuExecutor,
};
use cpuloop_sync::Bql;
use cpuloop_time::{ClockType, FakeHostClock, IcountConfig, StdHostClock, TimersSnapshot, VmClock};
use harness::{Machine, MS};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum HostStep {
    Advance(i64),
    Rewind(i64),
}

fn host_step() -> impl Strategy<Value = HostStep> {
    prop_oneof![
        (0i64..5 * MS).prop_map(HostStep::Advance),
        (0i64..5 * MS).prop_map(HostStep::Rewind),
    ]
}

proptest! {
    #[test]
    fn ticks_never_go_backwards(steps in prop::collection::vec(host_step(), 1..64)) {
        let bql = Bql::new(());
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host.clone(), IcountConfig::default());
        let _guard = bql.lock();
        clock.enable_ticks();

        let mut ticks = 0i64;
        let mut last = clock.get_ticks();
        for step in steps {
            match step {
                HostStep::Advance(ns) => ticks += ns,
                HostStep::Rewind(ns) => ticks = (ticks - ns).max(0),
            }
            host.set_ticks(ticks);
            let now = clock.get_ticks();
            prop_assert!(now >= last, "ticks went from {} to {}", last, now);
            last = now;
        }
    }
}

#[test]
fn clock_is_monotonic_across_threads() {
    let bql = Bql::new(());
    let clock = Arc::new(VmClock::new(
        Arc::new(StdHostClock::new()),
        IcountConfig::default(),
    ));
    {
        let _guard = bql.lock();
        clock.enable_ticks();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let clock = clock.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut last = clock.get_clock();
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) || reads < 10_000 {
                    let now = clock.get_clock();
                    assert!(now >= last, "clock went from {last} to {now}");
                    last = now;
                    reads += 1;
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
}

/// Retires its whole budget, then halts.
struct RetireBudget;

impl VcpuExecutor for RetireBudget {
    fn execute_slice(&mut self, ctx: &mut SliceContext<'_>) -> SliceExit {
        ctx.retire(ctx.remaining());
        SliceExit::Halted
    }
}

struct RetireAccel;

impl Accelerator for RetireAccel {
    fn name(&self) -> &str {
        "retire"
    }

    fn init_vcpu(&self, _index: CpuIndex) -> Result<Box<dyn VcpuExecutor>, BackendError> {
        Ok(Box::new(RetireBudget))
    }
}

#[test]
fn icount_slice_stops_at_the_next_virtual_deadline() {
    let machine = Machine::new(IcountConfig::fixed(0), Arc::new(RetireAccel));
    let sched = &machine.sched;

    let timer = {
        let mut guard = sched.lock();
        sched.create_vcpu(&mut guard).unwrap();
        let timer = guard.timers_mut().alloc_id();
        sched.timer_mod(&mut guard, ClockType::Virtual, timer, MS);
        sched.vm_start(&mut guard);
        timer
    };

    let mut fired = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut guard = sched.lock();
    while fired.is_empty() {
        assert!(Instant::now() < deadline, "virtual timer never fired");
        sched
            .main_loop_wait(&mut guard, Duration::from_millis(10), |_, clock, id| {
                fired.push((clock, id))
            })
            .unwrap();
    }
    assert_eq!(fired, vec![(ClockType::Virtual, timer)]);
    // Shift 0: one instruction per nanosecond, and the budget ended exactly at the deadline.
    assert_eq!(sched.clock().get_icount_raw(), MS);
    assert_eq!(sched.clock().get_icount(), MS);

    sched.vm_stop(&mut guard, RunState::Paused).unwrap();
    sched.remove_all_vcpus(&mut guard).unwrap();
}

#[test]
fn snapshot_of_a_running_vm_restores_its_virtual_time() {
    let machine = Machine::new(
        IcountConfig::adaptive(),
        Arc::new(cpuloop_sched::DummyAccel::default()),
    );
    let sched = &machine.sched;
    let mut guard = sched.lock();
    sched.vm_start(&mut guard);
    machine.host.advance_ns(25 * MS);
    sched.clock().account_executed(1_000);

    let bytes = sched.clock().save(guard.timers()).to_bytes().unwrap();
    let snap = TimersSnapshot::from_bytes(&bytes).unwrap();
    let at_save = sched.clock().get_clock();
    let icount_at_save = sched.clock().get_icount();
    drop(guard);

    let other = Machine::new(
        IcountConfig::adaptive(),
        Arc::new(cpuloop_sched::DummyAccel::default()),
    );
    other.host.advance_ns(3 * MS);
    let mut guard = other.sched.lock();
    other.sched.clock().restore(&snap, guard.timers_mut()).unwrap();
    assert_eq!(other.sched.clock().get_clock(), at_save);
    assert_eq!(other.sched.clock().get_icount(), icount_at_save);
    assert!(guard.timers().vm_rt.is_armed(cpuloop_time::TimerId::ICOUNT_RT));

    other.sched.vm_start(&mut guard);
    other.host.advance_ns(MS);
    assert_eq!(other.sched.clock().get_clock(), at_save + MS);
}
