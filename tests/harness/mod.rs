#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpuloop_sched::{Accelerator, DummyAccel, DummyMode, SchedConfig, SchedGuard, Scheduler};
use cpuloop_time::{FakeHostClock, IcountConfig};

pub const MS: i64 = 1_000_000;

pub struct Machine {
    pub host: Arc<FakeHostClock>,
    pub sched: Arc<Scheduler>,
}

impl Machine {
    pub fn new(icount: IcountConfig, accel: Arc<dyn Accelerator>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let host = Arc::new(FakeHostClock::new());
        let sched = Scheduler::new(
            SchedConfig {
                icount,
                ..SchedConfig::default()
            },
            accel,
            host.clone(),
        );
        Self { host, sched }
    }

    pub fn dummy(mode: DummyMode) -> Self {
        Self::new(IcountConfig::default(), Arc::new(DummyAccel::new(mode)))
    }

    /// Create `count` vCPUs and start the VM.
    pub fn boot(&self, count: usize) {
        let mut guard = self.sched.lock();
        for _ in 0..count {
            self.sched.create_vcpu(&mut guard).unwrap();
        }
        self.sched.vm_start(&mut guard);
    }

    /// Poll `cond` under the lock until it holds; panics after a generous timeout.
    pub fn wait_until(&self, what: &str, mut cond: impl FnMut(&SchedGuard<'_>) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond(&self.sched.lock()) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn shutdown(&self) {
        let mut guard = self.sched.lock();
        self.sched.remove_all_vcpus(&mut guard).unwrap();
    }
}
