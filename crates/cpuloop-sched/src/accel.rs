//! The boundary between the scheduler and an execution backend.
//!
//! An [`Accelerator`] creates one [`VcpuExecutor`] per vCPU, on that vCPU's own thread. The
//! executor runs guest code one slice at a time with the global execution lock released, and must
//! return promptly once [`SliceContext::exit_requested`] turns true.

use std::thread;

use cpuloop_time::VmClock;

use crate::error::BackendError;
use crate::vcpu::VcpuShared;
use crate::CpuIndex;

/// Why a slice ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceExit {
    /// The budget ran out or the backend chose to yield.
    Continue,
    /// The slice was cut short by a kick.
    Interrupted,
    /// The guest executed a halt instruction; the vCPU idles until it has work.
    Halted,
    /// A breakpoint or single-step trap for the attached debugger.
    Debug,
    /// Unrecoverable backend failure; the VM is stopped with an internal error.
    Fatal(String),
}

pub trait VcpuExecutor {
    fn execute_slice(&mut self, ctx: &mut SliceContext<'_>) -> SliceExit;

    /// Per-vCPU teardown, called on the vCPU thread after it leaves its run loop.
    fn destroy(self: Box<Self>) -> Result<(), BackendError> {
        Ok(())
    }
}

pub trait Accelerator: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Create the executor for vCPU `index`. Runs on the vCPU thread with the global lock held.
    fn init_vcpu(&self, index: CpuIndex) -> Result<Box<dyn VcpuExecutor>, BackendError>;

    /// Human-readable architectural state, used by fatal error reports.
    fn dump_state(&self, index: CpuIndex) -> String {
        format!("CPU #{index}: <no state available>")
    }

    /// True when halts are handled inside the backend, so a halted vCPU never idles here.
    fn halt_in_kernel(&self) -> bool {
        false
    }

    fn synchronize_state(&self, _index: CpuIndex) {}

    fn synchronize_post_reset(&self, _index: CpuIndex) {}

    fn synchronize_post_init(&self, _index: CpuIndex) {}

    fn synchronize_pre_loadvm(&self, _index: CpuIndex) {}
}

/// What the executor sees of its vCPU while a slice runs.
pub struct SliceContext<'a> {
    shared: &'a VcpuShared,
    clock: &'a VmClock,
    /// Instruction budget in icount mode.
    budget: Option<u64>,
    remaining: u64,
    accounted: u64,
    can_do_io: bool,
    pending_interrupts: u32,
    acked_interrupts: u32,
}

impl<'a> SliceContext<'a> {
    pub(crate) fn new(
        shared: &'a VcpuShared,
        clock: &'a VmClock,
        budget: Option<u64>,
        pending_interrupts: u32,
    ) -> Self {
        Self {
            shared,
            clock,
            budget,
            remaining: budget.unwrap_or(0),
            accounted: 0,
            can_do_io: true,
            pending_interrupts,
            acked_interrupts: 0,
        }
    }

    pub fn index(&self) -> CpuIndex {
        self.shared.index()
    }

    pub fn exit_requested(&self) -> bool {
        self.shared.exit_requested()
    }

    /// Block until the slice is asked to return.
    pub fn wait_for_exit_request(&self) {
        while !self.exit_requested() {
            thread::park();
        }
    }

    /// Instructions this slice may execute, or `None` when icount is off.
    pub fn budget(&self) -> Option<u64> {
        self.budget
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Record `count` retired instructions against the budget.
    pub fn retire(&mut self, count: u64) {
        self.remaining = self.remaining.saturating_sub(count);
    }

    pub fn executed(&self) -> u64 {
        self.budget.map_or(0, |budget| budget - self.remaining)
    }

    pub fn can_do_io(&self) -> bool {
        self.can_do_io
    }

    pub fn set_can_do_io(&mut self, can_do_io: bool) {
        self.can_do_io = can_do_io;
    }

    /// Fold instructions retired so far into the shared instruction counter.
    pub fn update_icount(&mut self) {
        let executed = self.executed();
        let delta = executed - self.accounted;
        if delta > 0 {
            self.clock.account_executed(delta as i64);
            self.accounted = executed;
        }
    }

    /// Current icount time, accounting the instructions retired so far in this slice.
    ///
    /// Only valid at an instruction boundary where I/O is allowed; reading the clock anywhere else
    /// would make execution non-deterministic.
    #[track_caller]
    pub fn icount_now(&mut self) -> i64 {
        assert!(
            self.can_do_io,
            "bad icount read: vCPU {} cannot do I/O",
            self.index()
        );
        self.update_icount();
        self.clock.get_icount()
    }

    /// Interrupt lines pending when the slice started.
    pub fn pending_interrupts(&self) -> u32 {
        self.pending_interrupts
    }

    /// Mark interrupt lines as serviced; they are cleared once the slice returns.
    pub fn ack_interrupts(&mut self, mask: u32) {
        self.acked_interrupts |= mask & self.pending_interrupts;
    }

    pub(crate) fn acked_interrupts(&self) -> u32 {
        self.acked_interrupts
    }
}

/// How [`DummyAccel`] vCPUs behave when they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DummyMode {
    /// Service pending interrupts and halt, like a guest sitting in its idle loop.
    #[default]
    Idle,
    /// Stay inside the slice until kicked, like a guest spinning in a busy loop.
    Busy,
}

/// Backend without guest execution. Useful for exercising scheduling in isolation.
#[derive(Debug, Clone, Default)]
pub struct DummyAccel {
    mode: DummyMode,
}

impl DummyAccel {
    pub fn new(mode: DummyMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DummyMode {
        self.mode
    }
}

impl Accelerator for DummyAccel {
    fn name(&self) -> &str {
        "dummy"
    }

    fn init_vcpu(&self, _index: CpuIndex) -> Result<Box<dyn VcpuExecutor>, BackendError> {
        Ok(Box::new(DummyExecutor { mode: self.mode }))
    }
}

struct DummyExecutor {
    mode: DummyMode,
}

impl VcpuExecutor for DummyExecutor {
    fn execute_slice(&mut self, ctx: &mut SliceContext<'_>) -> SliceExit {
        match self.mode {
            DummyMode::Idle => {
                ctx.ack_interrupts(ctx.pending_interrupts());
                SliceExit::Halted
            }
            DummyMode::Busy => {
                ctx.wait_for_exit_request();
                SliceExit::Interrupted
            }
        }
    }
}
