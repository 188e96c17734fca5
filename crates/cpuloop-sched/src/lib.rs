//! vCPU threads and everything that coordinates them.
//!
//! A [`Scheduler`] owns one OS thread per vCPU and the control state shared between them, all of
//! it behind the global execution lock. Guest code runs through an [`Accelerator`] backend one
//! slice at a time with the lock released; everything else (pause/resume, run state changes,
//! throttling, timer dispatch) happens with the lock held.

mod accel;
mod error;
mod main_loop;
mod runstate;
mod scheduler;
mod throttle;
mod vcpu;
mod work;

/// Stable index of a vCPU.
pub type CpuIndex = usize;

pub use accel::{Accelerator, DummyAccel, DummyMode, SliceContext, SliceExit, VcpuExecutor};
pub use error::{BackendError, Result, SchedError};
pub use runstate::{IoQuiesce, NoIo, RunState, VmStateListener};
pub use scheduler::{SchedConfig, SchedGuard, SchedState, Scheduler};
pub use throttle::{
    throttle_period_ns, throttle_sleep_ns, CPU_THROTTLE_PCT_MAX, CPU_THROTTLE_PCT_MIN,
    CPU_THROTTLE_TIMESLICE_NS,
};
pub use vcpu::{current_cpu, in_vcpu_thread, kick_self, CpuInfo, VcpuFlags, VcpuShared};
pub use work::Job;
