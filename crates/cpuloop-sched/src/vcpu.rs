//! Per-vCPU state.
//!
//! Everything except the kick machinery lives in [`VcpuSlot`] inside the global-lock protected
//! scheduler state. [`VcpuShared`] holds the few fields that are touched without the lock: the
//! kick flag, the exit request polled by the backend, and the idle condition variable.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, Thread};

use cpuloop_sync::Condvar;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::work::WorkItem;
use crate::CpuIndex;

pub struct VcpuShared {
    pub(crate) index: CpuIndex,
    /// Set when a kick has been delivered and not yet observed by the vCPU thread.
    ///
    /// Set with a swap (acquire-release) by kickers; cleared with a release store by the vCPU
    /// thread once it is back under the global lock and about to re-evaluate its flags.
    thread_kicked: AtomicBool,
    /// Polled by the backend; asks the current slice to return as soon as possible.
    exit_request: AtomicBool,
    kicks: AtomicU64,
    pub(crate) halt_cond: Condvar,
    thread: OnceLock<Thread>,
}

impl VcpuShared {
    pub(crate) fn new(index: CpuIndex) -> Self {
        Self {
            index,
            thread_kicked: AtomicBool::new(false),
            exit_request: AtomicBool::new(false),
            kicks: AtomicU64::new(0),
            halt_cond: Condvar::new(),
            thread: OnceLock::new(),
        }
    }

    pub fn index(&self) -> CpuIndex {
        self.index
    }

    /// Wake the vCPU whether it is idle on its condition variable or inside the backend.
    pub(crate) fn kick(&self) {
        self.halt_cond.notify_all();
        self.kick_thread();
    }

    /// Deliver the out-of-band wake to the vCPU thread, at most once until it is observed.
    pub(crate) fn kick_thread(&self) {
        if self.thread_kicked.swap(true, Ordering::AcqRel) {
            return;
        }
        self.exit_request.store(true, Ordering::Release);
        self.kicks.fetch_add(1, Ordering::Relaxed);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Called by the vCPU thread itself with the global lock held.
    pub(crate) fn clear_kicked(&self) {
        self.exit_request.store(false, Ordering::Release);
        self.thread_kicked.store(false, Ordering::Release);
    }

    /// Ask the running slice to return without marking a kick.
    pub(crate) fn request_exit(&self) {
        self.exit_request.store(true, Ordering::Release);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::Acquire)
    }

    pub fn thread_kicked(&self) -> bool {
        self.thread_kicked.load(Ordering::Acquire)
    }

    /// Number of wakes actually delivered to the thread.
    pub fn kick_count(&self) -> u64 {
        self.kicks.load(Ordering::Relaxed)
    }

    #[track_caller]
    pub(crate) fn register_thread(&self) {
        assert!(
            self.thread.set(std::thread::current()).is_ok(),
            "vCPU {} thread started twice",
            self.index
        );
    }
}

/// Execution flags of one vCPU. Read and written only with the global lock held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuFlags {
    pub created: bool,
    pub stopped: bool,
    /// A stop was requested and not yet acknowledged by the vCPU thread.
    pub stop: bool,
    pub halted: bool,
    pub unplug: bool,
    pub running: bool,
    pub throttle_scheduled: bool,
    /// Pending interrupt lines; a halted vCPU with any bit set has work to do.
    pub interrupt_request: u32,
}

impl VcpuFlags {
    pub fn has_work(&self) -> bool {
        self.interrupt_request != 0
    }
}

pub(crate) struct VcpuSlot {
    pub(crate) shared: Arc<VcpuShared>,
    pub(crate) flags: VcpuFlags,
    pub(crate) work: VecDeque<WorkItem>,
    pub(crate) thread: Option<JoinHandle<()>>,
    pub(crate) thread_name: String,
    pub(crate) init_error: Option<BackendError>,
    pub(crate) destroy_error: Option<BackendError>,
}

impl VcpuSlot {
    pub(crate) fn new(shared: Arc<VcpuShared>, thread_name: String) -> Self {
        Self {
            shared,
            // vCPUs come up stopped until `cpu_resume` lets them run.
            flags: VcpuFlags {
                stopped: true,
                ..VcpuFlags::default()
            },
            work: VecDeque::new(),
            thread: None,
            thread_name,
            init_error: None,
            destroy_error: None,
        }
    }
}

/// One entry of [`crate::Scheduler::query_cpus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cpu_index: CpuIndex,
    /// True for the first vCPU.
    pub current: bool,
    pub halted: bool,
    pub stopped: bool,
    pub thread_name: String,
    pub kicks: u64,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<VcpuShared>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(shared: Option<Arc<VcpuShared>>) {
    CURRENT.with(|current| *current.borrow_mut() = shared);
}

pub(crate) fn current_shared() -> Option<Arc<VcpuShared>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Index of the vCPU driven by the calling thread, if any.
pub fn current_cpu() -> Option<CpuIndex> {
    CURRENT.with(|current| current.borrow().as_ref().map(|shared| shared.index))
}

pub fn in_vcpu_thread() -> bool {
    current_cpu().is_some()
}

/// Interrupt the calling vCPU thread's own backend call.
///
/// Panics when called from a thread that does not drive a vCPU.
#[track_caller]
pub fn kick_self() {
    let Some(shared) = current_shared() else {
        panic!("kick_self called outside a vCPU thread");
    };
    shared.kick_thread();
}
