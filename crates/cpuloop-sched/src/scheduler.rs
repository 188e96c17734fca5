//! The vCPU scheduler: thread lifecycle and the per-vCPU run loop.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::thread;

use cpuloop_sync::{Bql, BqlGuard, Condvar};
use cpuloop_time::{ClockTimers, HostClock, IcountConfig, VmClock};

use crate::accel::{Accelerator, SliceContext, SliceExit, VcpuExecutor};
use crate::error::{Result, SchedError};
use crate::runstate::{IoQuiesce, NoIo, RunState, VmStateListener};
use crate::vcpu::{self, CpuInfo, VcpuFlags, VcpuShared, VcpuSlot};
use crate::CpuIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedConfig {
    pub icount: IcountConfig,
    /// An external harness drives the virtual clock; the warp controller stays out of the way.
    pub deterministic_test: bool,
    /// Used in vCPU thread names (`"CPU <index>/<accel>"`).
    pub accel_name: String,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            icount: IcountConfig::default(),
            deterministic_test: false,
            accel_name: "dummy".to_string(),
        }
    }
}

/// Control state owned by the global execution lock.
pub struct SchedState {
    pub(crate) cpus: BTreeMap<CpuIndex, VcpuSlot>,
    next_index: CpuIndex,
    pub(crate) run_state: RunState,
    /// Stop requested from a vCPU thread, performed by the main loop.
    pub(crate) vmstop_request: Option<RunState>,
    pub(crate) debug_stop_cpu: Option<CpuIndex>,
    pub(crate) main_notified: bool,
    pub(crate) timers: ClockTimers,
    pub(crate) listeners: Vec<Box<dyn VmStateListener>>,
    pub(crate) io: Box<dyn IoQuiesce>,
}

impl SchedState {
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }

    pub fn timers(&self) -> &ClockTimers {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut ClockTimers {
        &mut self.timers
    }

    pub fn vcpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu_indices(&self) -> Vec<CpuIndex> {
        self.cpus.keys().copied().collect()
    }

    pub fn cpu_flags(&self, index: CpuIndex) -> Option<VcpuFlags> {
        self.cpus.get(&index).map(|slot| slot.flags)
    }

    pub fn vcpu(&self, index: CpuIndex) -> Option<&Arc<VcpuShared>> {
        self.cpus.get(&index).map(|slot| &slot.shared)
    }

    /// vCPU that last stopped on a debug exception.
    pub fn debug_stop_cpu(&self) -> Option<CpuIndex> {
        self.debug_stop_cpu
    }

    pub fn pending_vmstop_request(&self) -> Option<RunState> {
        self.vmstop_request
    }

    pub(crate) fn flags_mut(&mut self, index: CpuIndex) -> Option<&mut VcpuFlags> {
        self.cpus.get_mut(&index).map(|slot| &mut slot.flags)
    }
}

pub type SchedGuard<'a> = BqlGuard<'a, SchedState>;

pub struct Scheduler {
    config: SchedConfig,
    accel: Arc<dyn Accelerator>,
    clock: VmClock,
    bql: Bql<SchedState>,
    /// vCPU thread creation and exit.
    cpu_cond: Condvar,
    pub(crate) pause_cond: Condvar,
    pub(crate) work_cond: Condvar,
    pub(crate) main_cond: Condvar,
    pub(crate) throttle_percentage: AtomicU32,
}

impl Scheduler {
    pub fn new(
        config: SchedConfig,
        accel: Arc<dyn Accelerator>,
        host: Arc<dyn HostClock>,
    ) -> Arc<Self> {
        let clock = VmClock::new(host, config.icount);
        let mut timers = ClockTimers::new();
        clock.arm_adjust_timers(&mut timers);

        Arc::new(Self {
            config,
            accel,
            clock,
            bql: Bql::new(SchedState {
                cpus: BTreeMap::new(),
                next_index: 0,
                run_state: RunState::Prelaunch,
                vmstop_request: None,
                debug_stop_cpu: None,
                main_notified: false,
                timers,
                listeners: Vec::new(),
                io: Box::new(NoIo),
            }),
            cpu_cond: Condvar::new(),
            pause_cond: Condvar::new(),
            work_cond: Condvar::new(),
            main_cond: Condvar::new(),
            throttle_percentage: AtomicU32::new(0),
        })
    }

    /// Acquire the global execution lock.
    #[track_caller]
    pub fn lock(&self) -> SchedGuard<'_> {
        self.bql.lock()
    }

    pub fn clock(&self) -> &VmClock {
        &self.clock
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn accel(&self) -> &Arc<dyn Accelerator> {
        &self.accel
    }

    pub fn set_io_quiesce(&self, guard: &mut SchedGuard<'_>, io: Box<dyn IoQuiesce>) {
        guard.io = io;
    }

    pub fn add_vm_state_listener(
        &self,
        guard: &mut SchedGuard<'_>,
        listener: impl VmStateListener + 'static,
    ) {
        guard.listeners.push(Box::new(listener));
    }

    /// Start a new vCPU thread and wait until it has registered itself.
    ///
    /// The vCPU starts out stopped unless the VM is already running. If the backend cannot
    /// initialize it, the thread exits and the failure is returned here.
    pub fn create_vcpu(self: &Arc<Self>, guard: &mut SchedGuard<'_>) -> Result<CpuIndex> {
        let index = guard.next_index;
        guard.next_index += 1;

        let shared = Arc::new(VcpuShared::new(index));
        let thread_name = format!("CPU {index}/{}", self.config.accel_name);
        let handle = thread::Builder::new().name(thread_name.clone()).spawn({
            let sched = self.clone();
            let shared = shared.clone();
            move || sched.vcpu_thread_fn(shared)
        });
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(cpu = index, error = %err, "failed to spawn vCPU thread");
                return Err(SchedError::Spawn(err));
            }
        };

        let mut slot = VcpuSlot::new(shared, thread_name);
        slot.thread = Some(handle);
        guard.cpus.insert(index, slot);

        loop {
            let slot = &guard.cpus[&index];
            if slot.flags.created || slot.init_error.is_some() {
                break;
            }
            guard.wait(&self.cpu_cond);
        }

        let Some(source) = guard
            .cpus
            .get_mut(&index)
            .and_then(|slot| slot.init_error.take())
        else {
            if guard.is_running() {
                self.cpu_resume(guard, index)?;
            }
            return Ok(index);
        };
        if let Some(mut slot) = guard.cpus.remove(&index) {
            if let Some(handle) = slot.thread.take() {
                let _ = guard.unlocked(|| handle.join());
            }
        }
        Err(SchedError::VcpuInit { index, source })
    }

    fn vcpu_thread_fn(&self, shared: Arc<VcpuShared>) {
        let index = shared.index;
        shared.register_thread();
        vcpu::set_current(Some(shared.clone()));

        let mut guard = self.lock();
        let mut executor = match self.accel.init_vcpu(index) {
            Ok(executor) => executor,
            Err(err) => {
                tracing::error!(cpu = index, error = %err, "vCPU initialization failed");
                if let Some(slot) = guard.cpus.get_mut(&index) {
                    slot.init_error = Some(err);
                }
                self.cpu_cond.notify_all();
                drop(guard);
                vcpu::set_current(None);
                return;
            }
        };

        if let Some(flags) = guard.flags_mut(index) {
            flags.created = true;
        }
        self.cpu_cond.notify_all();
        tracing::debug!(cpu = index, accel = self.accel.name(), "vCPU thread started");

        loop {
            if self.cpu_can_run(&guard, index) {
                let exit = self.exec_slice(&mut guard, &shared, executor.as_mut());
                self.handle_slice_exit(&mut guard, index, exit);
            }
            self.wait_io_event(&mut guard, &shared);

            let unplug = guard.cpu_flags(index).map_or(true, |flags| flags.unplug);
            if unplug && !self.cpu_can_run(&guard, index) {
                break;
            }
        }

        // Nobody waiting in `run_on_cpu` may be left hanging.
        self.process_queued_work(&mut guard, index);

        if let Err(err) = executor.destroy() {
            tracing::error!(cpu = index, error = %err, "vCPU teardown failed");
            if let Some(slot) = guard.cpus.get_mut(&index) {
                slot.destroy_error = Some(err);
            }
        }
        if let Some(flags) = guard.flags_mut(index) {
            flags.created = false;
        }
        self.cpu_cond.notify_all();
        tracing::debug!(cpu = index, "vCPU thread exiting");
        drop(guard);
        vcpu::set_current(None);
    }

    /// Run one backend slice with the global lock released.
    fn exec_slice(
        &self,
        guard: &mut SchedGuard<'_>,
        shared: &VcpuShared,
        executor: &mut dyn VcpuExecutor,
    ) -> SliceExit {
        let index = shared.index;
        let Some(flags) = guard.flags_mut(index) else {
            return SliceExit::Continue;
        };
        if flags.halted {
            if !flags.has_work() {
                return SliceExit::Halted;
            }
            flags.halted = false;
        }
        flags.running = true;
        let pending_interrupts = flags.interrupt_request;

        let budget = if self.clock.use_icount() {
            let running = guard.is_running();
            if self.clock.account_warp_timer(&mut guard.timers, running) {
                self.notify_main(guard);
            }
            let deadline = guard.timers.vm.deadline_ns(self.clock.virtual_ns());
            if deadline == Some(0) {
                self.notify_main(guard);
            }
            Some(self.clock.icount_budget(deadline))
        } else {
            None
        };

        let mut ctx = SliceContext::new(shared, &self.clock, budget, pending_interrupts);
        let exit = guard.unlocked(|| executor.execute_slice(&mut ctx));
        ctx.update_icount();
        let acked = ctx.acked_interrupts();
        if let Some(ahead) = self.clock.align_guest() {
            tracing::trace!(cpu = index, ?ahead, "guest ahead of host; sleeping");
            let host = self.clock.host().clone();
            guard.unlocked(|| host.sleep(ahead));
        }

        if let Some(flags) = guard.flags_mut(index) {
            flags.running = false;
            flags.interrupt_request &= !acked;
        }
        if self.clock.use_icount() && guard.timers.vm.expired(self.clock.virtual_ns()) {
            self.notify_main(guard);
        }
        exit
    }

    fn handle_slice_exit(&self, guard: &mut SchedGuard<'_>, index: CpuIndex, exit: SliceExit) {
        match exit {
            SliceExit::Continue | SliceExit::Interrupted => {}
            SliceExit::Halted => {
                if let Some(flags) = guard.flags_mut(index) {
                    flags.halted = true;
                }
            }
            SliceExit::Debug => {
                tracing::debug!(cpu = index, "vCPU stopped for debugger");
                guard.debug_stop_cpu = Some(index);
                if let Some(flags) = guard.flags_mut(index) {
                    flags.stopped = true;
                }
                self.request_vmstop(guard, RunState::Debug);
                self.pause_cond.notify_all();
            }
            SliceExit::Fatal(message) => {
                tracing::error!(
                    cpu = index,
                    state = %self.accel.dump_state(index),
                    "vCPU execution failed: {message}"
                );
                if let Some(flags) = guard.flags_mut(index) {
                    flags.stopped = true;
                }
                self.request_vmstop(guard, RunState::InternalError);
                self.pause_cond.notify_all();
            }
        }
    }

    /// Block while the vCPU has nothing to do, then acknowledge kicks, stop requests and work.
    fn wait_io_event(&self, guard: &mut SchedGuard<'_>, shared: &VcpuShared) {
        let index = shared.index;
        let mut slept = false;
        while self.cpu_thread_is_idle(guard, index) {
            if !slept {
                slept = true;
                tracing::trace!(cpu = index, "vCPU idle");
            }
            guard.wait(&shared.halt_cond);
        }
        if slept {
            tracing::trace!(cpu = index, "vCPU woke up");
        }
        self.wait_io_event_common(guard, shared);
    }

    fn wait_io_event_common(&self, guard: &mut SchedGuard<'_>, shared: &VcpuShared) {
        shared.clear_kicked();
        if guard.cpu_flags(shared.index).is_some_and(|flags| flags.stop) {
            self.cpu_stop_self(guard, shared, false);
        }
        self.process_queued_work(guard, shared.index);
    }

    /// Acknowledge a stop on the calling vCPU thread.
    pub(crate) fn cpu_stop_self(
        &self,
        guard: &mut SchedGuard<'_>,
        shared: &VcpuShared,
        exit: bool,
    ) {
        if let Some(flags) = guard.flags_mut(shared.index) {
            flags.stop = false;
            flags.stopped = true;
        }
        if exit {
            shared.request_exit();
        }
        self.pause_cond.notify_all();
    }

    pub(crate) fn cpu_is_stopped(&self, guard: &SchedGuard<'_>, index: CpuIndex) -> bool {
        !guard.is_running() || guard.cpu_flags(index).map_or(true, |flags| flags.stopped)
    }

    pub(crate) fn cpu_can_run(&self, guard: &SchedGuard<'_>, index: CpuIndex) -> bool {
        let stop = guard.cpu_flags(index).map_or(true, |flags| flags.stop);
        !stop && !self.cpu_is_stopped(guard, index)
    }

    pub fn cpu_thread_is_idle(&self, guard: &SchedGuard<'_>, index: CpuIndex) -> bool {
        let Some(flags) = guard.cpu_flags(index) else {
            return false;
        };
        if flags.stop || self.has_queued_work(guard, index) {
            return false;
        }
        if self.cpu_is_stopped(guard, index) {
            return true;
        }
        flags.halted && !flags.has_work() && !self.accel.halt_in_kernel()
    }

    pub fn all_cpu_threads_idle(&self, guard: &SchedGuard<'_>) -> bool {
        guard
            .cpus
            .keys()
            .all(|&index| self.cpu_thread_is_idle(guard, index))
    }

    /// Wake vCPU `index` out of its idle wait or its backend slice.
    pub fn kick(&self, guard: &SchedGuard<'_>, index: CpuIndex) -> Result<()> {
        let shared = guard.vcpu(index).ok_or(SchedError::NoSuchVcpu(index))?;
        shared.kick();
        Ok(())
    }

    pub fn kick_count(&self, guard: &SchedGuard<'_>, index: CpuIndex) -> Option<u64> {
        guard.vcpu(index).map(|shared| shared.kick_count())
    }

    /// Raise interrupt lines on vCPU `index`; a halted vCPU resumes to service them.
    pub fn cpu_interrupt(
        &self,
        guard: &mut SchedGuard<'_>,
        index: CpuIndex,
        mask: u32,
    ) -> Result<()> {
        let slot = guard
            .cpus
            .get_mut(&index)
            .ok_or(SchedError::NoSuchVcpu(index))?;
        slot.flags.interrupt_request |= mask;
        slot.shared.kick();
        Ok(())
    }

    pub fn cpu_reset_interrupt(
        &self,
        guard: &mut SchedGuard<'_>,
        index: CpuIndex,
        mask: u32,
    ) -> Result<()> {
        let flags = guard
            .flags_mut(index)
            .ok_or(SchedError::NoSuchVcpu(index))?;
        flags.interrupt_request &= !mask;
        Ok(())
    }

    /// Stop, unplug and join vCPU `index`. The global lock is released while joining.
    pub fn remove_vcpu_sync(&self, guard: &mut SchedGuard<'_>, index: CpuIndex) -> Result<()> {
        let slot = guard
            .cpus
            .get_mut(&index)
            .ok_or(SchedError::NoSuchVcpu(index))?;
        slot.flags.stop = true;
        slot.flags.unplug = true;
        slot.shared.kick();
        let handle = slot.thread.take();

        let joined = match handle {
            Some(handle) => guard.unlocked(|| handle.join()).is_ok(),
            None => true,
        };
        let slot = guard.cpus.remove(&index);
        self.work_cond.notify_all();
        self.pause_cond.notify_all();
        tracing::debug!(cpu = index, "vCPU removed");

        if !joined {
            return Err(SchedError::ThreadPanicked(index));
        }
        match slot.and_then(|mut slot| slot.destroy_error.take()) {
            Some(source) => Err(SchedError::VcpuDestroy { index, source }),
            None => Ok(()),
        }
    }

    /// Remove every vCPU, reporting the first failure.
    pub fn remove_all_vcpus(&self, guard: &mut SchedGuard<'_>) -> Result<()> {
        let mut first_err = None;
        for index in guard.cpu_indices() {
            if let Err(err) = self.remove_vcpu_sync(guard, index) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn query_cpus(&self, guard: &SchedGuard<'_>) -> Vec<CpuInfo> {
        let first = guard.cpus.keys().next().copied();
        guard
            .cpus
            .iter()
            .map(|(&index, slot)| CpuInfo {
                cpu_index: index,
                current: Some(index) == first,
                halted: slot.flags.halted,
                stopped: slot.flags.stopped,
                thread_name: slot.thread_name.clone(),
                kicks: slot.shared.kick_count(),
            })
            .collect()
    }

    pub fn synchronize_all_states(&self, guard: &SchedGuard<'_>) {
        for &index in guard.cpus.keys() {
            self.accel.synchronize_state(index);
        }
    }

    pub fn synchronize_all_post_reset(&self, guard: &SchedGuard<'_>) {
        for &index in guard.cpus.keys() {
            self.accel.synchronize_post_reset(index);
        }
    }

    pub fn synchronize_all_post_init(&self, guard: &SchedGuard<'_>) {
        for &index in guard.cpus.keys() {
            self.accel.synchronize_post_init(index);
        }
    }

    pub fn synchronize_all_pre_loadvm(&self, guard: &SchedGuard<'_>) {
        for &index in guard.cpus.keys() {
            self.accel.synchronize_pre_loadvm(index);
        }
    }

    /// Text printed by [`Scheduler::hw_error`]: the message followed by every vCPU's state.
    pub fn hw_error_report(&self, guard: &SchedGuard<'_>, message: &str) -> String {
        let mut report = format!("hardware error: {message}\n");
        for &index in guard.cpus.keys() {
            report.push_str(&format!("CPU #{index}:\n"));
            report.push_str(&self.accel.dump_state(index));
            report.push('\n');
        }
        report
    }

    /// Report a fatal emulation error with a dump of every vCPU and abort the process.
    pub fn hw_error(&self, guard: &SchedGuard<'_>, message: &str) -> ! {
        let report = self.hw_error_report(guard, message);
        tracing::error!("{report}");
        eprint!("{report}");
        std::process::abort()
    }
}
