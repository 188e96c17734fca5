//! VM run state: pausing and resuming the vCPU set, and the stop/start transitions around it.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::scheduler::{SchedGuard, Scheduler};
use crate::vcpu;
use crate::CpuIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Prelaunch,
    Running,
    Paused,
    /// Stopped by a debug exception.
    Debug,
    InternalError,
    IoError,
    Shutdown,
    SaveVm,
    RestoreVm,
    GuestPanicked,
}

impl RunState {
    pub fn is_running(self) -> bool {
        self == RunState::Running
    }
}

/// Notified on every running/stopped transition, with the global lock held.
pub trait VmStateListener: Send {
    fn state_changed(&mut self, running: bool, state: RunState);
}

impl<F> VmStateListener for F
where
    F: FnMut(bool, RunState) + Send,
{
    fn state_changed(&mut self, running: bool, state: RunState) {
        self(running, state)
    }
}

/// The I/O collaborator that must be quiesced before a stop completes.
pub trait IoQuiesce: Send {
    /// Wait for in-flight requests to complete.
    fn drain_all(&mut self);

    /// Write back anything buffered.
    fn flush_all(&mut self) -> io::Result<()>;
}

/// No I/O to quiesce.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIo;

impl IoQuiesce for NoIo {
    fn drain_all(&mut self) {}

    fn flush_all(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Scheduler {
    /// True when the calling thread drives vCPU `index` of this scheduler.
    fn is_own_vcpu(&self, guard: &SchedGuard<'_>, index: CpuIndex) -> bool {
        match (vcpu::current_shared(), guard.vcpu(index)) {
            (Some(cur), Some(shared)) => Arc::ptr_eq(&cur, shared),
            _ => false,
        }
    }

    fn own_vcpu(&self, guard: &SchedGuard<'_>) -> Option<Arc<vcpu::VcpuShared>> {
        let cur = vcpu::current_shared()?;
        let shared = guard.vcpu(cur.index())?;
        Arc::ptr_eq(&cur, shared).then_some(cur)
    }

    pub(crate) fn all_vcpus_paused(&self, guard: &SchedGuard<'_>) -> bool {
        guard.cpus.values().all(|slot| slot.flags.stopped)
    }

    /// Stop every vCPU and wait until all of them have acknowledged.
    ///
    /// The virtual clock's timers are disabled first. A vCPU thread pausing the VM stops its own
    /// vCPU in place instead of waiting for itself.
    pub fn pause_all_vcpus(&self, guard: &mut SchedGuard<'_>) {
        guard.timers.vm.set_enabled(false);

        for index in guard.cpu_indices() {
            if self.is_own_vcpu(guard, index) {
                if let Some(shared) = guard.vcpu(index).cloned() {
                    self.cpu_stop_self(guard, &shared, true);
                }
            } else if let Some(slot) = guard.cpus.get_mut(&index) {
                slot.flags.stop = true;
                slot.shared.kick();
            }
        }

        while !self.all_vcpus_paused(guard) {
            guard.wait(&self.pause_cond);
            // A kick racing with the target reaching its wait point would otherwise be lost.
            for slot in guard.cpus.values() {
                slot.shared.kick();
            }
        }

        // Let a vCPU thread still finishing its critical section get the lock once.
        guard.bump();
        tracing::debug!(vcpus = guard.vcpu_count(), "all vCPUs paused");
    }

    /// Re-enable the virtual clock's timers and restart every vCPU.
    /// Let a single stopped vCPU run again.
    pub fn cpu_resume(&self, guard: &mut SchedGuard<'_>, index: CpuIndex) -> Result<()> {
        let slot = guard
            .cpus
            .get_mut(&index)
            .ok_or(SchedError::NoSuchVcpu(index))?;
        slot.flags.stop = false;
        slot.flags.stopped = false;
        slot.shared.kick();
        Ok(())
    }

    pub fn resume_all_vcpus(&self, guard: &mut SchedGuard<'_>) {
        guard.timers.vm.set_enabled(true);
        for index in guard.cpu_indices() {
            // Indices come from the live slot map.
            if let Err(err) = self.cpu_resume(guard, index) {
                tracing::debug!(cpu = index, error = %err, "vCPU vanished before resume");
            }
        }
        tracing::debug!(vcpus = guard.vcpu_count(), "vCPUs resumed");
    }

    fn notify_listeners(&self, guard: &mut SchedGuard<'_>, running: bool, state: RunState) {
        for listener in guard.listeners.iter_mut() {
            listener.state_changed(running, state);
        }
    }

    fn quiesce_io(&self, guard: &mut SchedGuard<'_>) -> Result<()> {
        guard.io.drain_all();
        guard.io.flush_all().map_err(SchedError::Flush)
    }

    fn do_vm_stop(
        &self,
        guard: &mut SchedGuard<'_>,
        state: RunState,
        send_stop: bool,
    ) -> Result<()> {
        if guard.is_running() {
            self.clock().disable_ticks();
            self.pause_all_vcpus(guard);
            guard.run_state = state;
            self.notify_listeners(guard, false, state);
            if send_stop {
                tracing::info!(event = "STOP", ?state, "VM stopped");
            }
        }
        self.quiesce_io(guard)
    }

    /// Stop the VM and move to `state`.
    ///
    /// From a vCPU thread the stop is only requested: the calling vCPU stops in place and the
    /// main loop performs the rest.
    pub fn vm_stop(&self, guard: &mut SchedGuard<'_>, state: RunState) -> Result<()> {
        if let Some(shared) = self.own_vcpu(guard) {
            self.request_vmstop(guard, state);
            self.cpu_stop_self(guard, &shared, true);
            return Ok(());
        }
        self.do_vm_stop(guard, state, true)
    }

    /// Stop without reporting a STOP event, keeping the current run state.
    pub fn vm_shutdown(&self, guard: &mut SchedGuard<'_>) -> Result<()> {
        let state = guard.run_state;
        self.do_vm_stop(guard, state, false)
    }

    /// Move to `state` whether or not the VM is running. I/O is quiesced in both cases.
    pub fn vm_stop_force_state(&self, guard: &mut SchedGuard<'_>, state: RunState) -> Result<()> {
        if guard.is_running() {
            return self.vm_stop(guard, state);
        }
        guard.run_state = state;
        tracing::debug!(?state, "run state forced");
        self.quiesce_io(guard)
    }

    /// Prepare the transition to running. Returns false when the VM is already running, in which
    /// case the vCPUs must not be resumed again.
    pub fn vm_prepare_start(&self, guard: &mut SchedGuard<'_>) -> bool {
        if guard.is_running() {
            // A stop requested from a vCPU thread is cancelled by this start; report both edges.
            if let Some(requested) = guard.vmstop_request.take() {
                tracing::info!(event = "STOP", state = ?requested, "VM stopped");
                tracing::info!(event = "RESUME", "VM resumed");
            }
            return false;
        }

        guard.vmstop_request = None;
        tracing::info!(event = "RESUME", "VM resumed");
        self.clock().enable_ticks();
        guard.run_state = RunState::Running;
        self.notify_listeners(guard, true, RunState::Running);
        true
    }

    pub fn vm_start(&self, guard: &mut SchedGuard<'_>) {
        if self.vm_prepare_start(guard) {
            self.resume_all_vcpus(guard);
        }
    }

    /// Defer a stop to the main loop.
    pub(crate) fn request_vmstop(&self, guard: &mut SchedGuard<'_>, state: RunState) {
        guard.vmstop_request = Some(state);
        self.notify_main(guard);
    }
}
