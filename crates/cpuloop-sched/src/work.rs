//! Cross-thread work executed on a specific vCPU thread.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, SchedError};
use crate::scheduler::{SchedGuard, Scheduler};
use crate::vcpu;
use crate::CpuIndex;

/// A job run on a vCPU thread with the global lock held. It may release the lock temporarily
/// through the guard.
pub type Job = Box<dyn FnOnce(&Scheduler, &mut SchedGuard<'_>, CpuIndex) + Send>;

pub(crate) struct WorkItem {
    pub(crate) job: Job,
}

impl Scheduler {
    /// Queue `job` on vCPU `index` and return immediately.
    pub fn async_run_on_cpu(
        &self,
        guard: &mut SchedGuard<'_>,
        index: CpuIndex,
        job: impl FnOnce(&Scheduler, &mut SchedGuard<'_>, CpuIndex) + Send + 'static,
    ) -> Result<()> {
        let slot = guard
            .cpus
            .get_mut(&index)
            .ok_or(SchedError::NoSuchVcpu(index))?;
        slot.work.push_back(WorkItem { job: Box::new(job) });
        slot.shared.kick();
        Ok(())
    }

    /// Run `job` on vCPU `index` and wait for its result.
    ///
    /// Runs inline when called from that vCPU's own thread. Otherwise the caller's global lock is
    /// released while it waits.
    pub fn run_on_cpu<R: Send + 'static>(
        &self,
        guard: &mut SchedGuard<'_>,
        index: CpuIndex,
        job: impl FnOnce(&Scheduler, &mut SchedGuard<'_>, CpuIndex) -> R + Send + 'static,
    ) -> Result<R> {
        let slot = guard.cpus.get(&index).ok_or(SchedError::NoSuchVcpu(index))?;
        if vcpu::current_shared().is_some_and(|cur| Arc::ptr_eq(&cur, &slot.shared)) {
            return Ok(job(self, guard, index));
        }

        let result = Arc::new(Mutex::new(None));
        let slot_result = result.clone();
        self.async_run_on_cpu(guard, index, move |sched, guard, index| {
            let value = job(sched, guard, index);
            *slot_result.lock() = Some(value);
        })?;

        loop {
            if let Some(value) = result.lock().take() {
                return Ok(value);
            }
            if !guard.cpus.contains_key(&index) {
                return Err(SchedError::NoSuchVcpu(index));
            }
            guard.wait(&self.work_cond);
        }
    }

    /// Drain vCPU `index`'s queue on its own thread.
    pub(crate) fn process_queued_work(&self, guard: &mut SchedGuard<'_>, index: CpuIndex) {
        let mut ran = false;
        loop {
            // Jobs may drop the lock, so new work can arrive while draining.
            let item = match guard.cpus.get_mut(&index) {
                Some(slot) => slot.work.pop_front(),
                None => None,
            };
            let Some(item) = item else {
                break;
            };
            (item.job)(self, guard, index);
            ran = true;
        }
        if ran {
            self.work_cond.notify_all();
        }
    }

    pub(crate) fn has_queued_work(&self, guard: &SchedGuard<'_>, index: CpuIndex) -> bool {
        guard
            .cpus
            .get(&index)
            .is_some_and(|slot| !slot.work.is_empty())
    }
}
