use std::collections::BTreeMap;

/// Identifies one timer within a [`ClockTimers`] set.
///
/// The low ids are reserved for the scheduler's own timers; device models allocate theirs with
/// [`ClockTimers::alloc_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u32);

impl TimerId {
    pub const THROTTLE: TimerId = TimerId(1);
    pub const ICOUNT_WARP: TimerId = TimerId(2);
    pub const ICOUNT_RT: TimerId = TimerId(3);
    pub const ICOUNT_VM: TimerId = TimerId(4);

    const FIRST_EXTERNAL: u32 = 16;

    pub fn is_internal(self) -> bool {
        self.0 < Self::FIRST_EXTERNAL
    }
}

/// The clock a timer is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    /// Monotonic host time; runs while the VM is stopped.
    Realtime,
    /// Guest virtual time: instruction-derived in icount mode, otherwise [`ClockType::VirtualRt`].
    Virtual,
    /// Host time with the intervals the VM spent stopped removed.
    VirtualRt,
}

/// One-shot timers keyed by id, each with an absolute deadline in nanoseconds of its clock.
#[derive(Debug, Clone)]
pub struct TimerQueue {
    armed: BTreeMap<TimerId, i64>,
    enabled: bool,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            armed: BTreeMap::new(),
            enabled: true,
        }
    }

    /// Arm (or re-arm) `id` to fire at `deadline`.
    pub fn arm(&mut self, id: TimerId, deadline: i64) {
        self.armed.insert(id, deadline);
    }

    /// Arm `id` at `deadline` unless it is already armed for an earlier time.
    pub fn arm_anticipate(&mut self, id: TimerId, deadline: i64) {
        let slot = self.armed.entry(id).or_insert(deadline);
        *slot = (*slot).min(deadline);
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<i64> {
        self.armed.remove(&id)
    }

    pub fn deadline(&self, id: TimerId) -> Option<i64> {
        self.armed.get(&id).copied()
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.armed.values().copied().min()
    }

    /// Nanoseconds from `now` until the nearest deadline (0 if one has already passed).
    ///
    /// Returns `None` when nothing is armed or the clock is disabled.
    pub fn deadline_ns(&self, now: i64) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        self.next_deadline()
            .map(|deadline| deadline.saturating_sub(now).max(0))
    }

    pub fn expired(&self, now: i64) -> bool {
        self.enabled && self.armed.values().any(|&deadline| deadline <= now)
    }

    /// Disarm and return every timer due at `now`, earliest first. Nothing fires while the clock
    /// is disabled.
    pub fn take_expired(&mut self, now: i64) -> Vec<TimerId> {
        if !self.enabled {
            return Vec::new();
        }
        let mut due: Vec<(i64, TimerId)> = self
            .armed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(&id, &deadline)| (deadline, id))
            .collect();
        due.sort_unstable();
        for (_, id) in &due {
            self.armed.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer queues for every clock type. Owned by the global-lock protected scheduler state.
#[derive(Debug, Clone)]
pub struct ClockTimers {
    pub realtime: TimerQueue,
    pub vm: TimerQueue,
    pub vm_rt: TimerQueue,
    next_id: u32,
}

impl ClockTimers {
    pub fn new() -> Self {
        Self {
            realtime: TimerQueue::new(),
            vm: TimerQueue::new(),
            vm_rt: TimerQueue::new(),
            next_id: TimerId::FIRST_EXTERNAL,
        }
    }

    pub fn alloc_id(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn queue(&self, clock: ClockType) -> &TimerQueue {
        match clock {
            ClockType::Realtime => &self.realtime,
            ClockType::Virtual => &self.vm,
            ClockType::VirtualRt => &self.vm_rt,
        }
    }

    pub fn queue_mut(&mut self, clock: ClockType) -> &mut TimerQueue {
        match clock {
            ClockType::Realtime => &mut self.realtime,
            ClockType::Virtual => &mut self.vm,
            ClockType::VirtualRt => &mut self.vm_rt,
        }
    }
}

impl Default for ClockTimers {
    fn default() -> Self {
        Self::new()
    }
}
