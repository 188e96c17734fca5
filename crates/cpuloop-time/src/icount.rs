//! Instruction-counted virtual time.
//!
//! In icount mode guest time advances by `2^shift` nanoseconds per executed instruction. A fixed
//! shift gives fully reproducible execution; the adaptive mode retunes the shift periodically so
//! virtual time roughly tracks host time. The tuner is a crude approximation, not an exact
//! control law.

use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use cpuloop_sync::{assert_bql_held, yield_point};
use serde::Serialize;
use thiserror::Error;

use crate::clock::VmClock;
use crate::host::NANOSECONDS_PER_SECOND;
use crate::timer_queue::{ClockTimers, TimerId};

/// Largest allowed shift; 1 instruction == 1024ns puts the floor at roughly 1 MIPS.
pub const MAX_ICOUNT_SHIFT: u32 = 10;

/// Initial shift for adaptive mode (about 125 MIPS); corrected quickly by the tuner.
pub const ADAPTIVE_INITIAL_SHIFT: u32 = 3;

/// Real and virtual time differences smaller than this are treated as noise.
pub const ICOUNT_WOBBLE_NS: i64 = NANOSECONDS_PER_SECOND / 10;

/// Period of the adjust timer on the virtual-RT clock. Fires even when the guest is idle.
pub const ICOUNT_RT_ADJUST_PERIOD_NS: i64 = NANOSECONDS_PER_SECOND;

/// Period of the adjust timer on the virtual clock.
pub const ICOUNT_VM_ADJUST_PERIOD_NS: i64 = NANOSECONDS_PER_SECOND / 10;

/// With `align=on`, a guest further ahead of host time than this is put to sleep.
pub const ALIGN_MAX_ADVANCE_NS: i64 = 3_000_000;

/// Slices never run further ahead than this, even with no virtual deadline pending.
pub const MAX_SLICE_DEADLINE_NS: i64 = i32::MAX as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcountMode {
    Off,
    Fixed(u32),
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcountConfig {
    pub mode: IcountMode,
    /// Let vCPUs sleep while the clock warps to the next deadline (otherwise warp instantly).
    pub sleep: bool,
    /// Align guest execution with host time. Only meaningful with a fixed shift.
    pub align: bool,
}

impl Default for IcountConfig {
    fn default() -> Self {
        Self {
            mode: IcountMode::Off,
            sleep: true,
            align: false,
        }
    }
}

/// How far guest time has drifted from host time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriftInfo {
    /// Virtual-RT (host) time minus icount (guest) time.
    pub host_minus_guest_ns: i64,
    /// Largest lag of the guest behind host time. Only tracked with `align=on`.
    pub max_delay_ns: Option<i64>,
    /// Largest lead of the guest over host time. Only tracked with `align=on`.
    pub max_advance_ns: Option<i64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IcountConfigError {
    #[error("invalid icount option '{0}'")]
    InvalidOption(String),

    #[error("unknown icount option '{0}'")]
    UnknownOption(String),

    #[error("invalid boolean '{value}' for icount option '{key}'")]
    InvalidBool { key: String, value: String },

    #[error("icount: invalid shift value '{0}'")]
    InvalidShift(String),

    #[error("icount: shift {0} exceeds the maximum of {MAX_ICOUNT_SHIFT}")]
    ShiftTooLarge(u32),

    #[error("please specify shift option when using align")]
    AlignWithoutShift,

    #[error("align=on and sleep=off are incompatible")]
    AlignWithoutSleep,

    #[error("shift=auto and align=on are incompatible")]
    AutoWithAlign,

    #[error("shift=auto and sleep=off are incompatible")]
    AutoWithoutSleep,
}

impl IcountConfig {
    pub fn fixed(shift: u32) -> Self {
        Self {
            mode: IcountMode::Fixed(shift),
            ..Self::default()
        }
    }

    pub fn adaptive() -> Self {
        Self {
            mode: IcountMode::Adaptive,
            ..Self::default()
        }
    }

    /// Parse `shift=<N|auto>[,sleep=on|off][,align=on|off]`.
    ///
    /// A bare leading value is taken as the shift (`"7"` == `"shift=7"`). A missing shift leaves
    /// icount disabled.
    pub fn parse(opts: &str) -> Result<Self, IcountConfigError> {
        let mut shift: Option<&str> = None;
        let mut sleep = true;
        let mut align: Option<bool> = None;

        for (i, item) in opts.split(',').enumerate() {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None if i == 0 => ("shift", item),
                None => return Err(IcountConfigError::InvalidOption(item.to_string())),
            };
            match key {
                "shift" => shift = Some(value),
                "sleep" => sleep = parse_bool(key, value)?,
                "align" => align = Some(parse_bool(key, value)?),
                _ => return Err(IcountConfigError::UnknownOption(key.to_string())),
            }
        }

        let Some(shift) = shift else {
            if align.is_some() {
                return Err(IcountConfigError::AlignWithoutShift);
            }
            return Ok(Self::default());
        };

        let align = align.unwrap_or(false);
        if align && !sleep {
            return Err(IcountConfigError::AlignWithoutSleep);
        }

        if shift != "auto" {
            let value = parse_shift(shift)?;
            if value > MAX_ICOUNT_SHIFT {
                return Err(IcountConfigError::ShiftTooLarge(value));
            }
            return Ok(Self {
                mode: IcountMode::Fixed(value),
                sleep,
                align,
            });
        }

        if align {
            return Err(IcountConfigError::AutoWithAlign);
        }
        if !sleep {
            return Err(IcountConfigError::AutoWithoutSleep);
        }
        Ok(Self {
            mode: IcountMode::Adaptive,
            sleep,
            align,
        })
    }

    pub fn enabled(&self) -> bool {
        self.mode != IcountMode::Off
    }

    pub fn is_adaptive(&self) -> bool {
        self.mode == IcountMode::Adaptive
    }

    pub fn initial_shift(&self) -> u32 {
        match self.mode {
            IcountMode::Off => 0,
            IcountMode::Fixed(shift) => shift,
            IcountMode::Adaptive => ADAPTIVE_INITIAL_SHIFT,
        }
    }
}

impl FromStr for IcountConfig {
    type Err = IcountConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, IcountConfigError> {
    match value {
        "on" | "yes" | "true" => Ok(true),
        "off" | "no" | "false" => Ok(false),
        _ => Err(IcountConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_shift(value: &str) -> Result<u32, IcountConfigError> {
    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse::<u32>()
    };
    parsed.map_err(|_| IcountConfigError::InvalidShift(value.to_string()))
}

/// One step of the adaptive shift tuner.
///
/// `delta` is `icount_ns - wallclock_ns` for the current sample and `last_delta` the previous
/// one. A guest running ahead (positive, growing delta) gets a smaller shift; one falling behind
/// gets a larger shift. The result always stays within `0..=MAX_ICOUNT_SHIFT`.
pub fn next_shift(shift: u32, last_delta: i64, delta: i64, wobble: i64) -> u32 {
    let shift = shift.min(MAX_ICOUNT_SHIFT);
    if delta > 0 && last_delta.saturating_add(wobble) < delta.saturating_mul(2) && shift > 0 {
        // The guest is getting too far ahead. Slow time down.
        return shift - 1;
    }
    if delta < 0
        && last_delta.saturating_sub(wobble) > delta.saturating_mul(2)
        && shift < MAX_ICOUNT_SHIFT
    {
        // The guest is getting too far behind. Speed time up.
        return shift + 1;
    }
    shift
}

impl VmClock {
    /// Retune the shift against host time. No-op unless adaptive icount is active and the VM is
    /// running.
    ///
    /// The bias is recomputed at the new shift so the virtual clock does not jump.
    #[track_caller]
    pub fn icount_adjust(&self, running: bool) {
        if !running || !self.icount_config.is_adaptive() {
            return;
        }
        assert_bql_held();

        let (old_shift, new_shift, delta) = self.seq.write(|| {
            let cur_time = self.clock_locked();
            let cur_icount = self.icount_locked();
            let delta = cur_icount.wrapping_sub(cur_time);

            let old_shift = self.time_shift.load(Ordering::SeqCst);
            let last_delta = self.last_delta.load(Ordering::SeqCst);
            let new_shift = next_shift(old_shift, last_delta, delta, ICOUNT_WOBBLE_NS);
            self.time_shift.store(new_shift, Ordering::SeqCst);
            self.last_delta.store(delta, Ordering::SeqCst);
            yield_point();

            let raw = self.icount.load(Ordering::SeqCst);
            self.icount_bias
                .store(cur_icount.wrapping_sub(raw << new_shift), Ordering::SeqCst);
            (old_shift, new_shift, delta)
        });

        if old_shift != new_shift {
            tracing::debug!(old_shift, new_shift, delta_ns = delta, "icount shift adjusted");
        }
    }

    /// Arm the periodic adjust timers used by adaptive mode.
    pub fn arm_adjust_timers(&self, timers: &mut ClockTimers) {
        if !self.icount_config.is_adaptive() {
            return;
        }
        timers.vm_rt.arm(
            TimerId::ICOUNT_RT,
            self.get_clock() + ICOUNT_RT_ADJUST_PERIOD_NS,
        );
        timers.vm.arm(
            TimerId::ICOUNT_VM,
            self.virtual_ns() + ICOUNT_VM_ADJUST_PERIOD_NS,
        );
    }

    /// Handler for [`TimerId::ICOUNT_RT`]: rearm, then adjust.
    pub fn adjust_rt_timer_fired(&self, timers: &mut ClockTimers, running: bool) {
        timers.vm_rt.arm(
            TimerId::ICOUNT_RT,
            self.get_clock() + ICOUNT_RT_ADJUST_PERIOD_NS,
        );
        self.icount_adjust(running);
    }

    /// Handler for [`TimerId::ICOUNT_VM`]: rearm, then adjust.
    pub fn adjust_vm_timer_fired(&self, timers: &mut ClockTimers, running: bool) {
        timers.vm.arm(
            TimerId::ICOUNT_VM,
            self.virtual_ns() + ICOUNT_VM_ADJUST_PERIOD_NS,
        );
        self.icount_adjust(running);
    }

    /// Sample the guest/host drift after a slice and return how long the vCPU should sleep to
    /// let host time catch up. `None` unless `align=on` and the guest is too far ahead.
    pub fn align_guest(&self) -> Option<Duration> {
        if !self.use_icount() || !self.icount_config.align {
            return None;
        }
        let diff = self.get_icount().wrapping_sub(self.get_clock());
        self.max_delay.fetch_min(diff, Ordering::SeqCst);
        self.max_advance.fetch_max(diff, Ordering::SeqCst);
        (diff > ALIGN_MAX_ADVANCE_NS).then(|| Duration::from_nanos(diff as u64))
    }

    /// Drift between host and guest time; `None` outside icount mode.
    pub fn drift_info(&self) -> Option<DriftInfo> {
        if !self.use_icount() {
            return None;
        }
        let align = self.icount_config.align;
        Some(DriftInfo {
            host_minus_guest_ns: self.get_clock().wrapping_sub(self.get_icount()),
            max_delay_ns: align.then(|| -self.max_delay.load(Ordering::SeqCst)),
            max_advance_ns: align.then(|| self.max_advance.load(Ordering::SeqCst)),
        })
    }

    /// Instruction budget for the next slice so the vCPU stops at the nearest virtual deadline.
    ///
    /// `deadline_ns` is the distance to that deadline; `None` means nothing is pending, in which
    /// case the slice is bounded by [`MAX_SLICE_DEADLINE_NS`].
    pub fn icount_budget(&self, deadline_ns: Option<i64>) -> u64 {
        let deadline_ns = deadline_ns
            .unwrap_or(MAX_SLICE_DEADLINE_NS)
            .clamp(0, MAX_SLICE_DEADLINE_NS) as u64;
        let shift = self.time_shift();
        (deadline_ns + (1u64 << shift) - 1) >> shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use cpuloop_sync::Bql;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::host::FakeHostClock;

    const MS: i64 = 1_000_000;

    #[test]
    fn parse_accepts_documented_forms() {
        assert_eq!(IcountConfig::parse("").unwrap(), IcountConfig::default());
        assert_eq!(IcountConfig::parse("shift=7").unwrap(), IcountConfig::fixed(7));
        assert_eq!(IcountConfig::parse("5").unwrap(), IcountConfig::fixed(5));
        assert_eq!(IcountConfig::parse("shift=0x4").unwrap(), IcountConfig::fixed(4));
        assert_eq!(IcountConfig::parse("shift=auto").unwrap(), IcountConfig::adaptive());
        assert_eq!(
            IcountConfig::parse("shift=2,sleep=off").unwrap(),
            IcountConfig {
                mode: IcountMode::Fixed(2),
                sleep: false,
                align: false,
            }
        );
        assert_eq!(
            "shift=2,align=on".parse::<IcountConfig>().unwrap(),
            IcountConfig {
                mode: IcountMode::Fixed(2),
                sleep: true,
                align: true,
            }
        );
    }

    #[test]
    fn parse_rejects_incompatible_combinations() {
        use IcountConfigError::*;

        let cases = [
            ("align=on", AlignWithoutShift),
            ("shift=1,align=on,sleep=off", AlignWithoutSleep),
            ("shift=auto,align=on", AutoWithAlign),
            ("shift=auto,sleep=off", AutoWithoutSleep),
            ("shift=abc", InvalidShift("abc".into())),
            ("shift=", InvalidShift("".into())),
            ("shift=11", ShiftTooLarge(11)),
            ("shift=1,speed=9", UnknownOption("speed".into())),
            ("shift=1,sleep=maybe", InvalidBool {
                key: "sleep".into(),
                value: "maybe".into(),
            }),
            ("shift=1,fast", InvalidOption("fast".into())),
        ];
        for (opts, expected) in cases {
            assert_eq!(IcountConfig::parse(opts).unwrap_err(), expected, "opts={opts}");
        }
    }

    #[test]
    fn drift_report_tracks_extremes_with_align() {
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host.clone(), IcountConfig::parse("shift=0,align=on").unwrap());
        let bql = Bql::new(());
        {
            let _guard = bql.lock();
            clock.enable_ticks();
        }

        host.advance(Duration::from_millis(5));
        clock.account_executed(MS);
        assert_eq!(clock.align_guest(), None);

        clock.account_executed(10 * MS);
        assert_eq!(clock.align_guest(), Some(Duration::from_millis(6)));

        assert_eq!(
            clock.drift_info(),
            Some(DriftInfo {
                host_minus_guest_ns: -6 * MS,
                max_delay_ns: Some(4 * MS),
                max_advance_ns: Some(6 * MS),
            })
        );
    }

    #[test]
    fn drift_report_without_align_has_no_extremes() {
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host.clone(), IcountConfig::fixed(1));
        clock.account_executed(100);
        assert_eq!(clock.align_guest(), None);
        let info = clock.drift_info().unwrap();
        assert_eq!(info.host_minus_guest_ns, -200);
        assert_eq!(info.max_delay_ns, None);
        assert_eq!(info.max_advance_ns, None);

        let off = VmClock::new(host, IcountConfig::default());
        assert_eq!(off.drift_info(), None);
    }

    #[test]
    fn small_deltas_within_wobble_keep_shift() {
        let wobble = 100 * MS;
        let mut shift = 3;
        let mut last = 0;
        for delta in [50 * MS, 60 * MS, 70 * MS] {
            shift = next_shift(shift, last, delta, wobble);
            last = delta;
        }
        assert_eq!(shift, 3);
    }

    #[test]
    fn growing_delta_slows_guest_one_step_at_a_time() {
        let wobble = 100 * MS;
        let mut shift = 3;
        let mut last = 70 * MS;

        shift = next_shift(shift, last, 200 * MS, wobble);
        last = 200 * MS;
        assert_eq!(shift, 2);

        shift = next_shift(shift, last, 500 * MS, wobble);
        assert_eq!(shift, 1);

        assert_eq!(next_shift(0, 0, 10_000 * MS, wobble), 0);
    }

    #[test]
    fn falling_behind_speeds_guest_up_to_max() {
        let wobble = 100 * MS;
        assert_eq!(next_shift(3, 0, -200 * MS, wobble), 4);
        assert_eq!(
            next_shift(MAX_ICOUNT_SHIFT, 0, -200 * MS, wobble),
            MAX_ICOUNT_SHIFT
        );
    }

    #[test]
    fn adjust_keeps_virtual_clock_continuous() {
        let bql = Bql::new(());
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host.clone(), IcountConfig::adaptive());
        let _guard = bql.lock();
        clock.enable_ticks();

        // Guest ran 100M instructions (800ms at shift 3) in 100ms of host time.
        clock.account_executed(100_000_000);
        host.advance(Duration::from_millis(100));

        let before = clock.get_icount();
        clock.icount_adjust(true);
        assert_eq!(clock.time_shift(), 2);
        assert_eq!(clock.get_icount(), before);

        // Not running: nothing changes.
        clock.account_executed(100_000_000);
        clock.icount_adjust(false);
        assert_eq!(clock.time_shift(), 2);
    }

    #[test]
    fn fixed_mode_never_retunes() {
        let bql = Bql::new(());
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host, IcountConfig::fixed(5));
        let _guard = bql.lock();
        clock.account_executed(1 << 40);
        clock.icount_adjust(true);
        assert_eq!(clock.time_shift(), 5);
    }

    #[test]
    fn budget_rounds_deadline_up_to_whole_instructions() {
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host, IcountConfig::fixed(3));
        assert_eq!(clock.icount_budget(Some(0)), 0);
        assert_eq!(clock.icount_budget(Some(1)), 1);
        assert_eq!(clock.icount_budget(Some(16)), 2);
        assert_eq!(clock.icount_budget(Some(17)), 3);

        // Far or missing deadlines are capped at i32::MAX nanoseconds of guest time.
        assert_eq!(clock.icount_budget(None), 268_435_456);
        assert_eq!(clock.icount_budget(Some(i64::MAX)), 268_435_456);
    }

    #[test]
    fn adjust_timers_rearm_themselves() {
        let bql = Bql::new(());
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host.clone(), IcountConfig::adaptive());
        let mut timers = ClockTimers::new();
        let _guard = bql.lock();
        clock.enable_ticks();

        clock.arm_adjust_timers(&mut timers);
        assert_eq!(
            timers.vm_rt.deadline(TimerId::ICOUNT_RT),
            Some(ICOUNT_RT_ADJUST_PERIOD_NS)
        );
        assert_eq!(
            timers.vm.deadline(TimerId::ICOUNT_VM),
            Some(ICOUNT_VM_ADJUST_PERIOD_NS)
        );

        host.advance(Duration::from_secs(1));
        clock.adjust_rt_timer_fired(&mut timers, true);
        assert_eq!(
            timers.vm_rt.deadline(TimerId::ICOUNT_RT),
            Some(2 * ICOUNT_RT_ADJUST_PERIOD_NS)
        );
    }

    proptest! {
        #[test]
        fn shift_never_leaves_bounds(
            start in 0u32..=MAX_ICOUNT_SHIFT,
            deltas in proptest::collection::vec(any::<i64>(), 0..64),
            wobble in 0i64..(10 * NANOSECONDS_PER_SECOND),
        ) {
            let mut shift = start;
            let mut last = 0i64;
            for delta in deltas {
                let next = next_shift(shift, last, delta, wobble);
                prop_assert!(next <= MAX_ICOUNT_SHIFT);
                prop_assert!(next.abs_diff(shift) <= 1);
                shift = next;
                last = delta;
            }
        }
    }
}
