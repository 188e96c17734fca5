//! Persisted virtual-time state.
//!
//! The encoding is little-endian and versioned:
//!
//! ```text
//! magic "CLKT" | version u16 | ticks_offset i64 | clock_offset i64 | icount?
//! icount  := bias i64 | icount i64 | warp? | adjust?
//! warp    := warp_start i64 | deadline opt<i64>
//! adjust  := rt_deadline opt<i64> | vm_deadline opt<i64>
//! ```
//!
//! `x?` and `opt<x>` are a presence byte (0 or 1) followed by `x` when present.

mod error;
mod io;

use std::io::{Read, Write};
use std::sync::atomic::Ordering;

use cpuloop_sync::assert_bql_held;
use serde::{Deserialize, Serialize};

pub use error::{Result, SnapshotError};
use io::{ReadLeExt, WriteLeExt};

use crate::clock::VmClock;
use crate::timer_queue::{ClockTimers, TimerId};

pub const TIMERS_SNAPSHOT_MAGIC: [u8; 4] = *b"CLKT";
pub const TIMERS_SNAPSHOT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimersSnapshot {
    pub ticks_offset: i64,
    pub clock_offset: i64,
    /// Present iff the clock runs in icount mode.
    pub icount: Option<IcountSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcountSnapshot {
    pub bias: i64,
    pub icount: i64,
    /// Present when the warp timer exists (icount with sleep enabled).
    pub warp: Option<WarpTimerSnapshot>,
    /// Present when the adaptive adjust timers exist.
    pub adjust: Option<AdjustTimersSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpTimerSnapshot {
    pub warp_start: i64,
    pub deadline: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustTimersSnapshot {
    pub rt_deadline: Option<i64>,
    pub vm_deadline: Option<i64>,
}

impl TimersSnapshot {
    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_all(&TIMERS_SNAPSHOT_MAGIC)?;
        w.write_u16_le(TIMERS_SNAPSHOT_VERSION)?;
        w.write_i64_le(self.ticks_offset)?;
        w.write_i64_le(self.clock_offset)?;

        let Some(icount) = &self.icount else {
            return w.write_u8(0);
        };
        w.write_u8(1)?;
        w.write_i64_le(icount.bias)?;
        w.write_i64_le(icount.icount)?;

        match &icount.warp {
            Some(warp) => {
                w.write_u8(1)?;
                w.write_i64_le(warp.warp_start)?;
                w.write_opt_i64_le(warp.deadline)?;
            }
            None => w.write_u8(0)?,
        }

        match &icount.adjust {
            Some(adjust) => {
                w.write_u8(1)?;
                w.write_opt_i64_le(adjust.rt_deadline)?;
                w.write_opt_i64_le(adjust.vm_deadline)?;
            }
            None => w.write_u8(0)?,
        }
        Ok(())
    }

    pub fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != TIMERS_SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != TIMERS_SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let ticks_offset = r.read_i64_le()?;
        let clock_offset = r.read_i64_le()?;

        let icount = if r.read_bool("icount subsection flag")? {
            let bias = r.read_i64_le()?;
            let icount = r.read_i64_le()?;
            let warp = if r.read_bool("warp subsection flag")? {
                Some(WarpTimerSnapshot {
                    warp_start: r.read_i64_le()?,
                    deadline: r.read_opt_i64_le("warp deadline flag")?,
                })
            } else {
                None
            };
            let adjust = if r.read_bool("adjust subsection flag")? {
                Some(AdjustTimersSnapshot {
                    rt_deadline: r.read_opt_i64_le("rt deadline flag")?,
                    vm_deadline: r.read_opt_i64_le("vm deadline flag")?,
                })
            } else {
                None
            };
            Some(IcountSnapshot {
                bias,
                icount,
                warp,
                adjust,
            })
        } else {
            None
        };

        Ok(Self {
            ticks_offset,
            clock_offset,
            icount,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let snap = Self::decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(SnapshotError::Corrupt("trailing bytes"));
        }
        Ok(snap)
    }
}

impl VmClock {
    /// Capture the persisted clock state.
    ///
    /// Offsets are reported as if ticks were disabled at this instant, so a snapshot taken from a
    /// running VM restores to the virtual time at which it was taken.
    pub fn save(&self, timers: &ClockTimers) -> TimersSnapshot {
        let (ticks_offset, clock_offset, bias, icount, warp_start) = self.seq.read(|| {
            let mut ticks_offset = self.ticks_offset.load(Ordering::SeqCst);
            if self.ticks_enabled.load(Ordering::SeqCst) {
                ticks_offset = ticks_offset.wrapping_add(self.host.ticks());
            }
            (
                ticks_offset,
                self.clock_locked(),
                self.icount_bias.load(Ordering::SeqCst),
                self.icount.load(Ordering::SeqCst),
                self.warp_start.load(Ordering::SeqCst),
            )
        });

        let icount = self.use_icount().then(|| IcountSnapshot {
            bias,
            icount,
            warp: self.icount_config.sleep.then(|| WarpTimerSnapshot {
                warp_start,
                deadline: timers.vm_rt.deadline(TimerId::ICOUNT_WARP),
            }),
            adjust: self
                .icount_config
                .is_adaptive()
                .then(|| AdjustTimersSnapshot {
                    rt_deadline: timers.vm_rt.deadline(TimerId::ICOUNT_RT),
                    vm_deadline: timers.vm.deadline(TimerId::ICOUNT_VM),
                }),
        });

        TimersSnapshot {
            ticks_offset,
            clock_offset,
            icount,
        }
    }

    /// Load persisted clock state. The scheduler's own timers are re-armed from the snapshot.
    #[track_caller]
    pub fn restore(&self, snap: &TimersSnapshot, timers: &mut ClockTimers) -> Result<()> {
        assert_bql_held();
        if snap.icount.is_some() != self.use_icount() {
            return Err(SnapshotError::IcountMismatch {
                snapshot: snap.icount.is_some(),
                clock: self.use_icount(),
            });
        }

        self.seq.write(|| {
            let (mut ticks_offset, mut clock_offset) = (snap.ticks_offset, snap.clock_offset);
            if self.ticks_enabled.load(Ordering::SeqCst) {
                ticks_offset = ticks_offset.wrapping_sub(self.host.ticks());
                clock_offset = clock_offset.wrapping_sub(self.host.now_ns());
            }
            self.ticks_offset.store(ticks_offset, Ordering::SeqCst);
            self.clock_offset.store(clock_offset, Ordering::SeqCst);
            // Restoring is a deliberate discontinuity; do not clamp against the old timeline.
            self.ticks_prev.store(0, Ordering::SeqCst);

            if let Some(icount) = &snap.icount {
                self.icount_bias.store(icount.bias, Ordering::SeqCst);
                self.icount.store(icount.icount, Ordering::SeqCst);
                if let Some(warp) = &icount.warp {
                    self.warp_start.store(warp.warp_start, Ordering::SeqCst);
                }
            }
        });

        if let Some(icount) = &snap.icount {
            if let Some(warp) = &icount.warp {
                restore_timer(timers, TimerId::ICOUNT_WARP, warp.deadline, true);
            }
            if let Some(adjust) = &icount.adjust {
                restore_timer(timers, TimerId::ICOUNT_RT, adjust.rt_deadline, true);
                restore_timer(timers, TimerId::ICOUNT_VM, adjust.vm_deadline, false);
            }
        }
        tracing::debug!(
            ticks_offset = snap.ticks_offset,
            clock_offset = snap.clock_offset,
            icount = snap.icount.is_some(),
            "timers state restored"
        );
        Ok(())
    }
}

fn restore_timer(timers: &mut ClockTimers, id: TimerId, deadline: Option<i64>, rt: bool) {
    let queue = if rt { &mut timers.vm_rt } else { &mut timers.vm };
    match deadline {
        Some(deadline) => queue.arm(id, deadline),
        None => {
            queue.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use cpuloop_sync::Bql;
    use pretty_assertions::assert_eq;

    use crate::clock::WARP_INACTIVE;
    use crate::host::FakeHostClock;
    use crate::icount::IcountConfig;

    fn sample() -> TimersSnapshot {
        TimersSnapshot {
            ticks_offset: 123,
            clock_offset: -456,
            icount: Some(IcountSnapshot {
                bias: 7,
                icount: 1 << 40,
                warp: Some(WarpTimerSnapshot {
                    warp_start: WARP_INACTIVE,
                    deadline: None,
                }),
                adjust: Some(AdjustTimersSnapshot {
                    rt_deadline: Some(1_000_000_000),
                    vm_deadline: Some(100_000_000),
                }),
            }),
        }
    }

    #[test]
    fn encoding_is_stable() {
        let snap = TimersSnapshot {
            ticks_offset: 1,
            clock_offset: 2,
            icount: None,
        };
        let bytes = snap.to_bytes().unwrap();
        let mut expected = b"CLKT".to_vec();
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(&1i64.to_le_bytes());
        expected.extend_from_slice(&2i64.to_le_bytes());
        expected.push(0);
        assert_eq!(bytes, expected);

        let full = sample();
        assert_eq!(TimersSnapshot::from_bytes(&full.to_bytes().unwrap()).unwrap(), full);
    }

    #[test]
    fn decode_rejects_bad_headers_and_trailing_data() {
        let mut bytes = sample().to_bytes().unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            TimersSnapshot::from_bytes(&bad_magic),
            Err(SnapshotError::InvalidMagic)
        ));

        let mut bad_version = bytes.clone();
        bad_version[4] = 9;
        assert!(matches!(
            TimersSnapshot::from_bytes(&bad_version),
            Err(SnapshotError::UnsupportedVersion(9))
        ));

        bytes.push(0);
        assert!(matches!(
            TimersSnapshot::from_bytes(&bytes),
            Err(SnapshotError::Corrupt("trailing bytes"))
        ));
    }

    #[test]
    fn restore_reproduces_virtual_time() {
        let bql = Bql::new(());
        let host = Arc::new(FakeHostClock::new());
        let source = VmClock::new(host.clone(), IcountConfig::adaptive());
        let mut source_timers = ClockTimers::new();
        let _guard = bql.lock();

        source.enable_ticks();
        source.arm_adjust_timers(&mut source_timers);
        host.advance(Duration::from_millis(40));
        source.account_executed(5_000);
        let snap = source.save(&source_timers);
        assert_eq!(snap.clock_offset, 40_000_000);
        assert!(snap.icount.and_then(|i| i.adjust).is_some());

        let target_host = Arc::new(FakeHostClock::new());
        target_host.advance(Duration::from_secs(3));
        let target = VmClock::new(target_host.clone(), IcountConfig::adaptive());
        let mut target_timers = ClockTimers::new();
        target.restore(&snap, &mut target_timers).unwrap();
        target.enable_ticks();

        assert_eq!(target.get_clock(), source.get_clock());
        assert_eq!(target.get_icount(), source.get_icount());
        assert_eq!(
            target_timers.vm.deadline(TimerId::ICOUNT_VM),
            source_timers.vm.deadline(TimerId::ICOUNT_VM)
        );
    }

    #[test]
    fn restore_rejects_icount_mismatch() {
        let bql = Bql::new(());
        let host = Arc::new(FakeHostClock::new());
        let clock = VmClock::new(host, IcountConfig::default());
        let _guard = bql.lock();
        let err = clock
            .restore(&sample(), &mut ClockTimers::new())
            .unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::IcountMismatch {
                snapshot: true,
                clock: false
            }
        ));
    }
}
