#![forbid(unsafe_code)]

// Native-only runner. Keep a stub `main` so `--target wasm32-unknown-unknown --workspace` builds.
#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use anyhow::{Context, Result};
    use clap::Parser;
    use cpuloop_sched::{
        CpuInfo, DummyAccel, DummyMode, RunState, SchedConfig, SchedGuard, Scheduler,
    };
    use cpuloop_time::{
        ClockType, DriftInfo, IcountConfig, StdHostClock, TimerId, TimersSnapshot,
    };
    use serde::Serialize;
    use tracing_subscriber::EnvFilter;

    #[derive(Debug, Parser)]
    #[command(
        name = "cpuloop",
        about = "Boot dummy vCPUs on the scheduler, run for a while, pause and report"
    )]
    pub struct Args {
        /// Number of vCPUs.
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..=256))]
        smp: u32,

        /// Instruction-counted virtual time: `shift=<N|auto>[,sleep=on|off][,align=on|off]`.
        #[arg(long)]
        icount: Option<IcountConfig>,

        /// Throttle guest execution by this percentage (clamped to 1..=99).
        #[arg(long)]
        throttle: Option<i64>,

        /// Host milliseconds to run before pausing.
        #[arg(long, default_value_t = 100)]
        run_ms: u64,

        /// Period of the demo timer on the virtual clock, in milliseconds.
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        tick_ms: u64,

        /// Keep vCPUs spinning in their slices instead of halting.
        #[arg(long)]
        busy: bool,

        /// Write the timers snapshot taken after pausing to this file.
        #[arg(long)]
        snapshot_out: Option<PathBuf>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    }

    #[derive(Debug, Serialize)]
    struct Report {
        run_state: RunState,
        vcpus: Vec<CpuInfo>,
        virtual_ns: i64,
        virtual_rt_ns: i64,
        icount_shift: Option<u32>,
        drift: Option<DriftInfo>,
        throttle_percentage: u32,
        ticks_fired: u64,
        snapshot: TimersSnapshot,
    }

    pub fn main() -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();

        let args = Args::parse();
        let config = SchedConfig {
            icount: args.icount.unwrap_or_default(),
            ..SchedConfig::default()
        };
        let mode = if args.busy {
            DummyMode::Busy
        } else {
            DummyMode::Idle
        };
        let sched = Scheduler::new(
            config,
            Arc::new(DummyAccel::new(mode)),
            Arc::new(StdHostClock::new()),
        );

        let mut guard = sched.lock();
        for _ in 0..args.smp {
            sched
                .create_vcpu(&mut guard)
                .context("failed to create vCPU")?;
        }

        sched.vm_start(&mut guard);
        if let Some(pct) = args.throttle {
            sched.throttle_set(&mut guard, pct);
        }

        let tick_ns = i64::try_from(args.tick_ms)
            .ok()
            .and_then(|ms| ms.checked_mul(1_000_000))
            .context("tick period overflow")?;
        let tick = guard.timers_mut().alloc_id();
        let first = sched.clock().virtual_ns() + tick_ns;
        sched.timer_mod(&mut guard, ClockType::Virtual, tick, first);

        let mut ticks_fired = 0u64;
        let run_for = Duration::from_millis(args.run_ms);
        let started = Instant::now();
        while let Some(left) = run_for.checked_sub(started.elapsed()) {
            sched
                .main_loop_wait(&mut guard, left, |guard, _, id| {
                    on_tick(&sched, guard, tick, tick_ns, id, &mut ticks_fired)
                })
                .context("main loop failed")?;
        }

        sched
            .vm_stop(&mut guard, RunState::Paused)
            .context("failed to stop the VM")?;

        let snapshot = sched.clock().save(guard.timers());
        if let Some(path) = &args.snapshot_out {
            let bytes = snapshot.to_bytes().context("failed to encode timers snapshot")?;
            std::fs::write(path, bytes)
                .with_context(|| format!("failed to write snapshot: {}", path.display()))?;
        }

        let report = Report {
            run_state: guard.run_state(),
            vcpus: sched.query_cpus(&guard),
            virtual_ns: sched.clock().virtual_ns(),
            virtual_rt_ns: sched.clock().get_clock(),
            icount_shift: sched.clock().use_icount().then(|| sched.clock().time_shift()),
            drift: sched.clock().drift_info(),
            throttle_percentage: sched.throttle_get_percentage(),
            ticks_fired,
            snapshot,
        };

        sched
            .remove_all_vcpus(&mut guard)
            .context("failed to tear down vCPUs")?;
        drop(guard);

        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }
        Ok(())
    }

    fn on_tick(
        sched: &Scheduler,
        guard: &mut SchedGuard<'_>,
        tick: TimerId,
        tick_ns: i64,
        id: TimerId,
        fired: &mut u64,
    ) {
        if id != tick {
            return;
        }
        *fired += 1;
        let next = sched.clock().virtual_ns() + tick_ns;
        sched.timer_mod(guard, ClockType::Virtual, tick, next);
    }

    fn print_report(report: &Report) {
        println!("run state: {:?}", report.run_state);
        println!("virtual clock: {} ns", report.virtual_ns);
        println!("virtual-rt clock: {} ns", report.virtual_rt_ns);
        match report.icount_shift {
            Some(shift) => println!("icount shift: {shift}"),
            None => println!("icount: off"),
        }
        if let Some(drift) = &report.drift {
            println!("host - guest clock: {} ms", drift.host_minus_guest_ns / 1_000_000);
            match drift.max_delay_ns {
                Some(ns) => println!("max guest delay: {} ms", ns / 1_000_000),
                None => println!("max guest delay: n/a"),
            }
            match drift.max_advance_ns {
                Some(ns) => println!("max guest advance: {} ms", ns / 1_000_000),
                None => println!("max guest advance: n/a"),
            }
        }
        println!("throttle: {}%", report.throttle_percentage);
        println!("ticks fired: {}", report.ticks_fired);
        for cpu in &report.vcpus {
            println!(
                "{}: halted={} stopped={} kicks={}{}",
                cpu.thread_name,
                cpu.halted,
                cpu.stopped,
                cpu.kicks,
                if cpu.current { " (current)" } else { "" }
            );
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
