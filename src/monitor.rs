// TORPOR MONITOR LOOP
// THE LIVE SIDE OF THE GOVERNOR. PER TICK AND PER CPU: DERIVE THE LAST
// OBSERVED RESIDENCY FROM CPUIDLE SYSFS DELTAS, REFLECT THE DOMINANT
// ENTERED STATE, RUN SELECT, OPTIONALLY FENCE THE KERNEL TO THE CHOSEN
// CEILING BY DISABLING EVERYTHING DEEPER.
//
// THE DECISION CORE IS EXACTLY THE CODE THE OFFLINE SUITES PROVE; THIS
// LOOP ONLY FEEDS IT MEASUREMENTS AND APPLIES ITS PICKS.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use torpor::driver::{enforce_ceiling, release_ceiling, CpuidleSample, Device, IdleDriver};
use torpor::event::EventLog;
use torpor::governor::CpuGovernor;
use torpor::platform::{parse_cpu_list_count, SysPlatform};
use torpor::tunables::Tunables;
use torpor::{log_info, log_warn};

pub struct MonitorConfig {
    pub tick_ms: u64,
    pub deep_threshold_us: u64,
    pub shallow_threshold_us: u64,
    pub enforce: bool,
    pub park: bool,
    pub dump_log: bool,
    pub verbose: bool,
}

pub fn run(cfg: &MonitorConfig, shutdown: &AtomicBool) -> Result<()> {
    let nr_cpus = present_cpus();
    let drv = IdleDriver::from_sysfs(0).context("enumerating the C-state ladder")?;
    let state_count = drv.state_count();
    let tick_us = cfg.tick_ms * 1_000;

    let tunables = Arc::new(Tunables::new(
        cfg.deep_threshold_us,
        cfg.shallow_threshold_us,
    ));
    let mut platform = SysPlatform::new(nr_cpus, tick_us, cfg.park);

    println!(
        "GOVERNOR:        {} (rating {})",
        torpor::GOVERNOR_NAME,
        torpor::GOVERNOR_RATING
    );
    println!("CPUS:            {}", nr_cpus);
    println!(
        "STATES:          {}",
        drv.states
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!("COUNTERS:        {}", platform.counter_source());
    println!("TICK:            {}ms", cfg.tick_ms);
    println!(
        "THRESHOLDS:      deep={}us shallow={}us",
        cfg.deep_threshold_us, cfg.shallow_threshold_us
    );
    println!("ENFORCE:         {}", cfg.enforce);
    println!("PARK:            {}", cfg.park);
    println!();

    let mut devs = Vec::with_capacity(nr_cpus as usize);
    let mut govs = Vec::with_capacity(nr_cpus as usize);
    for cpu in 0..nr_cpus {
        let dev = Device::new(cpu, state_count);
        let mut gov = CpuGovernor::new(cpu, Arc::clone(&tunables));
        gov.enable(&dev, &platform);
        if let Err(e) = platform.install_wake_timer(cpu, Arc::clone(&gov.flags)) {
            log_warn!("cpu{}: wake timer unavailable: {}", cpu, e);
        }
        devs.push(dev);
        govs.push(gov);
    }

    let mut prev: Vec<CpuidleSample> = Vec::with_capacity(nr_cpus as usize);
    for cpu in 0..nr_cpus {
        prev.push(CpuidleSample::take(cpu, state_count)?);
    }

    let mut log = EventLog::new();
    let mut enforce = cfg.enforce;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(cfg.tick_ms));

        for cpu in 0..nr_cpus as usize {
            let cur = match CpuidleSample::take(cpu as u32, state_count) {
                Ok(s) => s,
                Err(e) => {
                    log_warn!("cpu{}: cpuidle sample failed: {}", cpu, e);
                    continue;
                }
            };

            // NO IDLE ENTRY IN THE WINDOW: NOTHING TO REFLECT OR PICK ON
            if let Some((entered, mean_residency_us)) = cur.dominant_since(&prev[cpu]) {
                devs[cpu].set_last_residency(mean_residency_us);
                govs[cpu].reflect(entered as i32, &platform);
                let chosen = govs[cpu].select(&drv, &devs[cpu], &platform);

                if enforce && chosen >= 0 {
                    if let Err(e) = enforce_ceiling(cpu as u32, chosen as usize, state_count) {
                        log_warn!("ceiling enforcement disabled: {}", e);
                        enforce = false;
                    }
                }
            }
            prev[cpu] = cur;
        }

        let rounds: u64 = govs.iter().map(|g| g.total).sum();
        let arms: u64 = govs.iter().map(|g| g.timer_arms).sum();
        let inmature: u64 = govs.iter().map(|g| g.inmature).sum();
        let resets: u64 = govs.iter().map(|g| g.weight_resets).sum();
        let g0 = &govs[0];

        println!(
            "rounds: {:<8} pred: {:<6}us meas: {:<6}us ia: {:<6}us arms: {:<5} imm: {:<5} resets: {:<4} park: {}/{} w: {:?} state: {}",
            rounds,
            g0.predicted_us,
            g0.measured_us,
            g0.interarrival_us,
            arms,
            inmature,
            resets,
            platform.park_hints.load(Ordering::Relaxed),
            platform.unpark_hints.load(Ordering::Relaxed),
            g0.weights,
            g0.last_state_idx,
        );

        if cfg.verbose {
            for (cpu, g) in govs.iter().enumerate() {
                println!(
                    "  cpu{}: pred={}us meas={}us pending={}us ia={}us attendees={} strict={} net={}",
                    cpu,
                    g.predicted_us,
                    g.measured_us,
                    g.pending_us,
                    g.interarrival_us,
                    g.attendees,
                    g.strict_latency,
                    g.network_activity,
                );
            }
        }

        log.snapshot(
            rounds,
            g0.predicted_us,
            g0.measured_us,
            arms,
            inmature,
            resets,
            g0.weights,
        );
    }

    if cfg.enforce {
        log_info!("releasing state ceilings");
        for cpu in 0..nr_cpus {
            let _ = release_ceiling(cpu, state_count);
        }
    }

    if cfg.dump_log {
        log.dump();
    }
    log.summary();
    Ok(())
}

fn present_cpus() -> u32 {
    std::fs::read_to_string("/sys/devices/system/cpu/present")
        .ok()
        .map(|s| parse_cpu_list_count(&s))
        .filter(|&n| n > 0)
        .unwrap_or(1)
}
