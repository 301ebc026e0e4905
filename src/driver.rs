// TORPOR IDLE-STATE TABLE
// MODELS THE HARDWARE C-STATE LADDER THE SELECTOR SCANS: PER-STATE
// TARGET RESIDENCY, EXIT LATENCY AND DISABLE MASKS, PLUS THE PER-CPU
// DEVICE VIEW (USAGE DISABLES, LAST OBSERVED RESIDENCY).
//
// LIVE ENUMERATION READS /sys/devices/system/cpu/cpuN/cpuidle/state*.
// ENFORCEMENT STEERS THE KERNEL BY WRITING PER-STATE disable FILES SO
// NOTHING DEEPER THAN THE CHOSEN STATE IS AVAILABLE.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug)]
pub struct IdleState {
    pub name: String,
    pub target_residency_us: u64,
    pub exit_latency_us: u64,
    pub disabled: bool,
}

#[derive(Clone, Debug)]
pub struct IdleDriver {
    pub states: Vec<IdleState>,
    // FIRST NON-POLLING STATE. 1 WHEN STATE 0 IS THE POLL LOOP.
    pub state_start: usize,
}

impl IdleDriver {
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    // ENUMERATE THE C-STATE LADDER OF ONE CPU FROM SYSFS.
    // latency AND residency FILES ARE ALREADY IN MICROSECONDS.
    pub fn from_sysfs(cpu: u32) -> Result<Self> {
        let base = cpuidle_dir(cpu);
        if !base.exists() {
            bail!("no cpuidle sysfs for cpu{} (is CONFIG_CPU_IDLE set?)", cpu);
        }

        let mut states = Vec::new();
        for idx in 0.. {
            let dir = base.join(format!("state{}", idx));
            if !dir.exists() {
                break;
            }
            let name = read_trimmed(&dir.join("name"))?;
            let target_residency_us = read_u64(&dir.join("residency"))?;
            let exit_latency_us = read_u64(&dir.join("latency"))?;
            states.push(IdleState {
                name,
                target_residency_us,
                exit_latency_us,
                disabled: false,
            });
        }
        if states.is_empty() {
            bail!("cpu{} enumerated zero idle states", cpu);
        }

        let state_start = if states[0].name == "POLL" { 1 } else { 0 };
        Ok(Self {
            states,
            state_start,
        })
    }

    // FIXED LADDER FOR SIMULATION AND OFFLINE TESTS.
    // POLL / C1 / C1E / C3 / C6, RESIDENCY AND LATENCY IN LINE WITH A
    // GARDEN-VARIETY SERVER PART.
    pub fn synthetic() -> Self {
        let mk = |name: &str, res: u64, lat: u64| IdleState {
            name: name.to_string(),
            target_residency_us: res,
            exit_latency_us: lat,
            disabled: false,
        };
        Self {
            states: vec![
                mk("POLL", 0, 0),
                mk("C1", 2, 2),
                mk("C1E", 20, 10),
                mk("C3", 100, 33),
                mk("C6", 300, 133),
            ],
            state_start: 1,
        }
    }
}

// PER-CPU DEVICE VIEW OF THE DRIVER
pub struct Device {
    pub cpu: u32,
    pub usage_disable: Vec<bool>,
    last_residency_us: u64,
}

impl Device {
    pub fn new(cpu: u32, state_count: usize) -> Self {
        Self {
            cpu,
            usage_disable: vec![false; state_count],
            last_residency_us: 0,
        }
    }

    // RAW RESIDENCY OF THE LAST SLEEP, EXIT LATENCY INCLUDED.
    // THE EMBEDDING (MONITOR LOOP OR SIM HARNESS) STORES IT ON IDLE
    // EXIT; THE GOVERNOR'S UPDATE CONSUMES IT ON THE NEXT SELECT.
    pub fn get_last_residency(&self) -> u64 {
        self.last_residency_us
    }

    pub fn set_last_residency(&mut self, us: u64) {
        self.last_residency_us = us;
    }
}

// PER-TICK SNAPSHOT OF CUMULATIVE CPUIDLE COUNTERS (usage, time)
pub struct CpuidleSample {
    pub usage: Vec<u64>,
    pub time_us: Vec<u64>,
}

impl CpuidleSample {
    pub fn take(cpu: u32, state_count: usize) -> Result<Self> {
        let base = cpuidle_dir(cpu);
        let mut usage = Vec::with_capacity(state_count);
        let mut time_us = Vec::with_capacity(state_count);
        for idx in 0..state_count {
            let dir = base.join(format!("state{}", idx));
            usage.push(read_u64(&dir.join("usage"))?);
            time_us.push(read_u64(&dir.join("time"))?);
        }
        Ok(Self { usage, time_us })
    }

    // DOMINANT STATE ENTERED SINCE prev AND ITS MEAN RESIDENCY.
    // None WHEN THE CPU NEVER WENT IDLE IN THE WINDOW.
    pub fn dominant_since(&self, prev: &CpuidleSample) -> Option<(usize, u64)> {
        let mut best: Option<(usize, u64, u64)> = None;
        for i in 0..self.usage.len().min(prev.usage.len()) {
            let du = self.usage[i].wrapping_sub(prev.usage[i]);
            let dt = self.time_us[i].wrapping_sub(prev.time_us[i]);
            if du == 0 {
                continue;
            }
            match best {
                Some((_, u, _)) if du <= u => {}
                _ => best = Some((i, du, dt)),
            }
        }
        best.map(|(i, du, dt)| (i, dt / du.max(1)))
    }
}

// CEILING ENFORCEMENT: DISABLE EVERY STATE DEEPER THAN chosen,
// RE-ENABLE EVERYTHING AT OR BELOW IT.
pub fn enforce_ceiling(cpu: u32, chosen: usize, state_count: usize) -> Result<()> {
    for idx in 0..state_count {
        write_state_disable(cpu, idx, idx > chosen)?;
    }
    Ok(())
}

pub fn release_ceiling(cpu: u32, state_count: usize) -> Result<()> {
    for idx in 0..state_count {
        write_state_disable(cpu, idx, false)?;
    }
    Ok(())
}

fn write_state_disable(cpu: u32, state: usize, disabled: bool) -> Result<()> {
    let path = cpuidle_dir(cpu).join(format!("state{}/disable", state));
    fs::write(&path, if disabled { "1" } else { "0" })
        .with_context(|| format!("writing {}", path.display()))
}

fn cpuidle_dir(cpu: u32) -> PathBuf {
    PathBuf::from(format!("/sys/devices/system/cpu/cpu{}/cpuidle", cpu))
}

fn read_trimmed(path: &PathBuf) -> Result<String> {
    Ok(fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?
        .trim()
        .to_string())
}

fn read_u64(path: &PathBuf) -> Result<u64> {
    read_trimmed(path)?
        .parse::<u64>()
        .with_context(|| format!("parsing {}", path.display()))
}
