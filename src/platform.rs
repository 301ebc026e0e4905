// TORPOR PLATFORM CAPABILITY
// THE NARROW SEAM BETWEEN THE DECISION CORE AND THE REST OF THE BOX:
// CLOCK, SLEEP HORIZON, SCHEDULER COUNTERS, PARK/UNPARK HINT, WAKE
// TIMER ARMING. THE GOVERNOR SEES NOTHING ELSE OF THE SYSTEM, SO THE
// WHOLE CORE RUNS OFFLINE AGAINST SimPlatform WITH IDENTICAL SEMANTICS.
//
// SysPlatform IS THE LIVE SIDE. SCHEDULER COUNTERS COME FROM PER-CPU
// BPF MAPS PINNED BY AN EXTERNAL COLLECTOR; WHEN THE PINS ARE ABSENT
// IT FALLS BACK TO /proc/stat AND /proc/softirqs DELTAS. PARK HINTS
// BECOME CPU HOTPLUG WRITES, GATED BEHIND --park.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use libbpf_rs::{MapCore, MapFlags, MapHandle};

use crate::wake::{WakeFlags, WakeTimer};

pub trait Platform {
    fn now_us(&self) -> u64;
    fn sleep_length_us(&self, cpu: u32) -> u64;
    // (nr_iowaiters, cpu_load)
    fn iowait_load(&self, cpu: u32) -> (u64, u64);
    fn nr_ttwu(&self, cpu: u32) -> u64;
    fn net_reqs(&self) -> u64;
    fn epoll_events(&self) -> u64;
    fn tasks_woke(&self, cpu: u32) -> bool;
    fn reset_tasks_woke(&self, cpu: u32);
    fn num_online_cpus(&self) -> u32;
    fn set_rq_online(&self, cpu: u32, online: bool);
    fn arm_wake_timer(&self, cpu: u32, delay_us: u64);
    fn cancel_wake_timer(&self, cpu: u32);
}

const PIN_DIR: &str = "/sys/fs/bpf/torpor";
const TTWU_PIN: &str = "/sys/fs/bpf/torpor/nr_ttwu";
const NET_REQS_PIN: &str = "/sys/fs/bpf/torpor/net_reqs";
const EPOLL_PIN: &str = "/sys/fs/bpf/torpor/epoll_events";

pub struct SysPlatform {
    nr_cpus: u32,
    tick_us: u64,
    park: bool,

    // PINNED COUNTER MAPS FROM THE EXTERNAL COLLECTOR (OPTIONAL)
    ttwu_map: Option<MapHandle>,
    net_reqs_map: Option<MapHandle>,
    epoll_map: Option<MapHandle>,

    // PER-CPU CONTEXT-SWITCH ANCHOR FOR THE tasks_woke LATCH
    woke_anchor: Vec<AtomicU64>,

    timers: Vec<Option<WakeTimer>>,

    pub park_hints: AtomicU64,
    pub unpark_hints: AtomicU64,
}

impl SysPlatform {
    pub fn new(nr_cpus: u32, tick_us: u64, park: bool) -> Self {
        Self {
            nr_cpus,
            tick_us,
            park,
            ttwu_map: MapHandle::from_pinned_path(TTWU_PIN).ok(),
            net_reqs_map: MapHandle::from_pinned_path(NET_REQS_PIN).ok(),
            epoll_map: MapHandle::from_pinned_path(EPOLL_PIN).ok(),
            woke_anchor: (0..nr_cpus).map(|_| AtomicU64::new(0)).collect(),
            timers: (0..nr_cpus).map(|_| None).collect(),
            park_hints: AtomicU64::new(0),
            unpark_hints: AtomicU64::new(0),
        }
    }

    pub fn counter_source(&self) -> &'static str {
        if self.ttwu_map.is_some() && self.net_reqs_map.is_some() && self.epoll_map.is_some() {
            "bpf pinned maps"
        } else {
            "/proc fallback"
        }
    }

    pub fn install_wake_timer(&mut self, cpu: u32, flags: Arc<WakeFlags>) -> Result<()> {
        self.timers[cpu as usize] = Some(WakeTimer::spawn(cpu, flags)?);
        Ok(())
    }

    pub fn pin_dir() -> &'static str {
        PIN_DIR
    }

    fn ctxt(&self) -> u64 {
        let stat = fs::read_to_string("/proc/stat").unwrap_or_default();
        parse_stat_value(&stat, "ctxt").unwrap_or(0)
    }
}

impl Platform for SysPlatform {
    fn now_us(&self) -> u64 {
        now_us()
    }

    // THE MONITOR TICK IS THE DAEMON'S SCHEDULING HORIZON
    fn sleep_length_us(&self, _cpu: u32) -> u64 {
        self.tick_us
    }

    fn iowait_load(&self, _cpu: u32) -> (u64, u64) {
        let stat = fs::read_to_string("/proc/stat").unwrap_or_default();
        (parse_stat_value(&stat, "procs_blocked").unwrap_or(0), 0)
    }

    fn nr_ttwu(&self, cpu: u32) -> u64 {
        if let Some(v) = self.ttwu_map.as_ref().and_then(|m| map_u64(m, cpu)) {
            return v;
        }
        // FALLBACK: PER-CPU SCHED SOFTIRQ COUNT TRACKS WAKE PRESSURE
        let softirqs = fs::read_to_string("/proc/softirqs").unwrap_or_default();
        parse_softirq_row(&softirqs, "SCHED")
            .get(cpu as usize)
            .copied()
            .unwrap_or(0)
    }

    fn net_reqs(&self) -> u64 {
        if let Some(v) = self.net_reqs_map.as_ref().and_then(|m| map_u64(m, 0)) {
            return v;
        }
        self.ctxt()
    }

    fn epoll_events(&self) -> u64 {
        if let Some(v) = self.epoll_map.as_ref().and_then(|m| map_u64(m, 0)) {
            return v;
        }
        // FALLBACK: NET_RX SOFTIRQS ACROSS ALL CPUS
        let softirqs = fs::read_to_string("/proc/softirqs").unwrap_or_default();
        parse_softirq_row(&softirqs, "NET_RX").iter().sum()
    }

    fn tasks_woke(&self, cpu: u32) -> bool {
        self.ctxt() != self.woke_anchor[cpu as usize].load(Ordering::Relaxed)
    }

    fn reset_tasks_woke(&self, cpu: u32) {
        self.woke_anchor[cpu as usize].store(self.ctxt(), Ordering::Relaxed);
    }

    fn num_online_cpus(&self) -> u32 {
        fs::read_to_string("/sys/devices/system/cpu/online")
            .ok()
            .map(|s| parse_cpu_list_count(&s))
            .filter(|&n| n > 0)
            .unwrap_or(self.nr_cpus)
    }

    fn set_rq_online(&self, cpu: u32, online: bool) {
        if online {
            self.unpark_hints.fetch_add(1, Ordering::Relaxed);
        } else {
            self.park_hints.fetch_add(1, Ordering::Relaxed);
        }
        // CPU 0 IS NEVER HOTPLUGGED
        if !self.park || cpu == 0 {
            return;
        }
        let path = format!("/sys/devices/system/cpu/cpu{}/online", cpu);
        let _ = fs::write(&path, if online { "1" } else { "0" });
    }

    fn arm_wake_timer(&self, cpu: u32, delay_us: u64) {
        if let Some(t) = self.timers.get(cpu as usize).and_then(|t| t.as_ref()) {
            t.arm(delay_us);
        }
    }

    fn cancel_wake_timer(&self, cpu: u32) {
        if let Some(t) = self.timers.get(cpu as usize).and_then(|t| t.as_ref()) {
            t.cancel();
        }
    }
}

pub fn now_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

fn map_u64(map: &MapHandle, key: u32) -> Option<u64> {
    let key = key.to_ne_bytes();
    match map.lookup(&key, MapFlags::ANY) {
        Ok(Some(v)) if v.len() >= 8 => Some(u64::from_ne_bytes(v[..8].try_into().ok()?)),
        _ => None,
    }
}

// "ctxt 123456789" -> 123456789
pub fn parse_stat_value(stat: &str, key: &str) -> Option<u64> {
    for line in stat.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some(key) {
            return fields.next()?.parse().ok();
        }
    }
    None
}

// "      NET_RX:     1234     5678" -> [1234, 5678]
pub fn parse_softirq_row(softirqs: &str, name: &str) -> Vec<u64> {
    let label = format!("{}:", name);
    for line in softirqs.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some(label.as_str()) {
            return fields.filter_map(|f| f.parse().ok()).collect();
        }
    }
    Vec::new()
}

// "0-3,5,7-8" -> 6
pub fn parse_cpu_list_count(list: &str) -> u32 {
    let mut count = 0u32;
    for range in list.trim().split(',') {
        let parts: Vec<&str> = range.split('-').collect();
        match parts.len() {
            1 => {
                if parts[0].parse::<u32>().is_ok() {
                    count += 1;
                }
            }
            2 => {
                if let (Ok(lo), Ok(hi)) = (parts[0].parse::<u32>(), parts[1].parse::<u32>()) {
                    if hi >= lo {
                        count += hi - lo + 1;
                    }
                }
            }
            _ => {}
        }
    }
    count
}
