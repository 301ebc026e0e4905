// TORPOR SIMULATION
// DETERMINISTIC OFFLINE REPLAY OF THE FULL DECISION LOOP. SimPlatform
// IS A SCRIPTED STAND-IN FOR THE LIVE SYSTEM: MANUAL CLOCK, COUNTER
// RATES INTEGRATED OVER advance(), WAKE TIMERS FIRED AT THEIR EXACT
// DEADLINE. THE sim SUBCOMMAND AND EVERY INTEGRATION SUITE DRIVE THE
// SAME HARNESS, SO WHAT THE TESTS PROVE IS WHAT THE DEMO SHOWS.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::driver::{Device, IdleDriver};
use crate::experts::NR_EXPERTS;
use crate::governor::CpuGovernor;
use crate::platform::Platform;
use crate::tunables::Tunables;
use crate::wake::WakeFlags;

pub struct SimPlatform {
    now: Cell<u64>,
    sleep_length: Cell<u64>,
    nr_iowaiters: Cell<u64>,
    ttwu: RefCell<Vec<u64>>,
    net_reqs: Cell<u64>,
    epoll_events: Cell<u64>,
    woke: RefCell<Vec<bool>>,
    online: Cell<u32>,

    // (TTWU, NET_REQS, EPOLL) PER SECOND, INTEGRATED OVER advance()
    rates: Cell<(u64, u64, u64)>,
    rate_accum: Cell<(u64, u64, u64)>,

    // ABSOLUTE DEADLINE PER CPU
    armed: RefCell<Vec<Option<u64>>>,
    flags: RefCell<Vec<Option<Arc<WakeFlags>>>>,

    pub rq_hints: RefCell<Vec<(u32, bool)>>,
    pub arms: Cell<u64>,
    pub cancels: Cell<u64>,
}

impl SimPlatform {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            now: Cell::new(0),
            sleep_length: Cell::new(1_000_000),
            nr_iowaiters: Cell::new(0),
            ttwu: RefCell::new(vec![0; nr_cpus]),
            net_reqs: Cell::new(0),
            epoll_events: Cell::new(0),
            woke: RefCell::new(vec![false; nr_cpus]),
            online: Cell::new(nr_cpus as u32),
            rates: Cell::new((0, 0, 0)),
            rate_accum: Cell::new((0, 0, 0)),
            armed: RefCell::new(vec![None; nr_cpus]),
            flags: RefCell::new(vec![None; nr_cpus]),
            rq_hints: RefCell::new(Vec::new()),
            arms: Cell::new(0),
            cancels: Cell::new(0),
        }
    }

    pub fn install_flags(&self, cpu: u32, flags: Arc<WakeFlags>) {
        self.flags.borrow_mut()[cpu as usize] = Some(flags);
    }

    pub fn set_sleep_length(&self, us: u64) {
        self.sleep_length.set(us);
    }

    pub fn set_iowaiters(&self, n: u64) {
        self.nr_iowaiters.set(n);
    }

    pub fn set_online(&self, n: u32) {
        self.online.set(n);
    }

    pub fn set_rates(&self, ttwu_per_sec: u64, reqs_per_sec: u64, events_per_sec: u64) {
        self.rates.set((ttwu_per_sec, reqs_per_sec, events_per_sec));
    }

    pub fn wake_task(&self, cpu: u32) {
        self.woke.borrow_mut()[cpu as usize] = true;
        self.ttwu.borrow_mut()[cpu as usize] += 1;
    }

    pub fn armed_deadline(&self, cpu: u32) -> Option<u64> {
        self.armed.borrow()[cpu as usize]
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    // ADVANCE THE CLOCK, INTEGRATE COUNTER RATES, FIRE DUE WAKE TIMERS
    pub fn advance(&self, dt_us: u64) {
        let (r_ttwu, r_reqs, r_events) = self.rates.get();
        let (mut a_ttwu, mut a_reqs, mut a_events) = self.rate_accum.get();

        a_ttwu += r_ttwu * dt_us;
        a_reqs += r_reqs * dt_us;
        a_events += r_events * dt_us;

        for t in self.ttwu.borrow_mut().iter_mut() {
            *t += a_ttwu / 1_000_000;
        }
        self.net_reqs.set(self.net_reqs.get() + a_reqs / 1_000_000);
        self.epoll_events.set(self.epoll_events.get() + a_events / 1_000_000);
        self.rate_accum
            .set((a_ttwu % 1_000_000, a_reqs % 1_000_000, a_events % 1_000_000));

        let now = self.now.get() + dt_us;
        self.now.set(now);

        let mut armed = self.armed.borrow_mut();
        let flags = self.flags.borrow();
        for (cpu, slot) in armed.iter_mut().enumerate() {
            if let Some(deadline) = *slot {
                if deadline <= now {
                    *slot = None;
                    if let Some(f) = flags[cpu].as_ref() {
                        f.on_expiry();
                    }
                }
            }
        }
    }
}

impl Platform for SimPlatform {
    fn now_us(&self) -> u64 {
        self.now.get()
    }

    fn sleep_length_us(&self, _cpu: u32) -> u64 {
        self.sleep_length.get()
    }

    fn iowait_load(&self, _cpu: u32) -> (u64, u64) {
        (self.nr_iowaiters.get(), 0)
    }

    fn nr_ttwu(&self, cpu: u32) -> u64 {
        self.ttwu.borrow()[cpu as usize]
    }

    fn net_reqs(&self) -> u64 {
        self.net_reqs.get()
    }

    fn epoll_events(&self) -> u64 {
        self.epoll_events.get()
    }

    fn tasks_woke(&self, cpu: u32) -> bool {
        self.woke.borrow()[cpu as usize]
    }

    fn reset_tasks_woke(&self, cpu: u32) {
        self.woke.borrow_mut()[cpu as usize] = false;
    }

    fn num_online_cpus(&self) -> u32 {
        self.online.get()
    }

    fn set_rq_online(&self, cpu: u32, online: bool) {
        self.rq_hints.borrow_mut().push((cpu, online));
    }

    fn arm_wake_timer(&self, cpu: u32, delay_us: u64) {
        self.armed.borrow_mut()[cpu as usize] = Some(self.now.get() + delay_us);
        self.arms.set(self.arms.get() + 1);
    }

    fn cancel_wake_timer(&self, cpu: u32) {
        self.armed.borrow_mut()[cpu as usize] = None;
        self.cancels.set(self.cancels.get() + 1);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WakeCause {
    Arrival,
    SchedTimer,
    WakeTimer,
}

pub struct RoundOutcome {
    pub state_idx: i32,
    pub slept_us: u64,
    pub cause: WakeCause,
}

// FULL PER-CPU GOVERNOR STACK OVER SimPlatform
pub struct SimHarness {
    pub platform: SimPlatform,
    pub drv: IdleDriver,
    pub tunables: Arc<Tunables>,
    pub devs: Vec<Device>,
    pub govs: Vec<CpuGovernor>,
}

impl SimHarness {
    pub fn new(nr_cpus: usize) -> Self {
        let platform = SimPlatform::new(nr_cpus);
        let drv = IdleDriver::synthetic();
        let tunables = Arc::new(Tunables::default());

        let mut devs = Vec::with_capacity(nr_cpus);
        let mut govs = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus as u32 {
            let dev = Device::new(cpu, drv.state_count());
            let mut gov = CpuGovernor::new(cpu, Arc::clone(&tunables));
            gov.enable(&dev, &platform);
            platform.install_flags(cpu, Arc::clone(&gov.flags));
            devs.push(dev);
            govs.push(gov);
        }

        Self {
            platform,
            drv,
            tunables,
            devs,
            govs,
        }
    }

    // ONE IDLE CYCLE: SELECT, SLEEP UNTIL THE FIRST WAKE SOURCE FIRES,
    // REFLECT. arrival_in_us IS THE NEXT EXTERNAL EVENT, None = QUIET.
    pub fn round(&mut self, cpu: usize, arrival_in_us: Option<u64>) -> RoundOutcome {
        let gov = &mut self.govs[cpu];
        let dev = &mut self.devs[cpu];

        let state_idx = gov.select(&self.drv, dev, &self.platform);
        let state = state_idx.max(0) as usize;

        let mut slept_us = gov.next_timer_us;
        let mut cause = WakeCause::SchedTimer;
        if let Some(a) = arrival_in_us {
            if a < slept_us {
                slept_us = a;
                cause = WakeCause::Arrival;
            }
        }
        if let Some(deadline) = self.platform.armed_deadline(cpu as u32) {
            let rel = deadline.saturating_sub(self.platform.now());
            if rel < slept_us {
                slept_us = rel;
                cause = WakeCause::WakeTimer;
            }
        }

        self.platform.advance(slept_us);
        if cause == WakeCause::Arrival {
            self.platform.wake_task(cpu as u32);
        }

        let exit_latency = self.drv.states[state].exit_latency_us;
        dev.set_last_residency(slept_us + exit_latency);
        gov.reflect(state_idx, &self.platform);

        RoundOutcome {
            state_idx,
            slept_us,
            cause,
        }
    }
}

pub struct SimReport {
    pub scenario: String,
    pub rounds: u64,
    pub state_hist: Vec<u64>,
    pub timer_arms: u64,
    pub inmature: u64,
    pub weight_resets: u64,
    pub final_weights: [u64; NR_EXPERTS],
    pub avg_predicted_us: u64,
    pub avg_measured_us: u64,
}

// NAMED SCENARIOS FOR THE sim SUBCOMMAND
pub fn run_scenario(name: &str, rounds: u64) -> Result<SimReport> {
    let mut h = SimHarness::new(2);
    let mut pred_sum = 0u64;
    let mut meas_sum = 0u64;
    let mut hist = vec![0u64; h.drv.state_count()];

    let (rates, arrival): ((u64, u64, u64), Option<u64>) = match name {
        // NOTHING HAPPENS. DEEP SLEEP TERRITORY.
        "idle" => ((0, 0, 0), None),
        // 50us INTER-ARRIVAL STREAM: rate_sum = 2*5000 + 10000 = 20000/s.
        // shift IS THE SAME STREAM DYING HALFWAY THROUGH.
        "steady" | "shift" => ((10_000, 10_000, 5_000), Some(50)),
        // 600us INTER-ARRIVAL: rate_sum = 2*333 + 1000 = 1666/s
        "mixed" => ((1_000, 1_000, 333), Some(600)),
        _ => bail!("unknown scenario '{}' (idle, steady, mixed, shift)", name),
    };
    let shift = name == "shift";

    h.platform.set_sleep_length(1_000_000);
    h.platform.set_rates(rates.0, rates.1, rates.2);

    // ARRIVALS ARE AN ABSOLUTE STREAM: A SPURIOUS TIMER WAKE LEAVES
    // THE PENDING EVENT CLOSER, IT DOES NOT RESCHEDULE IT
    let mut interarrival = arrival;
    let mut next_arrival = interarrival.map(|ia| h.platform.now() + ia);

    for round in 0..rounds {
        if shift && round == rounds / 2 {
            h.platform.set_rates(0, 0, 0);
            interarrival = None;
            next_arrival = None;
        }
        let rel = next_arrival.map(|t| t.saturating_sub(h.platform.now()));
        let out = h.round(0, rel);
        if out.cause == WakeCause::Arrival {
            next_arrival = interarrival.map(|ia| h.platform.now() + ia);
        }
        let idx = out.state_idx.max(0) as usize;
        hist[idx] += 1;
        pred_sum += h.govs[0].predicted_us;
        meas_sum += h.govs[0].measured_us;
    }

    let g = &h.govs[0];
    Ok(SimReport {
        scenario: name.to_string(),
        rounds,
        state_hist: hist,
        timer_arms: g.timer_arms,
        inmature: g.inmature,
        weight_resets: g.weight_resets,
        final_weights: g.weights,
        avg_predicted_us: pred_sum / rounds.max(1),
        avg_measured_us: meas_sum / rounds.max(1),
    })
}
