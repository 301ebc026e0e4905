// TORPOR PER-CPU GOVERNOR CORE
// SELECT / REFLECT / UPDATE AND THE EXPERT-ADVICE ENSEMBLE.
//
// ONE CpuGovernor PER LOGICAL CPU, NEVER SHARED ACROSS CPUS. THE ONLY
// STATE THE TIMER THREAD CAN TOUCH LIVES IN THE SHARED WakeFlags
// BLOCK; EVERYTHING ELSE IS PLAIN FIELDS OWNED BY THE DRIVING LOOP.
//
// SELECT ORDER PER ROUND:
//   PENDING UPDATE -> FLAG RESET -> EXPERT POLL -> WEIGHTED FUSE ->
//   CONSTRAINED STATE SCAN -> OPTIONAL PRE-EMPTIVE TIMER ARM.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::driver::{Device, IdleDriver};
use crate::exp::EXP;
use crate::experts::{BUCKETS, EXPERTS, NR_EXPERTS};
use crate::platform::Platform;
use crate::tunables::Tunables;
use crate::wake::WakeFlags;

pub const INITIAL_WEIGHT: u64 = 1000;
pub const MIN_WEIGHT: u64 = 5;
pub const ABSTAIN: i64 = -1;
// RETURNED WHEN EVERY EXPERT ABSTAINS (I2)
pub const FALLBACK_STATE: i32 = 1;

const MAX_LOSS: usize = 999;
// BELOW THIS HORIZON THE C1 DEFAULT IS NOT WORTH IT -- STAY POLLING
const POLL_CUTOFF_US: u64 = 5;
// MINIMUM USEFUL PRE-EMPTIVE TIMER INTERVAL
const MIN_WAKE_INTERVAL_US: u64 = 5;
// HORIZON CAP, MATCHES THE 32-BIT MICROSECOND SCALE OF THE STATE TABLE
const NEXT_TIMER_CAP_US: u64 = u32::MAX as u64;

pub struct CpuGovernor {
    pub cpu: u32,

    // ROUND STATE
    pub last_state_idx: i32,
    pub next_timer_us: u64,
    pub predicted_us: u64,
    pub measured_us: u64,
    pub pending_us: u64,
    pub attendees: u32,
    pub will_wake_with_timer: bool,
    pub strict_latency: bool,
    pub network_activity: bool,

    // ENSEMBLE. predictions HOLDS LAST ROUND'S RAW EXPERT OUTPUTS
    // UNTIL THE NEXT SELECT OVERWRITES THEM, SO THE DEFERRED WEIGHT
    // UPDATE SCORES EXACTLY THE ROUND THE MEASUREMENT BELONGS TO.
    pub weights: [u64; NR_EXPERTS],
    pub predictions: [i64; NR_EXPERTS],

    // COUNTERS
    pub total: u64,
    pub updates: u64,
    pub inmature: u64,
    pub timer_arms: u64,
    pub weight_resets: u64,

    // SHARED WITH THE TIMER THREAD (RELAXED ATOMICS ONLY)
    pub flags: Arc<WakeFlags>,
    pub tunables: Arc<Tunables>,

    // RESIDENCY EXPERT
    pub residency_ema_us: u64,

    // TIMER EXPERT
    pub bucket: usize,
    pub correction_factor: [u64; BUCKETS],

    // NETWORK EXPERT
    pub before_ts_us: u64,
    pub last_ttwu: u64,
    pub last_net_reqs: u64,
    pub last_epoll: u64,
    pub ttwu_rate: u64,
    pub cntxswch_rate: u64,
    pub event_rate: u64,
    pub interarrival_us: u64,

    bug_logged: bool,
}

impl CpuGovernor {
    pub fn new(cpu: u32, tunables: Arc<Tunables>) -> Self {
        Self {
            cpu,
            last_state_idx: -1,
            next_timer_us: 0,
            predicted_us: 0,
            measured_us: 0,
            pending_us: 0,
            attendees: 0,
            will_wake_with_timer: false,
            strict_latency: false,
            network_activity: false,
            weights: [INITIAL_WEIGHT; NR_EXPERTS],
            predictions: [ABSTAIN; NR_EXPERTS],
            total: 0,
            updates: 0,
            inmature: 0,
            timer_arms: 0,
            weight_resets: 0,
            flags: Arc::new(WakeFlags::new()),
            tunables,
            residency_ema_us: 0,
            bucket: 0,
            correction_factor: [0; BUCKETS],
            before_ts_us: 0,
            last_ttwu: 0,
            last_net_reqs: 0,
            last_epoll: 0,
            ttwu_rate: 0,
            cntxswch_rate: 0,
            event_rate: 0,
            interarrival_us: 0,
            bug_logged: false,
        }
    }

    // DEVICE ENABLE: EXPERTS INITIALISED IN REGISTRATION ORDER SO THE
    // DENSE ID ASSIGNMENT STAYS STABLE ACROSS THE WHOLE LIFETIME.
    pub fn enable(&mut self, dev: &Device, platform: &dyn Platform) {
        for e in EXPERTS {
            e.init(self, dev, platform);
        }
        self.weights = [INITIAL_WEIGHT; NR_EXPERTS];
    }

    pub fn select(&mut self, drv: &IdleDriver, dev: &Device, platform: &dyn Platform) -> i32 {
        // CONSUME THE LAST REFLECT BEFORE ANY EXPERT RUNS
        if self.flags.needs_update.load(Ordering::Relaxed) {
            self.update(drv, dev, platform);
            self.flags.needs_update.store(false, Ordering::Relaxed);
        }
        self.network_activity = false;
        self.strict_latency = false;
        self.will_wake_with_timer = false;
        self.flags.woke_by_timer.store(false, Ordering::Relaxed);

        platform.reset_tasks_woke(self.cpu);
        self.total += 1;
        self.next_timer_us = platform.sleep_length_us(self.cpu).min(NEXT_TIMER_CAP_US);
        self.attendees = 0;

        let mut sum: u64 = 0;
        let mut wsum: u64 = 0;
        for e in EXPERTS {
            let p = e.select(self, dev, platform);
            self.predictions[e.id()] = p;
            if p != ABSTAIN {
                self.attendees += 1;
                sum += self.weights[e.id()] * p as u64;
                wsum += self.weights[e.id()];
            }
        }
        if wsum == 0 {
            if !self.bug_logged {
                crate::log_warn!("cpu{}: all experts abstained, falling back", self.cpu);
                self.bug_logged = true;
            }
            return FALLBACK_STATE;
        }
        self.predicted_us = sum / wsum;

        self.last_state_idx = drv.state_start as i32 - 1;

        // DEFAULT TO C1 RATHER THAN BUSY POLL UNLESS THE NEXT TIMER IS
        // PRACTICALLY ALREADY HERE
        let start = drv.state_start;
        if self.next_timer_us > POLL_CUTOFF_US
            && start < drv.state_count()
            && !drv.states[start].disabled
            && !dev.usage_disable[start]
        {
            self.last_state_idx = start as i32;
        }

        if self.predicted_us > self.next_timer_us {
            self.predicted_us = self.next_timer_us;
            self.will_wake_with_timer = true;
        }

        // HIGHEST FEASIBLE STATE WINS. STRICT LATENCY FENCES OFF THE
        // DEEPEST STATE THIS ROUND.
        let mut limit = drv.state_count();
        if self.strict_latency {
            limit -= 1;
        }
        let mut exit_latency_us = 0;
        for i in start..limit {
            let s = &drv.states[i];
            if s.disabled || dev.usage_disable[i] {
                continue;
            }
            if s.target_residency_us > self.predicted_us {
                continue;
            }
            self.last_state_idx = i as i32;
            exit_latency_us = s.exit_latency_us;
        }

        // PRE-EMPTIVE WAKE: ONLY WORTH ARMING WHEN THE WAKE WILL COME
        // FROM THE NETWORK, NOT FROM THE SCHEDULER TIMER
        if self.network_activity && !self.will_wake_with_timer {
            let interval = self.predicted_us.saturating_sub(exit_latency_us);
            if interval > MIN_WAKE_INTERVAL_US && !self.flags.timer_active.load(Ordering::Relaxed)
            {
                self.flags.timer_active.store(true, Ordering::Relaxed);
                platform.arm_wake_timer(self.cpu, interval);
                self.timer_arms += 1;
            }
        }
        self.last_state_idx
    }

    // FAST EXIT-PATH NOTIFICATION. NO EXPERT WORK HERE -- EVERY CYCLE
    // SPENT IN REFLECT ADDS DIRECTLY TO WAKE LATENCY.
    pub fn reflect(&mut self, index: i32, platform: &dyn Platform) {
        self.last_state_idx = index;
        if self.flags.timer_active.load(Ordering::Relaxed) {
            platform.cancel_wake_timer(self.cpu);
            self.flags.timer_active.store(false, Ordering::Relaxed);
            self.inmature += 1;
        }
        self.flags.needs_update.store(true, Ordering::Relaxed);
    }

    // DEFERRED HALF OF REFLECT, RUN AT THE TOP OF THE NEXT SELECT:
    // COMPENSATE EXIT LATENCY, ATTRIBUTE SPURIOUS TIMER WAKES, FEED
    // EXPERTS, UPDATE ENSEMBLE WEIGHTS.
    fn update(&mut self, drv: &IdleDriver, dev: &Device, platform: &dyn Platform) {
        self.updates += 1;

        let last_idx = self.last_state_idx.max(0) as usize;
        let exit_latency_us = drv
            .states
            .get(last_idx)
            .map(|s| s.exit_latency_us)
            .unwrap_or(0);

        let raw_us = dev.get_last_residency();
        if raw_us <= exit_latency_us {
            // MEASUREMENT SWAMPED BY THE EXIT ITSELF -- UNUSABLE
            self.pending_us = 0;
            return;
        }
        let mut measured_us = raw_us - exit_latency_us;
        if measured_us > self.next_timer_us {
            measured_us = self.next_timer_us;
        }

        if self.flags.woke_by_timer.load(Ordering::Relaxed) && !platform.tasks_woke(self.cpu) {
            // OUR OWN TIMER CUT THE SLEEP SHORT AND NO WORK ARRIVED:
            // PARK THE RESIDENCY UNTIL A REAL WAKE CLOSES THE CYCLE
            self.pending_us += measured_us;
            return;
        }
        measured_us = (measured_us + self.pending_us).min(self.next_timer_us);
        self.pending_us = 0;
        self.measured_us = measured_us;

        for e in EXPERTS {
            e.reflect(self, measured_us);
        }

        // A ONE-EXPERT ROUND CARRIES NO RELATIVE INFORMATION
        if self.attendees > 1 {
            self.apply_weight_update();
        }
    }

    // EXPONENTIALLY WEIGHTED FORECASTER. EACH NON-ABSTAINING EXPERT IS
    // SCALED BY EXP[loss] AND RENORMALISED AGAINST THE WEIGHTED FLOOR.
    fn apply_weight_update(&mut self) {
        let mut loss = [0usize; NR_EXPERTS];
        for i in 0..NR_EXPERTS {
            let diff = (self.predictions[i] - self.measured_us as i64).unsigned_abs();
            loss[i] = (diff as usize).min(MAX_LOSS);
        }

        let mut floor: u64 = 0;
        for i in 0..NR_EXPERTS {
            floor += self.weights[i] * EXP[loss[i]] as u64;
        }
        floor /= 1000;
        if floor == 0 {
            // DEGENERATE NORMALISER: KEEP LAST WEIGHTS RATHER THAN DIVIDE
            return;
        }

        let mut next = self.weights;
        for i in 0..NR_EXPERTS {
            if self.predictions[i] == ABSTAIN {
                continue;
            }
            next[i] = (self.weights[i] * EXP[loss[i]] as u64 / floor).max(MIN_WEIGHT);
        }
        if next.contains(&0) {
            // COLLAPSE GUARD: A DEAD EXPERT CAN NEVER RECOVER
            self.reset_weights();
            return;
        }
        self.weights = next;
    }

    pub fn reset_weights(&mut self) {
        if self.weights != [INITIAL_WEIGHT; NR_EXPERTS] {
            self.weight_resets += 1;
        }
        self.weights = [INITIAL_WEIGHT; NR_EXPERTS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    fn gov() -> CpuGovernor {
        CpuGovernor::new(0, Arc::new(Tunables::default()))
    }

    #[test]
    fn weights_start_at_initial() {
        let g = gov();
        assert_eq!(g.weights, [INITIAL_WEIGHT; NR_EXPERTS]);
        assert_eq!(g.predictions, [ABSTAIN; NR_EXPERTS]);
    }

    #[test]
    fn zero_loss_update_is_identity_in_steady_state() {
        // WITH TOTAL WEIGHT 1000 AND ALL LOSSES ZERO THE NORMALISER IS
        // EXACTLY 1000 AND EVERY WEIGHT MAPS TO ITSELF
        let mut g = gov();
        g.weights = [600, 300, 100];
        g.measured_us = 250;
        g.predictions = [250, 250, 250];
        g.attendees = 3;
        g.apply_weight_update();
        assert_eq!(g.weights, [600, 300, 100]);
    }

    #[test]
    fn lossy_expert_decays_toward_min_weight() {
        let mut g = gov();
        g.weights = [500, 250, 250];
        g.measured_us = 100;
        // EXPERT 0 PERFECT, EXPERT 1 OFF BY 999, EXPERT 2 ABSTAINED
        g.predictions = [100, 1_099, ABSTAIN];
        for _ in 0..50 {
            g.apply_weight_update();
        }
        assert_eq!(g.weights[1], MIN_WEIGHT);
        assert!(g.weights[0] > g.weights[1] * 20);
        // ABSTAINING EXPERT NEVER TOUCHED
        assert_eq!(g.weights[2], 250);
    }

    #[test]
    fn floor_zero_keeps_weights() {
        let mut g = gov();
        g.weights = [MIN_WEIGHT; NR_EXPERTS];
        g.measured_us = 100_000;
        // ALL LOSSES CLAMP TO 999, EXP[999] = 1: FLOOR = 15/1000 = 0
        g.predictions = [0, 0, 0];
        g.apply_weight_update();
        assert_eq!(g.weights, [MIN_WEIGHT; NR_EXPERTS]);
    }

    #[test]
    fn reset_counts_only_real_resets() {
        let mut g = gov();
        g.reset_weights();
        assert_eq!(g.weight_resets, 0);
        g.weights = [10, 20, 30];
        g.reset_weights();
        assert_eq!(g.weight_resets, 1);
        assert_eq!(g.weights, [INITIAL_WEIGHT; NR_EXPERTS]);
    }

    #[test]
    fn reflect_is_fast_path_only() {
        let plat = SimPlatform::new(1);
        let mut g = gov();
        g.reflect(2, &plat);
        assert_eq!(g.last_state_idx, 2);
        assert!(g.flags.needs_update.load(Ordering::Relaxed));
        assert_eq!(g.updates, 0);
    }

    #[test]
    fn reflect_cancels_armed_timer_and_counts_it_inmature() {
        let plat = SimPlatform::new(1);
        let mut g = gov();
        g.flags.timer_active.store(true, Ordering::Relaxed);
        g.reflect(1, &plat);
        assert!(!g.flags.timer_active.load(Ordering::Relaxed));
        assert_eq!(g.inmature, 1);
        assert_eq!(plat.cancels.get(), 1);
    }
}
