// TORPOR EXPERT SET
// THREE INDEPENDENT IDLE-DURATION PREDICTORS, CLOSED SET, DENSE IDS IN
// REGISTRATION ORDER. ENUM DISPATCH -- THE FUSE LOOP ITERATES A FIXED
// ARRAY, NO POINTER CHASING ON THE IDLE HOT PATH.
//
//   0 RESIDENCY  EMA OVER MEASURED IDLE DURATIONS
//   1 TIMER      BUCKETED CORRECTION FACTOR OVER THE TIMER DEADLINE
//   2 NETWORK    INTER-ARRIVAL ESTIMATE FROM WAKE/REQUEST/EPOLL RATES
//
// AN EXPERT RETURNS A MICROSECOND PREDICTION OR ABSTAIN (-1). SELECT
// MAY MUTATE ONLY THE EXPERT'S PRIVATE PER-CPU FIELDS PLUS THE POLICY
// FLAGS IT IS AUTHORISED TO SET (strict_latency, network_activity).

use crate::driver::Device;
use crate::governor::{CpuGovernor, ABSTAIN};
use crate::platform::Platform;

pub const NR_EXPERTS: usize = 3;

// RESIDENCY EMA: NEW SAMPLE WEIGHT = (FLOOR - FACTOR)/FLOOR = 0.1
pub const EXPONENTIAL_FACTOR: u64 = 18;
pub const EXPONENTIAL_FLOOR: u64 = 20;

// TIMER EXPERT: TWO BUCKET GROUPS (PLAIN / IOWAIT) x SIX DECADES
pub const BUCKETS: usize = 12;
pub const RESOLUTION: u64 = 1024;
pub const DECAY: u64 = 8;
pub const MAX_INTERESTING_US: u64 = 50_000;

// NETWORK EXPERT SAMPLING WINDOW (COUNTER DELTAS -> PER-SECOND RATES)
const SAMPLE_WINDOW_US: u64 = 500_000;
// ABOVE THIS INTER-ARRIVAL THE DEEPEST STATE GETS FENCED OFF
const STRICT_LATENCY_US: u64 = 400;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Expert {
    Residency,
    Timer,
    Network,
}

pub const EXPERTS: [Expert; NR_EXPERTS] = [Expert::Residency, Expert::Timer, Expert::Network];

impl Expert {
    pub fn id(self) -> usize {
        match self {
            Expert::Residency => 0,
            Expert::Timer => 1,
            Expert::Network => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Expert::Residency => "residency",
            Expert::Timer => "timer",
            Expert::Network => "network",
        }
    }

    pub fn init(self, data: &mut CpuGovernor, dev: &Device, platform: &dyn Platform) {
        match self {
            Expert::Residency | Expert::Timer => {}
            Expert::Network => {
                // ANCHOR EVERY COUNTER SO THE FIRST WINDOW SEES DELTAS,
                // NOT ABSOLUTE VALUES
                data.before_ts_us = platform.now_us();
                data.last_ttwu = platform.nr_ttwu(dev.cpu);
                data.last_net_reqs = platform.net_reqs();
                data.last_epoll = platform.epoll_events();
            }
        }
    }

    pub fn select(self, data: &mut CpuGovernor, dev: &Device, platform: &dyn Platform) -> i64 {
        match self {
            Expert::Residency => data.residency_ema_us as i64,
            Expert::Timer => {
                let (nr_iowaiters, _cpu_load) = platform.iowait_load(dev.cpu);
                data.bucket = which_bucket(data.next_timer_us, nr_iowaiters);
                let scaled = data.next_timer_us * data.correction_factor[data.bucket];
                scaled.div_ceil(RESOLUTION * DECAY) as i64
            }
            Expert::Network => network_select(data, dev, platform),
        }
    }

    pub fn reflect(self, data: &mut CpuGovernor, measured_us: u64) {
        match self {
            Expert::Residency => {
                let ema = data.residency_ema_us;
                data.residency_ema_us = (EXPONENTIAL_FACTOR * ema
                    + (EXPONENTIAL_FLOOR - EXPONENTIAL_FACTOR) * measured_us)
                    / EXPONENTIAL_FLOOR;
            }
            Expert::Timer => {
                let mut new_factor = data.correction_factor[data.bucket];
                new_factor -= new_factor / DECAY;
                if data.next_timer_us > 0 && measured_us < MAX_INTERESTING_US {
                    new_factor += RESOLUTION * measured_us / data.next_timer_us;
                } else {
                    new_factor += RESOLUTION;
                }
                data.correction_factor[data.bucket] = new_factor.max(1);
            }
            Expert::Network => {}
        }
    }
}

// TWO STAT GROUPS, WITH AND WITHOUT IO PENDING, SO THE LEARNED RATIO
// APPROXIMATES E(duration | iowait)
pub fn which_bucket(duration_us: u64, nr_iowaiters: u64) -> usize {
    let bucket = if nr_iowaiters > 0 { BUCKETS / 2 } else { 0 };

    if duration_us < 10 {
        return bucket;
    }
    if duration_us < 100 {
        return bucket + 1;
    }
    if duration_us < 1_000 {
        return bucket + 2;
    }
    if duration_us < 10_000 {
        return bucket + 3;
    }
    if duration_us < 100_000 {
        return bucket + 4;
    }
    bucket + 5
}

fn network_select(data: &mut CpuGovernor, dev: &Device, platform: &dyn Platform) -> i64 {
    let now = platform.now_us();
    let period_us = now.saturating_sub(data.before_ts_us);

    if period_us >= SAMPLE_WINDOW_US {
        // HALF-SECOND DELTAS, DOUBLED INTO PER-SECOND RATES
        let ttwu = platform.nr_ttwu(dev.cpu);
        data.ttwu_rate = ttwu.wrapping_sub(data.last_ttwu) * 2;
        data.last_ttwu = ttwu;
        data.before_ts_us = now;

        let reqs = platform.net_reqs();
        data.cntxswch_rate = reqs.wrapping_sub(data.last_net_reqs) * 2;
        data.last_net_reqs = reqs;

        let events = platform.epoll_events();
        data.event_rate = events.wrapping_sub(data.last_epoll) * 2;
        data.last_epoll = events;

        let rate_sum = 2 * data.event_rate + data.cntxswch_rate;
        data.interarrival_us = if rate_sum > 0 { 1_000_000 / rate_sum } else { 0 };

        // PARK/UNPARK HINTS. FIRE-AND-FORGET; THE SCHEDULER SIDE OWNS
        // IDEMPOTENCE AND RACE SAFETY.
        let deep_us = data.tunables.deep_threshold_us();
        let shallow_us = data.tunables.shallow_threshold_us();
        if dev.cpu != 0 && (data.interarrival_us == 0 || data.interarrival_us > deep_us) {
            platform.set_rq_online(dev.cpu, false);
        } else if dev.cpu + 1 < platform.num_online_cpus() && data.interarrival_us < shallow_us {
            platform.set_rq_online(dev.cpu + 1, true);
        }
    }

    if data.interarrival_us > 0 && data.interarrival_us < data.tunables.deep_threshold_us() {
        if data.interarrival_us > STRICT_LATENCY_US {
            data.strict_latency = true;
        }
        data.network_activity = true;
        return data.interarrival_us as i64;
    }

    // NO SUSTAINED STREAM: THE WORKLOAD CHANGED CHARACTER, SO THE
    // ACCUMULATED EXPERT RECORD IS STALE -- RE-SEED THE ENSEMBLE
    data.reset_weights();
    ABSTAIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{CpuGovernor, INITIAL_WEIGHT};
    use crate::sim::SimPlatform;
    use crate::tunables::Tunables;
    use std::sync::Arc;

    fn gov() -> CpuGovernor {
        CpuGovernor::new(0, Arc::new(Tunables::default()))
    }

    #[test]
    fn bucket_grid() {
        assert_eq!(which_bucket(0, 0), 0);
        assert_eq!(which_bucket(9, 0), 0);
        assert_eq!(which_bucket(10, 0), 1);
        assert_eq!(which_bucket(99, 0), 1);
        assert_eq!(which_bucket(100, 0), 2);
        assert_eq!(which_bucket(999, 0), 2);
        assert_eq!(which_bucket(1_000, 0), 3);
        assert_eq!(which_bucket(9_999, 0), 3);
        assert_eq!(which_bucket(10_000, 0), 4);
        assert_eq!(which_bucket(99_999, 0), 4);
        assert_eq!(which_bucket(100_000, 0), 5);
        assert_eq!(which_bucket(u64::MAX, 0), 5);
        // IOWAIT GROUP SHIFTS BY SIX
        assert_eq!(which_bucket(0, 1), 6);
        assert_eq!(which_bucket(50_000, 3), 10);
        assert_eq!(which_bucket(u64::MAX, 1), 11);
    }

    #[test]
    fn residency_ema_converges_from_zero() {
        let mut g = gov();
        Expert::Residency.reflect(&mut g, 1_000);
        // FIRST SAMPLE AT WEIGHT 2/20
        assert_eq!(g.residency_ema_us, 100);
        for _ in 0..100 {
            Expert::Residency.reflect(&mut g, 1_000);
        }
        // INTEGER EMA SETTLES JUST UNDER THE INPUT
        assert!(g.residency_ema_us >= 990 && g.residency_ema_us <= 1_000);
    }

    #[test]
    fn residency_never_abstains() {
        let mut g = gov();
        let plat = SimPlatform::new(1);
        let dev = crate::driver::Device::new(0, 5);
        assert_eq!(Expert::Residency.select(&mut g, &dev, &plat), 0);
    }

    #[test]
    fn timer_expert_zero_factor_predicts_zero() {
        let mut g = gov();
        let plat = SimPlatform::new(1);
        let dev = crate::driver::Device::new(0, 5);
        g.next_timer_us = 1_000_000;
        assert_eq!(Expert::Timer.select(&mut g, &dev, &plat), 0);
        assert_eq!(g.bucket, 5);
    }

    #[test]
    fn timer_expert_learns_ratio() {
        let mut g = gov();
        let plat = SimPlatform::new(1);
        let dev = crate::driver::Device::new(0, 5);
        g.next_timer_us = 10_000;
        // SLEEPS KEEP COMING IN AT A QUARTER OF THE DEADLINE
        for _ in 0..60 {
            Expert::Timer.select(&mut g, &dev, &plat);
            Expert::Timer.reflect(&mut g, 2_500);
        }
        let p = Expert::Timer.select(&mut g, &dev, &plat);
        assert!(
            (2_000..=3_000).contains(&p),
            "learned prediction {} outside ratio band",
            p
        );
    }

    #[test]
    fn timer_expert_ignores_uninteresting_residency() {
        let mut g = gov();
        g.next_timer_us = 10_000;
        g.bucket = which_bucket(g.next_timer_us, 0);
        // MEASUREMENTS AT OR PAST MAX_INTERESTING COUNT AS FULL RATIO
        for _ in 0..60 {
            Expert::Timer.reflect(&mut g, MAX_INTERESTING_US);
        }
        let factor = g.correction_factor[g.bucket];
        assert!(
            factor >= RESOLUTION * DECAY - DECAY && factor <= RESOLUTION * DECAY,
            "factor {} did not saturate",
            factor
        );
    }

    #[test]
    fn correction_factor_floors_at_one() {
        let mut g = gov();
        g.next_timer_us = 1_000_000;
        g.bucket = 5;
        g.correction_factor[5] = 1;
        Expert::Timer.reflect(&mut g, 1);
        assert!(g.correction_factor[5] >= 1);
    }

    #[test]
    fn network_abstains_and_reseeds_when_quiet() {
        let mut g = gov();
        g.weights = [700, 200, 100];
        let plat = SimPlatform::new(2);
        let dev = crate::driver::Device::new(0, 5);
        assert_eq!(Expert::Network.select(&mut g, &dev, &plat), ABSTAIN);
        assert_eq!(g.weights, [INITIAL_WEIGHT; NR_EXPERTS]);
    }

    #[test]
    fn network_window_computes_interarrival() {
        let mut g = gov();
        let plat = SimPlatform::new(2);
        let dev = crate::driver::Device::new(0, 5);
        Expert::Network.init(&mut g, &dev, &plat);

        // 10k EPOLL EVENTS + 10k REQUESTS PER HALF SECOND:
        // rate_sum = 2*20000 + 20000 = 60000/s -> 16us
        plat.set_rates(0, 20_000, 20_000);
        plat.advance(500_000);
        let p = Expert::Network.select(&mut g, &dev, &plat);
        assert_eq!(p, 16);
        assert!(g.network_activity);
        assert!(!g.strict_latency);
        assert_eq!(g.interarrival_us, 16);
    }

    #[test]
    fn network_strict_latency_above_400us() {
        let mut g = gov();
        let plat = SimPlatform::new(2);
        let dev = crate::driver::Device::new(0, 5);
        Expert::Network.init(&mut g, &dev, &plat);

        // rate_sum = 2*333 + 1000 = 1666/s -> 600us
        plat.set_rates(0, 1_000, 333);
        plat.advance(500_000);
        let p = Expert::Network.select(&mut g, &dev, &plat);
        assert_eq!(p, 600);
        assert!(g.network_activity);
        assert!(g.strict_latency);
    }

    #[test]
    fn network_unpark_hint_below_shallow_threshold() {
        let mut g = gov();
        let plat = SimPlatform::new(4);
        let dev = crate::driver::Device::new(0, 5);
        Expert::Network.init(&mut g, &dev, &plat);

        plat.set_rates(0, 20_000, 20_000);
        plat.advance(500_000);
        Expert::Network.select(&mut g, &dev, &plat);
        assert_eq!(plat.rq_hints.borrow().as_slice(), &[(1, true)]);
    }

    #[test]
    fn network_park_hint_when_idle_and_not_cpu0() {
        let mut g = gov();
        g.cpu = 2;
        let plat = SimPlatform::new(4);
        let dev = crate::driver::Device::new(2, 5);
        Expert::Network.init(&mut g, &dev, &plat);

        plat.advance(500_000);
        Expert::Network.select(&mut g, &dev, &plat);
        assert_eq!(plat.rq_hints.borrow().as_slice(), &[(2, false)]);
    }

    #[test]
    fn network_keeps_estimate_between_windows() {
        let mut g = gov();
        let plat = SimPlatform::new(2);
        let dev = crate::driver::Device::new(0, 5);
        Expert::Network.init(&mut g, &dev, &plat);

        plat.set_rates(0, 20_000, 20_000);
        plat.advance(500_000);
        assert_eq!(Expert::Network.select(&mut g, &dev, &plat), 16);

        // 100ms LATER, WINDOW NOT ELAPSED: SAME ANSWER, NO RESAMPLE
        plat.advance(100_000);
        assert_eq!(Expert::Network.select(&mut g, &dev, &plat), 16);
    }
}
