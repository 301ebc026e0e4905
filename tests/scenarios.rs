// TORPOR END-TO-END SCENARIOS
// COLD START, STEADY AND MIXED NETWORK STREAMS, SPURIOUS PRE-EMPTIVE
// WAKES, WEIGHT CONVERGENCE, DISTRIBUTION SHIFT.
//
// EVERY SCENARIO RUNS THE FULL SELECT/SLEEP/REFLECT LOOP THROUGH
// SimPlatform. ZERO SYSFS DEPENDENCIES. RUN OFFLINE.

use torpor::governor::{INITIAL_WEIGHT, MIN_WEIGHT};
use torpor::sim::{RoundOutcome, SimHarness, WakeCause};

struct Stream {
    interarrival_us: Option<u64>,
    next_at: Option<u64>,
}

impl Stream {
    fn new(h: &SimHarness, interarrival_us: Option<u64>) -> Self {
        Self {
            interarrival_us,
            next_at: interarrival_us.map(|ia| h.platform.now() + ia),
        }
    }

    fn quiet(&mut self) {
        self.interarrival_us = None;
        self.next_at = None;
    }

    fn step(&mut self, h: &mut SimHarness) -> RoundOutcome {
        let rel = self.next_at.map(|t| t.saturating_sub(h.platform.now()));
        let out = h.round(0, rel);
        if out.cause == WakeCause::Arrival {
            self.next_at = self.interarrival_us.map(|ia| h.platform.now() + ia);
        }
        out
    }
}

// === SCENARIO 1: COLD START, NO ACTIVITY ===

#[test]
fn cold_start_picks_the_c1_default_and_arms_nothing() {
    let mut h = SimHarness::new(1);
    let idx = h.govs[0].select(&h.drv, &h.devs[0], &h.platform);

    // RESIDENCY AND TIMER BOTH PREDICT ZERO, NETWORK ABSTAINS:
    // NOTHING SATISFIES A DEEPER RESIDENCY BOUND, SO THE C1 DEFAULT
    // STANDS
    assert_eq!(idx, h.drv.state_start as i32);
    assert_eq!(h.govs[0].predicted_us, 0);
    assert_eq!(h.govs[0].attendees, 2);
    assert!(!h.govs[0].network_activity);
    assert!(!h.govs[0].strict_latency);
    assert_eq!(h.platform.arms.get(), 0);
    assert!(h.platform.armed_deadline(0).is_none());
}

#[test]
fn quiet_box_converges_to_the_deepest_state() {
    let mut h = SimHarness::new(1);
    // LONG UNINTERRUPTED SLEEPS: EVERY PREDICTOR LEARNS THE HORIZON
    let mut last = 0;
    for _ in 0..200 {
        last = h.round(0, None).state_idx;
    }
    assert_eq!(last as usize, h.drv.state_count() - 1);
    assert_eq!(h.platform.arms.get(), 0);
}

// === SCENARIO 2: STEADY 16us NETWORK STREAM ===

#[test]
fn steady_short_stream_unparks_the_sibling_and_stays_shallow() {
    let mut h = SimHarness::new(2);
    // rate_sum = 2*20000 + 20000 = 60000/s -> 16us INTER-ARRIVAL
    h.platform.set_rates(0, 20_000, 20_000);
    let mut stream = Stream::new(&h, Some(16));

    let mut last = 0;
    for _ in 0..40_000 {
        last = stream.step(&mut h).state_idx;
    }

    let g = &h.govs[0];
    assert_eq!(g.interarrival_us, 16);
    assert!(g.network_activity);
    // 16us IS UNDER THE 400us STRICTNESS BAR
    assert!(!g.strict_latency);
    // UNDER THE SHALLOW THRESHOLD: SIBLING CPU REQUESTED ONLINE
    assert!(
        h.platform.rq_hints.borrow().contains(&(1, true)),
        "no unpark hint emitted"
    );
    // PREDICTION IN THE LOW TENS: C1 IS THE DEEPEST FEASIBLE STATE
    assert_eq!(last, 1);
    assert!(g.predicted_us < 20, "predicted {}", g.predicted_us);
}

// === SCENARIO 3: MIXED 600us STREAM ===

#[test]
fn mixed_stream_sets_strict_latency_and_fences_the_deepest_state() {
    let mut h = SimHarness::new(2);
    // rate_sum = 2*332 + 1000 = 1664/s -> 600us INTER-ARRIVAL
    h.platform.set_rates(0, 1_000, 333);
    let mut stream = Stream::new(&h, Some(600));

    let mut last = 0;
    for _ in 0..6_000 {
        last = stream.step(&mut h).state_idx;
    }

    let g = &h.govs[0];
    // COUNTER-DELTA CARRY WOBBLES THE ESTIMATE BY A MICROSECOND OR TWO
    assert!(
        (595..=605).contains(&g.interarrival_us),
        "interarrival {} off band",
        g.interarrival_us
    );
    assert!(g.network_activity);
    assert!(g.strict_latency);
    // FUSED PREDICTION HOVERS AROUND THE INTER-ARRIVAL TIME
    assert!(
        (450..=650).contains(&g.predicted_us),
        "fused prediction {} off band",
        g.predicted_us
    );
    // C6 FENCED OFF; C3 IS THE DEEPEST SURVIVOR UNDER 600us
    assert_eq!(last, 3);
}

// === SCENARIO 4: SPURIOUS PRE-EMPTIVE WAKE ===

#[test]
fn spurious_timer_wake_parks_residency_in_pending() {
    let mut h = SimHarness::new(2);
    h.platform.set_rates(0, 1_000, 333);
    let mut stream = Stream::new(&h, Some(600));
    for _ in 0..4_000 {
        stream.step(&mut h);
    }

    // A LULL: NO ARRIVAL, SO OUR OWN TIMER CUTS THE SLEEP SHORT
    let out = h.round(0, None);
    assert_eq!(out.cause, WakeCause::WakeTimer);

    // THE NEXT SELECT CLASSIFIES THE WAKE AS SPURIOUS: RESIDENCY GOES
    // TO pending, WEIGHTS STAY PUT
    let weights_before = h.govs[0].weights;
    h.round(0, Some(100));
    let pending = h.govs[0].pending_us;
    assert!(pending > 400, "pending {} too small", pending);
    assert_eq!(h.govs[0].weights, weights_before);

    // THE REAL WAKE FOLDS THE PARKED RESIDENCY INTO ITS MEASUREMENT
    h.round(0, Some(600));
    assert_eq!(h.govs[0].measured_us, 100 + pending);
    assert_eq!(h.govs[0].pending_us, 0);
}

// === SCENARIO 5: WEIGHT CONVERGENCE ===

#[test]
fn exact_expert_starves_the_consistently_wrong_one() {
    let mut h = SimHarness::new(2);
    h.platform.set_rates(0, 1_000, 333);
    let mut stream = Stream::new(&h, Some(600));

    // ARRIVALS LAND EXACTLY ON THE NETWORK ESTIMATE: ITS LOSS IS ZERO
    // EVERY ROUND, WHILE THE TIMER EXPERT KEEPS MISSING
    for _ in 0..10_000 {
        stream.step(&mut h);
    }

    let g = &h.govs[0];
    let w_network = g.weights[2];
    let w_timer = g.weights[1];
    assert_eq!(w_timer, MIN_WEIGHT, "timer weight {} not starved", w_timer);
    assert!(
        w_network >= w_timer * 20,
        "weight ratio {}:{} under 20:1",
        w_network,
        w_timer
    );
}

// === SCENARIO 6: DISTRIBUTION SHIFT ===

#[test]
fn stream_death_resets_the_ensemble_to_equal_weights() {
    let mut h = SimHarness::new(2);
    h.platform.set_rates(0, 1_000, 333);
    let mut stream = Stream::new(&h, Some(600));
    for _ in 0..8_000 {
        stream.step(&mut h);
    }
    assert_ne!(h.govs[0].weights, [INITIAL_WEIGHT; 3]);
    let resets_before = h.govs[0].weight_resets;

    // THE STREAM DIES. THE NEXT SAMPLING WINDOW SEES ZERO RATES, THE
    // NETWORK EXPERT ABSTAINS AND RE-SEEDS THE ENSEMBLE.
    h.platform.set_rates(0, 0, 0);
    stream.quiet();
    let mut rounds_to_reset = None;
    for round in 0..100_000 {
        stream.step(&mut h);
        if h.govs[0].weights == [INITIAL_WEIGHT; 3] {
            rounds_to_reset = Some(round);
            break;
        }
    }
    assert!(rounds_to_reset.is_some(), "ensemble never re-seeded");
    assert_eq!(h.govs[0].interarrival_us, 0);
    assert!(h.govs[0].weight_resets > resets_before);

    // NEXT ROUND FUSES THE SURVIVORS AT EQUAL WEIGHT
    let idx = h.govs[0].select(&h.drv, &h.devs[0], &h.platform);
    assert!(idx >= 0);
    assert_eq!(h.govs[0].weights, [INITIAL_WEIGHT; 3]);
    assert_eq!(h.govs[0].attendees, 2);
}
