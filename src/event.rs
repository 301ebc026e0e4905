// TORPOR EVENT LOG
// RECORDS GOVERNOR SNAPSHOTS DURING MONITORING
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION DURING MONITORING.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use crate::experts::NR_EXPERTS;
use crate::platform::now_us;

const MAX_SNAPSHOTS: usize = 8192;

#[derive(Clone, Copy)]
pub struct Snapshot {
    pub ts_us: u64,
    pub rounds: u64,
    pub predicted_us: u64,
    pub measured_us: u64,
    pub timer_arms: u64,
    pub inmature: u64,
    pub weight_resets: u64,
    pub weights: [u64; NR_EXPERTS],
}

const ZERO_SNAPSHOT: Snapshot = Snapshot {
    ts_us: 0,
    rounds: 0,
    predicted_us: 0,
    measured_us: 0,
    timer_arms: 0,
    inmature: 0,
    weight_resets: 0,
    weights: [0; NR_EXPERTS],
};

pub struct EventLog {
    snapshots: Vec<Snapshot>,
    head: usize,
    len: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            snapshots: vec![ZERO_SNAPSHOT; MAX_SNAPSHOTS],
            head: 0,
            len: 0,
        }
    }

    // RECORD ONE SNAPSHOT. CALLED ONCE PER TICK FROM THE MONITOR LOOP.
    // OVERWRITES OLDEST ENTRY WHEN FULL.
    #[allow(clippy::too_many_arguments)]
    pub fn snapshot(
        &mut self,
        rounds: u64,
        predicted_us: u64,
        measured_us: u64,
        timer_arms: u64,
        inmature: u64,
        weight_resets: u64,
        weights: [u64; NR_EXPERTS],
    ) {
        self.snapshots[self.head] = Snapshot {
            ts_us: now_us(),
            rounds,
            predicted_us,
            measured_us,
            timer_arms,
            inmature,
            weight_resets,
            weights,
        };
        self.head = (self.head + 1) % MAX_SNAPSHOTS;
        if self.len < MAX_SNAPSHOTS {
            self.len += 1;
        }
    }

    // ITERATE SNAPSHOTS IN CHRONOLOGICAL ORDER
    fn iter_chronological(&self) -> impl Iterator<Item = &Snapshot> {
        let start = if self.len < MAX_SNAPSHOTS { 0 } else { self.head };
        (0..self.len).map(move |i| &self.snapshots[(start + i) % MAX_SNAPSHOTS])
    }

    // DUMP THE TIME SERIES AFTER EXECUTION
    pub fn dump(&self) {
        if self.len == 0 {
            return;
        }

        let mut iter = self.iter_chronological();
        let first = iter.next().unwrap();
        let base_ts = first.ts_us;

        println!(
            "\n{:<10} {:<10} {:<10} {:<10} {:<8} {:<8} {:<8} {}",
            "TIME_S", "ROUNDS", "PRED_US", "MEAS_US", "ARMS", "IMM", "RESETS", "WEIGHTS"
        );
        println!("{}", "-".repeat(78));

        let row = |s: &Snapshot, elapsed_s: f64| {
            println!(
                "{:<10.1} {:<10} {:<10} {:<10} {:<8} {:<8} {:<8} {:?}",
                elapsed_s,
                s.rounds,
                s.predicted_us,
                s.measured_us,
                s.timer_arms,
                s.inmature,
                s.weight_resets,
                s.weights,
            );
        };

        row(first, 0.0);
        for s in iter {
            row(s, (s.ts_us - base_ts) as f64 / 1_000_000.0);
        }

        if self.len == MAX_SNAPSHOTS {
            println!(
                "\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} SNAPSHOTS)",
                MAX_SNAPSHOTS
            );
        }
        println!("TOTAL SNAPSHOTS: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }

        let snapshots: Vec<&Snapshot> = self.iter_chronological().collect();

        let total_rounds: u64 = snapshots.iter().map(|s| s.rounds).sum();
        let total_arms = snapshots.last().unwrap().timer_arms;
        let total_inmature = snapshots.last().unwrap().inmature;
        let total_resets = snapshots.last().unwrap().weight_resets;

        // MEAN ABSOLUTE PREDICTION ERROR ACROSS TICKS
        let err_sum: u64 = snapshots
            .iter()
            .map(|s| s.predicted_us.abs_diff(s.measured_us))
            .sum();
        let err_avg = err_sum / snapshots.len() as u64;

        let elapsed_us = snapshots.last().unwrap().ts_us - snapshots.first().unwrap().ts_us;
        let elapsed_s = elapsed_us as f64 / 1_000_000.0;

        println!("\n{}", "=".repeat(50));
        println!("TORPOR SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  TOTAL ROUNDS:      {}", total_rounds);
        println!("  TIMER ARMS:        {}", total_arms);
        println!("  IMMATURE WAKES:    {}", total_inmature);
        println!("  WEIGHT RESETS:     {}", total_resets);
        println!("  AVG |PRED-MEAS|:   {}us", err_avg);
        if total_arms > 0 {
            let imm_pct = total_inmature as f64 / total_arms as f64 * 100.0;
            println!("  IMMATURE RATE:     {:.1}%", imm_pct);
        }
        println!("  FINAL WEIGHTS:     {:?}", snapshots.last().unwrap().weights);
        println!("  ELAPSED:           {:.1}s", elapsed_s);
        println!("  SAMPLES:           {}", self.len);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
