// TORPOR v0.9.2 -- ADAPTIVE CPUIDLE DECISION ENGINE
// MULTI-EXPERT IDLE PREDICTION FOR NETWORK-HEAVY SERVERS
//
// THE DECISION CORE (EXPERTS, ENSEMBLE, SELECTOR) LIVES IN THE LIBRARY
// AND RUNS OFFLINE. THE BINARY HANDLES: CONFIGURATION, LIVE SYSFS
// WIRING, MONITORING, REPORTING, SIMULATION.

mod cli;
mod monitor;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};

use monitor::MonitorConfig;
use torpor::tunables::{DEFAULT_DEEP_THRESHOLD_US, DEFAULT_SHALLOW_THRESHOLD_US};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "torpor")]
#[command(about = "TORPOR -- ADAPTIVE CPUIDLE DECISION ENGINE")]
struct Cli {
    #[command(subcommand)]
    command: Option<SubCmd>,
}

#[derive(Subcommand)]
enum SubCmd {
    /// Run the governor daemon (enforcement needs root)
    Run(RunArgs),

    /// Check cpuidle sysfs, kernel config and counter sources
    Check,

    /// Print the enumerated C-state ladder
    States,

    /// Replay a synthetic workload offline
    Sim(SimArgs),

    /// Run test gate (offline suites + live sysfs checks)
    Test,
}

#[derive(Parser)]
struct RunArgs {
    #[arg(long, default_value_t = 500)]
    tick_ms: u64,

    #[arg(long, default_value_t = DEFAULT_DEEP_THRESHOLD_US)]
    deep_threshold_us: u64,

    #[arg(long, default_value_t = DEFAULT_SHALLOW_THRESHOLD_US)]
    shallow_threshold_us: u64,

    /// Steer the kernel by disabling states deeper than the pick
    #[arg(long)]
    enforce: bool,

    /// Allow live CPU online/offline hint writes
    #[arg(long)]
    park: bool,

    #[arg(long)]
    dump_log: bool,

    #[arg(long)]
    verbose: bool,
}

#[derive(Parser)]
struct SimArgs {
    /// Scenario: idle, steady, mixed, shift
    #[arg(long, default_value = "steady")]
    scenario: String,

    #[arg(long, default_value_t = 10_000)]
    rounds: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(SubCmd::Run(_)) => {
            let args = match cli.command {
                Some(SubCmd::Run(a)) => a,
                _ => RunArgs {
                    tick_ms: 500,
                    deep_threshold_us: DEFAULT_DEEP_THRESHOLD_US,
                    shallow_threshold_us: DEFAULT_SHALLOW_THRESHOLD_US,
                    enforce: false,
                    park: false,
                    dump_log: false,
                    verbose: false,
                },
            };
            run_daemon(args)
        }
        Some(SubCmd::Check) => cli::check::run_check(),
        Some(SubCmd::States) => cli::states::run_states(),
        Some(SubCmd::Sim(args)) => run_sim(args),
        Some(SubCmd::Test) => cli::test_gate::run_test_gate(),
    }
}

fn run_daemon(args: RunArgs) -> Result<()> {
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    println!("TORPOR v{}", torpor::TORPOR_VERSION);

    let cfg = MonitorConfig {
        tick_ms: args.tick_ms,
        deep_threshold_us: args.deep_threshold_us,
        shallow_threshold_us: args.shallow_threshold_us,
        enforce: args.enforce,
        park: args.park,
        dump_log: args.dump_log,
        verbose: args.verbose,
    };

    println!("TORPOR IS ACTIVE (CTRL+C TO EXIT)");
    monitor::run(&cfg, &SHUTDOWN)?;
    println!("TORPOR OUT.");
    Ok(())
}

fn run_sim(args: SimArgs) -> Result<()> {
    let report = torpor::sim::run_scenario(&args.scenario, args.rounds)?;

    println!("TORPOR SIM: {} ({} ROUNDS)", report.scenario, report.rounds);
    println!();
    println!("  STATE HISTOGRAM:");
    for (idx, count) in report.state_hist.iter().enumerate() {
        let pct = *count as f64 / report.rounds.max(1) as f64 * 100.0;
        println!("    state{}: {:>8} ({:>5.1}%)", idx, count, pct);
    }
    println!("  TIMER ARMS:        {}", report.timer_arms);
    println!("  IMMATURE WAKES:    {}", report.inmature);
    println!("  WEIGHT RESETS:     {}", report.weight_resets);
    println!("  FINAL WEIGHTS:     {:?}", report.final_weights);
    println!("  AVG PREDICTED:     {}us", report.avg_predicted_us);
    println!("  AVG MEASURED:      {}us", report.avg_measured_us);
    Ok(())
}
