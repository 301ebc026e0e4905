// C-STATE LADDER PRINTER -- ENUMERATES THE CPUIDLE SYSFS TABLE
// ONE ROW PER STATE WITH THE PER-CPU0 DISABLE MASK

use anyhow::Result;

use torpor::driver::IdleDriver;

pub fn run_states() -> Result<()> {
    let drv = IdleDriver::from_sysfs(0)?;

    println!(
        "{:<4} {:<10} {:>12} {:>10} {:>9}",
        "IDX", "NAME", "RESIDENCY_US", "LATENCY_US", "DISABLED"
    );
    println!("{}", "-".repeat(50));
    for (idx, s) in drv.states.iter().enumerate() {
        let disable = std::fs::read_to_string(format!(
            "/sys/devices/system/cpu/cpu0/cpuidle/state{}/disable",
            idx
        ))
        .map(|v| v.trim() == "1")
        .unwrap_or(false);
        println!(
            "{:<4} {:<10} {:>12} {:>10} {:>9}",
            idx, s.name, s.target_residency_us, s.exit_latency_us, disable
        );
    }
    println!(
        "\nSTATE_START: {} (FIRST NON-POLLING STATE)",
        drv.state_start
    );
    Ok(())
}
