use std::io::Read;
use std::path::Path;

use anyhow::Result;

use torpor::platform::SysPlatform;

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }

    let mut ok = true;
    for opt in ["CONFIG_CPU_IDLE=y", "CONFIG_NO_HZ_IDLE=y"] {
        if config.contains(opt) {
            println!("  {:<22}OK", opt.trim_end_matches("=y"));
        } else {
            println!("  {:<22}NOT FOUND", opt.trim_end_matches("=y"));
            ok = false;
        }
    }
    ok
}

pub fn run_check() -> Result<()> {
    println!("TORPOR DEPENDENCY CHECK");
    println!();

    let mut ok = true;

    let cpuidle = Path::new("/sys/devices/system/cpu/cpu0/cpuidle");
    if cpuidle.exists() {
        println!("  cpuidle sysfs         OK");
    } else {
        println!("  cpuidle sysfs         MISSING");
        ok = false;
    }

    match std::fs::read_to_string("/sys/devices/system/cpu/cpuidle/current_governor") {
        Ok(gov) => println!("  kernel governor       {}", gov.trim()),
        Err(_) => println!("  kernel governor       UNKNOWN"),
    }

    if Path::new(SysPlatform::pin_dir()).exists() {
        println!("  pinned counter maps   OK ({})", SysPlatform::pin_dir());
    } else {
        println!("  pinned counter maps   ABSENT (WILL USE /proc FALLBACK)");
    }

    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        println!("  root                  OK (ENFORCEMENT AVAILABLE)");
    } else {
        println!("  root                  NO (ADVISORY MODE ONLY)");
    }

    ok &= check_kernel_config();

    println!();
    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED -- SEE ABOVE");
    }
    Ok(())
}
