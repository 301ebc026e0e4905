// TORPOR PRE-EMPTIVE WAKE TIMER
// ONE SINGLE-SHOT MONOTONIC TIMER PER CPU. THE GOVERNOR ARMS IT JUST
// SHORT OF THE PREDICTED EVENT SO A TOO-DEEP SLEEP GETS ABORTED BY A
// SHALLOW TIMER WAKE INSTEAD OF A FULL-LATENCY EXIT.
//
// THE EXPIRY PATH MAY TOUCH EXACTLY TWO FLAGS: timer_active AND
// woke_by_timer. NOTHING ELSE IS SHARED WITH THE TIMER THREAD, SO
// RELAXED ATOMICS ARE ENOUGH -- NO MUTEXES ANYWHERE.
//
// LIVE BACKEND: A timerfd PER CPU, SERVICED BY A THREAD PINNED TO THE
// CPU IT WAKES (THE EXPIRY ITSELF IS WHAT YANKS THE CORE OUT OF ITS
// C-STATE). SIMULATION FIRES WakeFlags::on_expiry DIRECTLY.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Result};

pub struct WakeFlags {
    pub timer_active: AtomicBool,
    pub woke_by_timer: AtomicBool,
    pub needs_update: AtomicBool,
}

impl WakeFlags {
    pub fn new() -> Self {
        Self {
            timer_active: AtomicBool::new(false),
            woke_by_timer: AtomicBool::new(false),
            needs_update: AtomicBool::new(false),
        }
    }

    // EXPIRY CALLBACK. IF REFLECT ALREADY RAN (needs_update SET) THE
    // WAKE BELONGS TO THE PREVIOUS CYCLE AND MUST NOT BE CLASSIFIED AS
    // TIMER-CAUSED.
    pub fn on_expiry(&self) {
        self.timer_active.store(false, Ordering::Relaxed);
        if !self.needs_update.load(Ordering::Relaxed) {
            self.woke_by_timer.store(true, Ordering::Relaxed);
        }
    }
}

impl Default for WakeFlags {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WakeTimer {
    fd: i32,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WakeTimer {
    pub fn spawn(cpu: u32, flags: Arc<WakeFlags>) -> Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, 0) };
        if fd < 0 {
            bail!("timerfd_create failed for cpu{}", cpu);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name(format!("torpor-wake{}", cpu))
            .spawn(move || {
                pin_to_cpu(cpu);
                expiry_loop(fd, flags, thread_shutdown);
            })?;

        Ok(Self {
            fd,
            shutdown,
            thread: Some(thread),
        })
    }

    // SINGLE SHOT, RELATIVE. RE-ARMING OVERWRITES THE PREVIOUS DEADLINE.
    pub fn arm(&self, delay_us: u64) {
        settime(self.fd, delay_us);
    }

    // DISARM. AN EXPIRY THAT ALREADY FIRED HAS ALREADY CLEARED
    // timer_active; DISARMING AFTER THAT IS A NO-OP.
    pub fn cancel(&self) {
        settime(self.fd, 0);
    }
}

impl Drop for WakeTimer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // KICK THE BLOCKED READ SO THE THREAD SEES THE SHUTDOWN FLAG
        settime(self.fd, 1);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn expiry_loop(fd: i32, flags: Arc<WakeFlags>, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; 8];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if n == 8 {
            flags.on_expiry();
        } else if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break;
        }
    }
}

fn settime(fd: i32, delay_us: u64) {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: (delay_us / 1_000_000) as libc::time_t,
            tv_nsec: ((delay_us % 1_000_000) * 1_000) as libc::c_long,
        },
    };
    unsafe {
        libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut());
    }
}

fn pin_to_cpu(cpu: u32) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        // BEST EFFORT -- AN UNPINNED TIMER THREAD STILL WAKES THE BOX
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expiry_marks_timer_wake_when_no_update_pending() {
        let flags = WakeFlags::new();
        flags.timer_active.store(true, Ordering::Relaxed);
        flags.on_expiry();
        assert!(!flags.timer_active.load(Ordering::Relaxed));
        assert!(flags.woke_by_timer.load(Ordering::Relaxed));
    }

    #[test]
    fn expiry_after_reflect_is_not_a_timer_wake() {
        let flags = WakeFlags::new();
        flags.timer_active.store(true, Ordering::Relaxed);
        flags.needs_update.store(true, Ordering::Relaxed);
        flags.on_expiry();
        assert!(!flags.timer_active.load(Ordering::Relaxed));
        assert!(!flags.woke_by_timer.load(Ordering::Relaxed));
    }

    #[test]
    fn timerfd_backend_fires() {
        let flags = Arc::new(WakeFlags::new());
        let timer = WakeTimer::spawn(0, Arc::clone(&flags)).unwrap();
        flags.timer_active.store(true, Ordering::Relaxed);
        timer.arm(1_000);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!flags.timer_active.load(Ordering::Relaxed));
        assert!(flags.woke_by_timer.load(Ordering::Relaxed));
    }

    #[test]
    fn cancel_before_expiry_leaves_flags_alone() {
        let flags = Arc::new(WakeFlags::new());
        let timer = WakeTimer::spawn(0, Arc::clone(&flags)).unwrap();
        flags.timer_active.store(true, Ordering::Relaxed);
        timer.arm(500_000);
        timer.cancel();
        std::thread::sleep(Duration::from_millis(20));
        // GOVERNOR CLEARS timer_active ITSELF ON THE CANCEL PATH
        assert!(flags.timer_active.load(Ordering::Relaxed));
        assert!(!flags.woke_by_timer.load(Ordering::Relaxed));
    }
}
