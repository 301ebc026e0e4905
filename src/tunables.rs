// TORPOR TUNABLES
// THE TWO EXTERNALLY WRITABLE THRESHOLDS. ONE SHARED BLOCK, ATOMICS
// ONLY, RELAXED ORDERING -- A WRITE FROM THE TUNING SURFACE IS PICKED
// UP BY EVERY CPU'S NEXT NETWORK-EXPERT WINDOW. NO INVARIANT BINDS
// THE TWO VALUES TOGETHER; WHICHEVER WRITE LANDS LAST WINS.

use std::sync::atomic::{AtomicU64, Ordering};

// INTER-ARRIVAL ABOVE THIS: NO NETWORK ACTIVITY, PARK CANDIDATE
pub const DEFAULT_DEEP_THRESHOLD_US: u64 = 10_000;
// INTER-ARRIVAL BELOW THIS: REQUEST A SIBLING CPU ONLINE
pub const DEFAULT_SHALLOW_THRESHOLD_US: u64 = 50;

pub struct Tunables {
    deep_threshold_us: AtomicU64,
    shallow_threshold_us: AtomicU64,
}

impl Tunables {
    pub fn new(deep_us: u64, shallow_us: u64) -> Self {
        Self {
            deep_threshold_us: AtomicU64::new(deep_us),
            shallow_threshold_us: AtomicU64::new(shallow_us),
        }
    }

    pub fn deep_threshold_us(&self) -> u64 {
        self.deep_threshold_us.load(Ordering::Relaxed)
    }

    pub fn shallow_threshold_us(&self) -> u64 {
        self.shallow_threshold_us.load(Ordering::Relaxed)
    }

    pub fn set_deep_threshold_us(&self, us: u64) {
        self.deep_threshold_us.store(us, Ordering::Relaxed);
    }

    pub fn set_shallow_threshold_us(&self, us: u64) {
        self.shallow_threshold_us.store(us, Ordering::Relaxed);
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new(DEFAULT_DEEP_THRESHOLD_US, DEFAULT_SHALLOW_THRESHOLD_US)
    }
}
