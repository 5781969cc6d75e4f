//! Cross-process timed lock stored inside the mapped region.
//!
//! One lock word lives in shared memory per endpoint ring and serializes
//! writers targeting that ring. Acquisition is a bounded CAS loop that
//! escalates from busy-spinning through yielding to short sleeps; the hard
//! deadline guarantees a writer can never hang on a peer that died while
//! holding the lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Number of pure spin iterations before yielding.
const SPIN_LIMIT: u32 = 64;
/// Number of yield iterations before sleeping.
const YIELD_LIMIT: u32 = 128;
/// Sleep quantum once spinning and yielding are exhausted.
const SLEEP_QUANTUM: Duration = Duration::from_micros(50);

/// A timed mutual-exclusion word, cache-line aligned so contending
/// processes do not false-share neighbouring ring state.
#[repr(C, align(64))]
pub(crate) struct RegionLock {
    state: AtomicU32,
}

impl RegionLock {
    /// Reset to unlocked. Called once by the region creator.
    pub(crate) fn init(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    /// Single acquisition attempt.
    pub(crate) fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire with a deadline. Returns a guard, or `None` on timeout.
    pub(crate) fn lock_timeout(&self, timeout: Duration) -> Option<RegionLockGuard<'_>> {
        if self.try_lock() {
            return Some(RegionLockGuard { lock: self });
        }

        let deadline = Instant::now() + timeout;
        let mut attempts: u32 = 0;
        loop {
            if self.try_lock() {
                return Some(RegionLockGuard { lock: self });
            }
            if Instant::now() >= deadline {
                return None;
            }
            if attempts < SPIN_LIMIT {
                std::hint::spin_loop();
            } else if attempts < YIELD_LIMIT {
                std::thread::yield_now();
            } else {
                std::thread::sleep(SLEEP_QUANTUM);
            }
            attempts = attempts.saturating_add(1);
        }
    }

    fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

/// RAII guard releasing the lock on drop.
pub(crate) struct RegionLockGuard<'a> {
    lock: &'a RegionLock,
}

impl Drop for RegionLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
