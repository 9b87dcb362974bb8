//! # Backoff
//!
//! Polling with escalation: spin a little, then yield, then park for slices that double up to [MAX_PARK].
//! A slice never runs past the caller's deadline.
//!
//! Only the mutex's timed and cancellable locking polls this way, a polling locker notices an unlock up to [MAX_PARK] late.
//! Condvar timed waits don't poll, notifiers unpark them.

use std::{
    hint, thread,
    time::{Duration, Instant},
};

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const MIN_PARK: Duration = Duration::from_micros(50);
/// the longest single park, bounds how late a polling waiter notices a change
const MAX_PARK: Duration = Duration::from_millis(10);
/// used when `now + timeout` doesn't fit into an Instant
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits a bit, longer on every call. Returns right away if the deadline has passed.
    pub fn snooze(&mut self, deadline: Option<Instant>) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            thread::yield_now();
        } else {
            let slice = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(self.park_slice()),
                None => self.park_slice(),
            };
            if !slice.is_zero() {
                thread::park_timeout(slice);
            }
        }
        // 2^8 x MIN_PARK is past MAX_PARK already
        if self.step <= YIELD_LIMIT + 8 {
            self.step += 1;
        }
    }

    /// MIN_PARK on the first park, doubling from there
    fn park_slice(&self) -> Duration {
        let doublings = self.step.saturating_sub(YIELD_LIMIT + 1);
        MIN_PARK.saturating_mul(1 << doublings).min(MAX_PARK)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// `Instant::now() + timeout`, saturating instead of panicking on huge timeouts
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
