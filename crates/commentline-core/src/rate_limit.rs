//! Requests-per-second limiter for the classification service
//!
//! Token bucket expressed as GCRA: a single atomic "theoretical arrival time"
//! is advanced with compare-and-swap, so callers reserve their slot without a
//! lock and then sleep outside any critical section.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

/// Token-refill rate limiter shared by all annotation workers.
#[derive(Debug)]
pub struct RateLimiter {
    /// Nanoseconds between tokens; 0 disables limiting
    interval: u64,
    /// How far ahead of schedule a burst may run
    tolerance: u64,
    origin: Instant,
    /// Theoretical arrival time of the next request, nanos since `origin`
    tat: AtomicU64,
}

impl RateLimiter {
    /// `per_second` requests per second with up to `burst` requests back to back.
    ///
    /// A non-positive rate disables limiting.
    pub fn new(per_second: f64, burst: u32) -> Self {
        let interval = if per_second > 0.0 && per_second.is_finite() {
            (1e9 / per_second) as u64
        } else {
            0
        };
        Self {
            interval,
            tolerance: interval.saturating_mul(u64::from(burst.max(1) - 1)),
            origin: Instant::now(),
            tat: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    /// Reserve the next slot and return how long the caller must wait for it.
    pub fn reserve(&self) -> Duration {
        if self.interval == 0 {
            return Duration::ZERO;
        }
        let now = self.origin.elapsed().as_nanos() as u64;
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let start = tat.max(now);
            match self.tat.compare_exchange_weak(
                tat,
                start.saturating_add(self.interval),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let wait = start.saturating_sub(self.tolerance).saturating_sub(now);
                    return Duration::from_nanos(wait);
                }
                Err(actual) => tat = actual,
            }
        }
    }

    /// Block until a token is available.
    ///
    /// Returns `false` if cancelled while waiting.
    pub fn acquire(&self, cancel: &CancelToken) -> bool {
        let wait = self.reserve();
        if wait.is_zero() {
            return !cancel.is_cancelled();
        }
        log::trace!("rate limiter: waiting {}ms", wait.as_millis());
        cancel.sleep(wait)
    }
}
