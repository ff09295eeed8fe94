//! Three-state circuit breaker (closed / open / half-open) guarding a single
//! upstream target. Half-open admits exactly one in-flight trial at a time,
//! gated with a compare-and-swap so concurrent callers never race into the
//! same probe connection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// A single caller's permission to either proceed (closed / admitted trial)
/// or to back off (open, or half-open with no trial slot free).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    ProceedAsTrial,
    Reject,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    trial_in_flight: AtomicBool,
    epoch_start: Instant,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            epoch_start: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch_start.elapsed().as_millis() as u64
    }

    fn is_open(&self) -> bool {
        self.opened_at_millis.load(Ordering::Acquire) != 0
    }

    pub fn state(&self) -> BreakerState {
        if !self.is_open() {
            return BreakerState::Closed;
        }
        let opened_at = self.opened_at_millis.load(Ordering::Acquire);
        let elapsed = Duration::from_millis(self.now_millis().saturating_sub(opened_at));
        if elapsed >= self.cooldown { BreakerState::HalfOpen } else { BreakerState::Open }
    }

    /// Call before attempting a connection/query against the guarded target.
    pub fn admit(&self) -> Admission {
        match self.state() {
            BreakerState::Closed => Admission::Proceed,
            BreakerState::Open => Admission::Reject,
            BreakerState::HalfOpen => {
                // CAS: only the caller that flips false->true gets to run the trial.
                if self
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Admission::ProceedAsTrial
                } else {
                    Admission::Reject
                }
            },
        }
    }

    pub fn record_success(&self, was_trial: bool) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        if was_trial {
            self.trial_in_flight.store(false, Ordering::Release);
        }
    }

    pub fn record_failure(&self, was_trial: bool) {
        if was_trial {
            self.trial_in_flight.store(false, Ordering::Release);
            // A failed trial re-opens immediately, restarting the cooldown clock.
            self.opened_at_millis.store(self.now_millis().max(1), Ordering::Release);
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold {
            self.opened_at_millis.store(self.now_millis().max(1), Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(50));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.admit(), Admission::Proceed);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));
        cb.record_failure(false);
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure(false);
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.admit(), Admission::Reject);
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.record_failure(false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.admit(), Admission::ProceedAsTrial);
        assert_eq!(cb.admit(), Admission::Reject);
    }

    #[test]
    fn successful_trial_closes_breaker() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.record_failure(false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.admit(), Admission::ProceedAsTrial);
        cb.record_success(true);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_trial_reopens_and_restarts_cooldown() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(5));
        cb.record_failure(false);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cb.admit(), Admission::ProceedAsTrial);
        cb.record_failure(true);
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
