//! Circuit breaker shared by the bus publisher and the order
//! executor: a consecutive-failure threshold trips the breaker, a
//! recovery timeout allows one probe through, and a run of consecutive
//! successes in HALF_OPEN closes it again.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    recovery: Duration,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    opened_at_millis: AtomicU64,
    state: parking_lot::RwLock<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, recovery: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            recovery,
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            state: parking_lot::RwLock::new(CircuitState::Closed),
        }
    }

    /// Call before attempting the guarded operation. Returns `false` when
    /// the call should be skipped (circuit open and recovery window not
    /// yet elapsed); flips OPEN -> HALF_OPEN as a side effect once the
    /// recovery window has elapsed, allowing exactly the caller's probe
    /// through.
    pub fn allow(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::SeqCst);
                if now_millis().saturating_sub(opened_at) >= self.recovery.as_millis() as u64 {
                    *self.state.write() = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let state = *self.state.read();
        if state == CircuitState::HalfOpen {
            let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.success_threshold {
                *self.state.write() = CircuitState::Closed;
                self.consecutive_successes.store(0, Ordering::SeqCst);
            }
        }
    }

    pub fn record_failure(&self) {
        self.consecutive_successes.store(0, Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let state = *self.state.read();
        if state == CircuitState::HalfOpen || failures >= self.failure_threshold {
            *self.state.write() = CircuitState::Open;
            self.opened_at_millis.store(now_millis(), Ordering::SeqCst);
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn closes_after_success_threshold_in_half_open() {
        let cb = CircuitBreaker::new(1, 2, Duration::from_millis(0));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new(1, 2, Duration::from_millis(0));
        cb.record_failure();
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
