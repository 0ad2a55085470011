//! Enable/disable-with-backoff state guarding a destination or a data type.
//!
//! The breaker has no timer of its own. A tripped breaker stays disabled until some caller
//! observes, through [`CircuitBreakerState::is_enabled`], that the retry interval has
//! elapsed; that caller re-enables it and flags a healthcheck. A successful healthcheck
//! re-enables it immediately.
//!
//! ```text
//! Enabled ──trip(status)──▶ Disabled(status, until)
//!    ▲                            │
//!    └──── now >= until ──────────┘   (sets needs_healthcheck)
//! ```
use std::time::{Duration, Instant};

use crate::protocol::Status;

/// Observable state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Enabled,
    Disabled { status: Status, until: Instant },
    HealthcheckPending,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    enabled: bool,
    last_status: Status,
    error_timestamp: Option<Instant>,
    retry_interval: Duration,
    needs_healthcheck: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerState {
    pub fn new() -> Self {
        Self {
            enabled: true,
            last_status: Status::None,
            error_timestamp: None,
            retry_interval: Duration::ZERO,
            needs_healthcheck: false,
        }
    }

    pub fn is_enabled(&mut self) -> (bool, Status) {
        self.is_enabled_at(Instant::now())
    }

    /// Whether traffic is allowed at `now`, and the status that disabled it if not.
    ///
    /// Re-enables an elapsed breaker and flags a healthcheck.
    pub fn is_enabled_at(&mut self, now: Instant) -> (bool, Status) {
        if self.enabled {
            return (true, Status::None);
        }
        match self.error_timestamp {
            Some(at) if now < at + self.retry_interval => (false, self.last_status),
            _ => {
                self.enabled = true;
                self.last_status = Status::None;
                self.needs_healthcheck = true;
                (true, Status::None)
            }
        }
    }

    /// Disables traffic for `retry_interval` from `now`. Returns `true` if the breaker was
    /// enabled before.
    pub fn trip(&mut self, status: Status, retry_interval: Duration, now: Instant) -> bool {
        let was_enabled = self.enabled;
        self.enabled = false;
        self.last_status = status;
        self.error_timestamp = Some(now);
        self.retry_interval = retry_interval;
        self.needs_healthcheck = false;
        was_enabled
    }

    /// Re-enables traffic at once, after a successful probe.
    pub fn reset(&mut self) {
        self.enabled = true;
        self.last_status = Status::None;
        self.error_timestamp = None;
        self.needs_healthcheck = false;
    }

    /// Like [`reset`](Self::reset), unless a trip recorded after `since` still holds.
    /// Returns whether the breaker was reset.
    pub fn reset_unless_tripped_since(&mut self, since: Instant) -> bool {
        let tripped_later = !self.enabled && self.error_timestamp.is_some_and(|at| at >= since);
        if tripped_later {
            return false;
        }
        self.reset();
        true
    }

    pub fn needs_healthcheck(&self) -> bool {
        self.needs_healthcheck
    }

    pub fn request_healthcheck(&mut self) {
        self.needs_healthcheck = true;
    }

    /// Clears the healthcheck flag, returning whether it was set.
    pub fn take_healthcheck(&mut self) -> bool {
        std::mem::take(&mut self.needs_healthcheck)
    }

    pub fn last_status(&self) -> Status {
        self.last_status
    }

    pub fn state(&self) -> BreakerState {
        match (self.enabled, self.error_timestamp) {
            (false, Some(at)) => BreakerState::Disabled {
                status: self.last_status,
                until: at + self.retry_interval,
            },
            (false, None) => BreakerState::Disabled {
                status: self.last_status,
                until: Instant::now(),
            },
            (true, _) if self.needs_healthcheck => BreakerState::HealthcheckPending,
            (true, _) => BreakerState::Enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_enabled() {
        let mut breaker = CircuitBreakerState::new();
        assert_eq!(breaker.is_enabled(), (true, Status::None));
        assert_eq!(breaker.state(), BreakerState::Enabled);
    }

    #[test]
    fn backs_off_then_reenables() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreakerState::new();

        assert!(breaker.trip(Status::ConnectionRefused, Duration::from_secs(30), t0));
        assert_eq!(
            breaker.is_enabled_at(t0 + Duration::from_secs(10)),
            (false, Status::ConnectionRefused)
        );
        assert_eq!(
            breaker.is_enabled_at(t0 + Duration::from_secs(29)),
            (false, Status::ConnectionRefused)
        );
        assert_eq!(
            breaker.is_enabled_at(t0 + Duration::from_secs(31)),
            (true, Status::None)
        );
        assert!(breaker.needs_healthcheck());
        assert_eq!(breaker.state(), BreakerState::HealthcheckPending);
    }

    #[test]
    fn stays_disabled_for_every_call_before_interval() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreakerState::new();
        breaker.trip(Status::QueueLimitExceeded, Duration::from_secs(12), t0);

        for s in 0..12 {
            let (enabled, status) = breaker.is_enabled_at(t0 + Duration::from_secs(s));
            assert!(!enabled);
            assert_eq!(status, Status::QueueLimitExceeded);
        }
        assert!(!breaker.needs_healthcheck());
    }

    #[test]
    fn retrip_extends_backoff() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreakerState::new();
        breaker.trip(Status::ConnectError, Duration::from_secs(10), t0);

        let t1 = t0 + Duration::from_secs(8);
        assert!(!breaker.trip(Status::DatabaseMismatch, Duration::from_secs(10), t1));
        assert_eq!(
            breaker.is_enabled_at(t0 + Duration::from_secs(12)),
            (false, Status::DatabaseMismatch)
        );
        assert_eq!(
            breaker.state(),
            BreakerState::Disabled {
                status: Status::DatabaseMismatch,
                until: t1 + Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn healthcheck_flag_is_taken_once() {
        let mut breaker = CircuitBreakerState::new();
        breaker.request_healthcheck();

        assert!(breaker.take_healthcheck());
        assert!(!breaker.take_healthcheck());
    }

    #[test]
    fn later_trip_survives_probe_reset() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreakerState::new();
        breaker.trip(Status::ConnectError, Duration::from_secs(60), t0);
        assert!(breaker.reset_unless_tripped_since(t0 + Duration::from_secs(1)));
        assert_eq!(breaker.state(), BreakerState::Enabled);

        let probe_started = t0 + Duration::from_secs(2);
        breaker.trip(
            Status::QueueLimitExceeded,
            Duration::from_secs(60),
            probe_started + Duration::from_millis(5),
        );
        assert!(!breaker.reset_unless_tripped_since(probe_started));
        assert_eq!(breaker.last_status(), Status::QueueLimitExceeded);
    }

    #[test]
    fn reset_reenables_immediately() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreakerState::new();
        breaker.trip(Status::HealthcheckTimeout, Duration::from_secs(60), t0);
        breaker.reset();

        assert_eq!(breaker.is_enabled_at(t0), (true, Status::None));
        assert!(!breaker.needs_healthcheck());
    }
}
