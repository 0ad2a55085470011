//! One-shot deadlines for blocking socket phases.
//!
//! A connection thread cannot be woken by a timer callback while it sits in a blocking
//! `read`, so each phase arms a [`Deadline`] and bounds every syscall by the time that
//! remains. Whether a phase timed out is decided by [`Deadline::fired`], never by how many
//! bytes happened to arrive: a response that completes just as the deadline passes is a
//! success, and a socket error after the deadline passed is a timeout.
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Deadline {
    expires: Instant,
    fired: bool,
    cancelled: bool,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(expires: Instant) -> Self {
        Self {
            expires,
            fired: false,
            cancelled: false,
        }
    }

    /// Time left before the deadline, or `None` once it has fired.
    ///
    /// Observing an elapsed deadline fires it. A cancelled deadline never fires.
    pub fn remaining(&mut self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&mut self, now: Instant) -> Option<Duration> {
        if self.cancelled {
            return Some(Duration::MAX);
        }
        if self.fired || now >= self.expires {
            self.fired = true;
            return None;
        }
        Some(self.expires - now)
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    /// Re-arms the deadline for a new phase.
    pub fn rearm(&mut self, timeout: Duration) {
        *self = Self::after(timeout);
    }

    /// Disarms the deadline. Cancelling a fired or cancelled deadline does nothing.
    pub fn cancel(&mut self) {
        if !self.fired {
            self.cancelled = true;
        }
    }

    pub fn expires(&self) -> Instant {
        self.expires
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_fires_once_elapsed() {
        let start = Instant::now();
        let mut deadline = Deadline::at(start + Duration::from_secs(5));

        assert_eq!(
            deadline.remaining_at(start + Duration::from_secs(2)),
            Some(Duration::from_secs(3))
        );
        assert!(!deadline.fired());

        assert_eq!(deadline.remaining_at(start + Duration::from_secs(5)), None);
        assert!(deadline.fired());

        // Stays fired even if the clock is observed earlier again.
        assert_eq!(deadline.remaining_at(start), None);
    }

    #[test]
    fn cancel_is_idempotent() {
        let start = Instant::now();
        let mut deadline = Deadline::at(start + Duration::from_secs(1));

        deadline.cancel();
        deadline.cancel();
        assert!(deadline.remaining_at(start + Duration::from_secs(10)).is_some());
        assert!(!deadline.fired());
    }

    #[test]
    fn cancel_after_fire_keeps_fired() {
        let start = Instant::now();
        let mut deadline = Deadline::at(start);

        assert_eq!(deadline.remaining_at(start), None);
        deadline.cancel();
        assert!(deadline.fired());
    }

    #[test]
    fn rearm_resets_state() {
        let mut deadline = Deadline::at(Instant::now());
        let _ = deadline.remaining();
        assert!(deadline.fired());

        deadline.rearm(Duration::from_secs(60));
        assert!(!deadline.fired());
        assert!(deadline.remaining().is_some());
    }
}
