//! Write-only statistics sink.
//!
//! Pools and connections report events through [`StatsCollector`]; they never read
//! statistics back. [`Stats`] is the in-process implementation used by the console.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::protocol::{Status, StatusClass};

pub trait StatsCollector: Send + Sync {
    /// A request reached a terminal state.
    fn request_finished(&self, data_type: &str, status: Status, elapsed: Duration);

    fn breaker_tripped(&self, target: &str, status: Status);

    fn connection_spawned(&self, target: &str);

    fn connection_stopped(&self, target: &str);

    /// Traffic for a data type moved between primary and secondary.
    fn failover(&self, data_type: &str, to_secondary: bool);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoStats;

impl StatsCollector for NoStats {
    fn request_finished(&self, _: &str, _: Status, _: Duration) {}
    fn breaker_tripped(&self, _: &str, _: Status) {}
    fn connection_spawned(&self, _: &str) {}
    fn connection_stopped(&self, _: &str) {}
    fn failover(&self, _: &str, _: bool) {}
}

#[derive(Debug, Default)]
pub struct Stats {
    found: AtomicU64,
    not_found: AtomicU64,
    host_errors: AtomicU64,
    data_type_errors: AtomicU64,
    request_errors: AtomicU64,
    rejected: AtomicU64,
    latency_micros: AtomicU64,
    trips: AtomicU64,
    spawned: AtomicU64,
    stopped: AtomicU64,
    failovers: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub found: u64,
    pub not_found: u64,
    pub host_errors: u64,
    pub data_type_errors: u64,
    pub request_errors: u64,
    pub rejected: u64,
    pub latency_micros: u64,
    pub trips: u64,
    pub spawned: u64,
    pub stopped: u64,
    pub failovers: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            found: load(&self.found),
            not_found: load(&self.not_found),
            host_errors: load(&self.host_errors),
            data_type_errors: load(&self.data_type_errors),
            request_errors: load(&self.request_errors),
            rejected: load(&self.rejected),
            latency_micros: load(&self.latency_micros),
            trips: load(&self.trips),
            spawned: load(&self.spawned),
            stopped: load(&self.stopped),
            failovers: load(&self.failovers),
        }
    }

    /// One-line summary.
    pub fn report(&self) -> String {
        let s = self.snapshot();
        let answered = s.found + s.not_found;
        let mean = if answered == 0 {
            0
        } else {
            s.latency_micros / answered
        };
        format!(
            "found={} not_found={} host_errors={} data_type_errors={} request_errors={} \
             rejected={} mean_latency_us={} trips={} spawned={} stopped={} failovers={}",
            s.found,
            s.not_found,
            s.host_errors,
            s.data_type_errors,
            s.request_errors,
            s.rejected,
            mean,
            s.trips,
            s.spawned,
            s.stopped,
            s.failovers
        )
    }
}

impl StatsCollector for Stats {
    fn request_finished(&self, _data_type: &str, status: Status, elapsed: Duration) {
        let counter = match status {
            Status::ValueFound => &self.found,
            Status::NotFound => &self.not_found,
            status => match status.class() {
                StatusClass::HostLevel => &self.host_errors,
                StatusClass::DataTypeLevel => &self.data_type_errors,
                StatusClass::Admission => &self.rejected,
                StatusClass::Success | StatusClass::Request => &self.request_errors,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if status.is_success() {
            let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
            self.latency_micros.fetch_add(micros, Ordering::Relaxed);
        }
    }

    fn breaker_tripped(&self, _target: &str, _status: Status) {
        self.trips.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_spawned(&self, _target: &str) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_stopped(&self, _target: &str) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    fn failover(&self, _data_type: &str, _to_secondary: bool) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }
}
