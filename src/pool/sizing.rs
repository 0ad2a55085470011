//! Admission and adaptive sizing for a connection pool.
//!
//! [`Sizer::admit`] is a local, greedy controller evaluated on every enqueue. It grows the
//! pool when the queue outruns `active * queue_tolerance`, refuses work once the pool is at
//! `max_clients` and still saturated, and periodically stops one connection when the mean
//! queue depth since the last evaluation sits well below the growth threshold. Idle
//! connections also time out on their own, so shrinking needs no explicit step beyond that.
use std::time::{Duration, Instant};

/// Pool occupancy seen under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    /// Live connections not asked to stop, including the ones still connecting.
    pub active: usize,
    /// Connections still in the connect phase.
    pub connecting: usize,
    pub queued: usize,
}

/// What the pool should do with one enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub accept: bool,
    pub spawn: bool,
    /// Stop one connection because of sustained low queue depth.
    pub shrink: bool,
}

impl Admission {
    fn accept() -> Self {
        Self {
            accept: true,
            spawn: false,
            shrink: false,
        }
    }

    fn spawn() -> Self {
        Self {
            accept: true,
            spawn: true,
            shrink: false,
        }
    }

    fn refuse() -> Self {
        Self {
            accept: false,
            spawn: false,
            shrink: false,
        }
    }
}

/// Sizing limits, taken from the configuration snapshot of the enqueue.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_clients: usize,
    pub min_clients: usize,
    pub queue_tolerance: f64,
    pub sampling_interval: u64,
    pub adjust_interval: Duration,
    pub shrink_ratio: f64,
}

impl From<&crate::config::Config> for Limits {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            max_clients: config.max_clients.max(1),
            min_clients: config.min_clients().min(config.max_clients.max(1)),
            queue_tolerance: config.queue_tolerance,
            sampling_interval: config.sampling_interval,
            adjust_interval: config.adjust_interval,
            shrink_ratio: config.shrink_ratio,
        }
    }
}

/// Queue-depth accumulator between two shrink evaluations.
#[derive(Debug, Clone)]
pub struct Sizer {
    samples: u64,
    depth_sum: u64,
    last_adjust: Instant,
    enqueues: u64,
}

impl Default for Sizer {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl Sizer {
    pub fn new(now: Instant) -> Self {
        Self {
            samples: 0,
            depth_sum: 0,
            last_adjust: now,
            enqueues: 0,
        }
    }

    /// Total enqueues seen, accepted or not.
    pub fn enqueues(&self) -> u64 {
        self.enqueues
    }

    /// Decides one enqueue. Counters move on every call, whatever the outcome.
    pub fn admit(
        &mut self,
        occupancy: Occupancy,
        limits: &Limits,
        healthcheck: bool,
        now: Instant,
    ) -> Admission {
        self.enqueues += 1;
        self.samples += 1;
        self.depth_sum += occupancy.queued as u64;

        let Occupancy {
            active,
            connecting,
            queued,
        } = occupancy;
        let can_spawn = active < limits.max_clients && connecting == 0;

        // Below min, grow only while no connection would sit idle: live connections
        // never exceed queued + 1.
        let below_min = active < limits.min_clients;
        let idle_free = active <= queued;

        if healthcheck {
            if active >= limits.max_clients {
                return Admission::refuse();
            }
            let wanted = if below_min { idle_free } else { queued > 0 };
            return if wanted && can_spawn {
                Admission::spawn()
            } else {
                Admission::accept()
            };
        }

        if below_min {
            return if idle_free && can_spawn {
                Admission::spawn()
            } else {
                Admission::accept()
            };
        }

        let threshold = threshold(active, limits.queue_tolerance);
        if queued + 1 > threshold {
            if active >= limits.max_clients {
                return Admission::refuse();
            }
            return if can_spawn {
                Admission::spawn()
            } else {
                Admission::accept()
            };
        }

        let mut admission = Admission::accept();
        if self.evaluation_due(limits, now) {
            let mean = self.depth_sum as f64 / self.samples.max(1) as f64;
            admission.shrink =
                active > limits.min_clients && mean < threshold as f64 * limits.shrink_ratio;
            self.reset(now);
        }
        admission
    }

    fn evaluation_due(&self, limits: &Limits, now: Instant) -> bool {
        let by_count = limits.sampling_interval > 0 && self.samples >= limits.sampling_interval;
        let by_time = !limits.adjust_interval.is_zero()
            && now.saturating_duration_since(self.last_adjust) >= limits.adjust_interval;
        by_count || by_time
    }

    fn reset(&mut self, now: Instant) {
        self.samples = 0;
        self.depth_sum = 0;
        self.last_adjust = now;
    }
}

/// Queue depth above which the pool grows, for `active` connections.
pub fn threshold(active: usize, queue_tolerance: f64) -> usize {
    (active as f64 * queue_tolerance).round() as usize
}
