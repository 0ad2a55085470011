//! Connection pools.
//!
//! A [`ConnectionPool`] owns everything that concerns one `(host, port)`: the queue of
//! pending requests, the set of live connections serving it, and the breaker guarding it.
//! All three sit behind one mutex so that a breaker trip is linearized with respect to
//! enqueue and dequeue: once a host-level status is recorded, no request that was queued
//! survives and no new request is admitted until the breaker re-enables.
//!
//! # Lifecycle of a request
//!
//! 1. [`ConnectionPool::enqueue`] consults the breaker and the [`sizing`] controller, then
//!    queues the request and possibly spawns a connection.
//! 2. A connection thread takes it with `next_request` and runs the wire exchange.
//! 3. Failures come back through [`ConnectionPool::set_status`].
//!
//! Connections that find no work for `IDLE_SLAVE_TIMEOUT` stop on their own while the pool
//! holds more than `min_clients` of them, which is how the pool shrinks when load drops.
pub mod sizing;

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    breaker::{BreakerState, CircuitBreakerState},
    config::ConfigHandle,
    connection::Connection,
    protocol::Status,
    request::PendingRequest,
    router::HostPort,
    stats::StatsCollector,
};

use sizing::{Limits, Occupancy, Sizer};

/// Outcome of a pool healthcheck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: Status,
    pub message: String,
}

/// Introspection copy of a pool's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub target: HostPort,
    pub active: usize,
    pub connecting: usize,
    pub stopping: usize,
    pub queued: usize,
    pub enqueues: u64,
    pub breaker: BreakerState,
}

#[derive(Debug)]
struct ConnectionSlot {
    id: u64,
    connecting: bool,
    stopping: bool,
}

struct PoolState {
    queue: VecDeque<Arc<PendingRequest>>,
    connections: Vec<ConnectionSlot>,
    breaker: CircuitBreakerState,
    sizer: Sizer,
    next_connection: u64,
    healthcheck_loop: bool,
    last_probe: Instant,
    shutdown: bool,
}

impl PoolState {
    fn occupancy(&self) -> Occupancy {
        let live = self.connections.iter().filter(|c| !c.stopping);
        let (mut active, mut connecting) = (0, 0);
        for slot in live {
            active += 1;
            if slot.connecting {
                connecting += 1;
            }
        }
        Occupancy {
            active,
            connecting,
            queued: self.queue.len(),
        }
    }

    fn slot(&mut self, id: u64) -> Option<&mut ConnectionSlot> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    fn drain_queue(&mut self, status: Status) -> usize {
        let drained = self.queue.len();
        for request in self.queue.drain(..) {
            request.cancel(status);
        }
        drained
    }

    /// Breaker check that drops the probe a re-enable owes when healthchecks are off.
    fn breaker_enabled(&mut self, healthcheck: bool) -> (bool, Status) {
        let result = self.breaker.is_enabled();
        if !healthcheck {
            self.breaker.take_healthcheck();
        }
        result
    }

    fn probe_due(&self, period: Duration) -> bool {
        !period.is_zero() && self.last_probe.elapsed() >= period
    }

    /// Claims the owed probe, if any.
    fn take_probe(&mut self) -> bool {
        let owed = self.breaker.take_healthcheck();
        if owed {
            self.last_probe = Instant::now();
        }
        owed
    }

    fn stop_all(&mut self) {
        for slot in self.connections.iter_mut() {
            slot.stopping = true;
        }
    }
}

struct PoolInner {
    target: HostPort,
    config: Arc<ConfigHandle>,
    stats: Arc<dyn StatsCollector>,
    state: Mutex<PoolState>,
    work: Condvar,
    probe: Condvar,
}

/// Shared handle to the pool of connections for one destination.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.target)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(
        target: HostPort,
        config: Arc<ConfigHandle>,
        stats: Arc<dyn StatsCollector>,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(PoolInner {
                target,
                config,
                stats,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    connections: Vec::new(),
                    breaker: CircuitBreakerState::new(),
                    sizer: Sizer::new(now),
                    next_connection: 1,
                    healthcheck_loop: false,
                    last_probe: now,
                    shutdown: false,
                }),
                work: Condvar::new(),
                probe: Condvar::new(),
            }),
        }
    }

    pub fn target(&self) -> &HostPort {
        &self.inner.target
    }

    pub(crate) fn config(&self) -> &ConfigHandle {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the breaker lets traffic through, and the status that tripped it if not.
    ///
    /// Re-enables an elapsed breaker, and owes a probe once `HEALTHCHECK_PERIOD` passed
    /// since the last one. In asynchronous mode the probe is handed to the pool's
    /// healthcheck loop.
    pub fn is_enabled(&self) -> (bool, Status) {
        let config = self.inner.config.snapshot();
        let mut state = self.lock();
        if state.shutdown {
            return (false, Status::Stopped);
        }
        let result = state.breaker_enabled(config.healthcheck);
        if !config.healthcheck {
            return result;
        }
        if result.0 && state.probe_due(config.healthcheck_period) {
            state.breaker.request_healthcheck();
        }
        if config.asynchronous_healthcheck {
            self.ensure_healthcheck_loop(&mut state);
            if state.breaker.needs_healthcheck() {
                self.inner.probe.notify_all();
            }
        }
        result
    }

    /// Queues `request` for a connection.
    ///
    /// Returns `false` without queuing when the breaker is disabled or the pool is
    /// saturated; the caller then owns the request and must cancel it.
    pub fn enqueue(&self, request: Arc<PendingRequest>, healthcheck: bool) -> bool {
        let config = self.inner.config.snapshot();
        let limits = Limits::from(config.as_ref());
        let mut state = self.lock();

        if state.shutdown {
            return false;
        }
        let (enabled, status) = state.breaker_enabled(config.healthcheck);
        if !enabled {
            debug!(
                "{}: rejecting request {}, pool disabled by {status}",
                self.inner.target,
                request.id()
            );
            // Sizing counters move on every enqueue.
            let occupancy = state.occupancy();
            let _ = state
                .sizer
                .admit(occupancy, &limits, healthcheck, Instant::now());
            return false;
        }

        let occupancy = state.occupancy();
        let admission = state
            .sizer
            .admit(occupancy, &limits, healthcheck, Instant::now());

        if admission.shrink {
            self.stop_one(&mut state);
        }
        if !admission.accept {
            debug!(
                "{}: throttling request {}, {} queued on {} connections",
                self.inner.target,
                request.id(),
                occupancy.queued,
                occupancy.active
            );
            return false;
        }

        state.queue.push_back(request);
        if admission.spawn {
            self.spawn_connection(&mut state);
        }
        self.inner.work.notify_one();
        true
    }

    /// Records a failure observed by a connection. Host-level statuses trip the breaker,
    /// cancel every queued request and stop every connection.
    pub fn set_status(&self, status: Status) {
        let config = self.inner.config.snapshot();
        if !status.is_host_level(config.ignore_database_mismatch) {
            debug!("{}: request-level failure {status}", self.inner.target);
            return;
        }

        let retry = config.retry_interval_for(status);
        let mut state = self.lock();
        let was_enabled = state.breaker.trip(status, retry, Instant::now());
        let drained = state.drain_queue(status);
        state.stop_all();
        drop(state);

        self.inner.work.notify_all();
        if was_enabled {
            warn!(
                "{}: disabled by {status} for {}s, {drained} queued requests cancelled",
                self.inner.target,
                retry.as_secs()
            );
            self.inner
                .stats
                .breaker_tripped(&self.inner.target.to_string(), status);
        }
    }

    /// Whether a probe is owed before traffic should resume.
    pub fn need_healthcheck(&self) -> bool {
        let config = self.inner.config.snapshot();
        config.healthcheck && self.lock().breaker.needs_healthcheck()
    }

    /// Runs the owed probe inline, if any. Returns `false` only if a probe ran and failed.
    pub fn run_pending_healthcheck(&self) -> bool {
        let config = self.inner.config.snapshot();
        if !config.healthcheck {
            return true;
        }
        if !self.lock().take_probe() {
            return true;
        }
        self.healthcheck().healthy
    }

    /// Sends a zero-payload ping through the pool and folds the outcome into the breaker.
    pub fn healthcheck(&self) -> HealthReport {
        let config = self.inner.config.snapshot();
        let target = &self.inner.target;

        let (enabled, status) = self.is_enabled();
        if !enabled {
            return HealthReport {
                healthy: false,
                status,
                message: format!("{target}: disabled by {status}"),
            };
        }

        let started = Instant::now();
        let request = PendingRequest::healthcheck(config.healthcheck_timeout);
        if !self.enqueue(Arc::clone(&request), true) {
            request.cancel(Status::Throttled);
            return HealthReport {
                healthy: false,
                status: Status::Throttled,
                message: format!("{target}: healthcheck not admitted"),
            };
        }

        let outcome = request.wait();
        let mut state = self.lock();
        state.last_probe = Instant::now();
        if outcome.status == Status::HealthcheckOk {
            if !state.breaker.reset_unless_tripped_since(started) {
                let status = state.breaker.last_status();
                drop(state);
                warn!("{target}: healthcheck passed, but {status} disabled the pool meanwhile");
                return HealthReport {
                    healthy: false,
                    status,
                    message: format!("{target}: disabled by {status}"),
                };
            }
            drop(state);
            debug!("{target}: healthcheck passed in {:?}", request.elapsed());
            return HealthReport {
                healthy: true,
                status: outcome.status,
                message: format!("{target}: healthy"),
            };
        }

        drop(state);
        // Host-level failures were already recorded by the connection.
        if !outcome.status.is_host_level(config.ignore_database_mismatch) {
            self.set_status(Status::HealthcheckTimeout);
        }
        warn!("{target}: healthcheck failed with {}", outcome.status);
        HealthReport {
            healthy: false,
            status: outcome.status,
            message: format!("{target}: healthcheck failed with {}", outcome.status),
        }
    }

    /// Stops every connection and cancels every queued request. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let drained = state.drain_queue(Status::Stopped);
        state.stop_all();
        drop(state);

        self.inner.work.notify_all();
        self.inner.probe.notify_all();
        info!("{}: pool shut down, {drained} queued requests cancelled", self.inner.target);
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock();
        let occupancy = state.occupancy();
        PoolSnapshot {
            target: self.inner.target.clone(),
            active: occupancy.active,
            connecting: occupancy.connecting,
            stopping: state.connections.iter().filter(|c| c.stopping).count(),
            queued: occupancy.queued,
            enqueues: state.sizer.enqueues(),
            breaker: state.breaker.state(),
        }
    }

    /// Live connections, including the ones asked to stop but not yet gone.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn stop_one(&self, state: &mut PoolState) {
        let victim = state
            .connections
            .iter_mut()
            .rev()
            .find(|c| !c.stopping && !c.connecting);
        if let Some(slot) = victim {
            slot.stopping = true;
            info!(
                "{}: shrinking, stopping connection {}",
                self.inner.target, slot.id
            );
            self.inner.work.notify_all();
        }
    }

    fn spawn_connection(&self, state: &mut PoolState) {
        let id = state.next_connection;
        state.next_connection += 1;
        state.connections.push(ConnectionSlot {
            id,
            connecting: true,
            stopping: false,
        });

        let connection = Connection::pooled(self.clone(), id);
        let spawned = thread::Builder::new()
            .name(format!("rcache-{}-{id}", self.inner.target))
            .spawn(move || connection.run());

        match spawned {
            Ok(_) => {
                debug!("{}: spawned connection {id}", self.inner.target);
                self.inner
                    .stats
                    .connection_spawned(&self.inner.target.to_string());
            }
            Err(e) => {
                error!("{}: failed to spawn connection: {e}", self.inner.target);
                state.connections.retain(|c| c.id != id);
            }
        }
    }

    fn ensure_healthcheck_loop(&self, state: &mut PoolState) {
        if state.healthcheck_loop || state.shutdown {
            return;
        }
        let pool = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("rcache-hc-{}", self.inner.target))
            .spawn(move || pool.healthcheck_loop());
        match spawned {
            Ok(_) => state.healthcheck_loop = true,
            Err(e) => error!(
                "{}: failed to spawn healthcheck loop: {e}",
                self.inner.target
            ),
        }
    }

    /// Background prober used in asynchronous healthcheck mode.
    fn healthcheck_loop(self) {
        const POLL: Duration = Duration::from_secs(1);

        let mut state = self.lock();
        loop {
            if state.shutdown {
                break;
            }
            let config = self.inner.config.snapshot();
            if !config.asynchronous_healthcheck || !config.healthcheck {
                break;
            }

            let (enabled, _) = state.breaker.is_enabled();
            if enabled && state.probe_due(config.healthcheck_period) {
                state.breaker.request_healthcheck();
            }
            if state.take_probe() {
                drop(state);
                let report = self.healthcheck();
                debug!("{}", report.message);
                state = self.lock();
                continue;
            }

            state = self
                .inner
                .probe
                .wait_timeout(state, POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.healthcheck_loop = false;
    }

    // Connection-facing API.

    pub(crate) fn connected(&self, id: u64) {
        if let Some(slot) = self.lock().slot(id) {
            slot.connecting = false;
        }
    }

    pub(crate) fn stop_requested(&self, id: u64) -> bool {
        let mut state = self.lock();
        state.shutdown || state.slot(id).is_none_or(|slot| slot.stopping)
    }

    /// Blocks until a request is available for connection `id`.
    ///
    /// Returns `None` when the connection must stop: it was asked to, the pool shut down,
    /// or no work arrived within the idle timeout while the pool holds more than
    /// `min_clients` connections.
    pub(crate) fn next_request(&self, id: u64) -> Option<Arc<PendingRequest>> {
        let config = self.inner.config.snapshot();
        let idle_timeout = config.idle_timeout;
        let min_clients = Limits::from(config.as_ref()).min_clients;
        let mut deadline = Instant::now() + idle_timeout;
        let mut state = self.lock();

        loop {
            if state.shutdown || state.slot(id).is_none_or(|slot| slot.stopping) {
                return None;
            }
            while let Some(request) = state.queue.pop_front() {
                if !request.is_cancelled() {
                    return Some(request);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if state.occupancy().active > min_clients {
                    if let Some(slot) = state.slot(id) {
                        slot.stopping = true;
                    }
                    debug!("{}: connection {id} idle, stopping", self.inner.target);
                    return None;
                }
                // Kept warm.
                deadline = now + idle_timeout;
            }
            state = if deadline > now {
                self.inner
                    .work
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            } else {
                self.inner
                    .work
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner)
            };
        }
    }

    /// Unregisters connection `id`. If it was the last one and work is still queued, a
    /// replacement is spawned so the queue never strands.
    pub(crate) fn connection_finished(&self, id: u64) {
        let healthcheck = self.inner.config.snapshot().healthcheck;
        let mut state = self.lock();
        state.connections.retain(|c| c.id != id);
        self.inner
            .stats
            .connection_stopped(&self.inner.target.to_string());

        let (enabled, _) = state.breaker_enabled(healthcheck);
        let stranded = !state.shutdown
            && enabled
            && !state.queue.is_empty()
            && state.connections.iter().all(|c| c.stopping);
        if stranded {
            self.spawn_connection(&mut state);
        }
    }
}
