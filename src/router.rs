//! Data-type routing.
//!
//! The [`Router`] maps a logical data type to the pool of the master that serves it. Each
//! data type has a primary and an optional secondary destination; traffic sticks to the
//! secondary after a failover and moves back as soon as the primary is enabled again.
//! Pools are created lazily, one per distinct `(host, port)`, and shared by every data
//! type routed to that destination.
use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use log::{debug, info, warn};

use crate::{
    breaker::{BreakerState, CircuitBreakerState},
    config::{ConfigHandle, Endpoint},
    pool::{ConnectionPool, HealthReport, PoolSnapshot},
    protocol::{Status, StatusClass},
    request::PendingRequest,
    stats::StatsCollector,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
    pub is_local: bool,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16, is_local: bool) -> Self {
        Self {
            host: host.into(),
            port,
            is_local,
        }
    }

    /// Resolves an endpoint, flagging loopback hosts as local.
    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        let is_local = endpoint.host.eq_ignore_ascii_case("localhost")
            || endpoint
                .host
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.is_loopback());
        Self::new(endpoint.host.clone(), endpoint.port, is_local)
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Destinations of one data type.
#[derive(Debug)]
pub struct ServerAttributes {
    pub primary: HostPort,
    pub secondary: Option<HostPort>,
    use_secondary: AtomicBool,
}

impl ServerAttributes {
    pub fn new(primary: HostPort, secondary: Option<HostPort>) -> Self {
        Self {
            primary,
            secondary,
            use_secondary: AtomicBool::new(false),
        }
    }

    pub fn use_secondary(&self) -> bool {
        self.use_secondary.load(Ordering::Acquire)
    }

    /// Flips the sticky flag. Returns `true` only for the caller that changed it.
    fn switch(&self, to_secondary: bool) -> bool {
        self.use_secondary
            .compare_exchange(
                !to_secondary,
                to_secondary,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Configured destinations. Routing decisions survive a config change that leaves these
/// equal.
type Targets = (
    Option<Endpoint>,
    Option<Endpoint>,
    HashMap<String, (Endpoint, Option<Endpoint>)>,
);

#[derive(Default)]
struct Attributes {
    version: u64,
    targets: Targets,
    by_data_type: HashMap<String, Arc<ServerAttributes>>,
}

pub struct Router {
    config: Arc<ConfigHandle>,
    stats: Arc<dyn StatsCollector>,
    pools: Mutex<HashMap<HostPort, ConnectionPool>>,
    attributes: Mutex<Attributes>,
    data_types: Mutex<HashMap<String, CircuitBreakerState>>,
    stopped: AtomicBool,
    routed: AtomicU64,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .field("routed", &self.routed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(config: Arc<ConfigHandle>, stats: Arc<dyn StatsCollector>) -> Self {
        Self {
            config,
            stats,
            pools: Mutex::new(HashMap::new()),
            attributes: Mutex::new(Attributes::default()),
            data_types: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            routed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    /// Picks the pool for `data_type` and queues `request` on it.
    ///
    /// On `false` the request has already been cancelled with the reason.
    pub fn route(&self, data_type: &str, request: Arc<PendingRequest>) -> bool {
        let pool = match self.select(data_type) {
            Ok(pool) => pool,
            Err(status) => {
                request.cancel(status);
                return false;
            }
        };
        if !pool.enqueue(Arc::clone(&request), false) {
            let (enabled, status) = pool.is_enabled();
            request.cancel(if enabled { Status::Throttled } else { status });
            return false;
        }
        self.routed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Resolves the enabled pool serving `data_type`, applying failover, or the status
    /// explaining why there is none.
    pub fn select(&self, data_type: &str) -> Result<ConnectionPool, Status> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Status::Stopped);
        }
        self.data_type_enabled(data_type)?;
        let attributes = self.attributes(data_type).ok_or(Status::PoolDisabled)?;

        let last = match self.try_target(&attributes.primary) {
            Ok(pool) => {
                if attributes.use_secondary() && attributes.switch(false) {
                    info!("{data_type}: primary {} is back", attributes.primary);
                    self.stats.failover(data_type, false);
                }
                return Ok(pool);
            }
            Err(status) => status,
        };

        let Some(secondary) = &attributes.secondary else {
            return Err(last);
        };
        let pool = self.try_target(secondary)?;
        if !attributes.use_secondary() && attributes.switch(true) {
            warn!(
                "{data_type}: failing over from {} ({last}) to {secondary}",
                attributes.primary
            );
            self.stats.failover(data_type, true);
        }
        Ok(pool)
    }

    /// Records a status observed for `data_type`. Data-type-level statuses disable the data
    /// type on every destination.
    pub fn report(&self, data_type: &str, status: Status) {
        if status.class() != StatusClass::DataTypeLevel {
            return;
        }
        let retry = self.config.snapshot().retry_interval_for(status);
        let mut data_types = self.lock_data_types();
        let breaker = data_types.entry(data_type.to_string()).or_default();
        if breaker.trip(status, retry, Instant::now()) {
            warn!(
                "{data_type}: disabled by {status} for {}s",
                retry.as_secs()
            );
            self.stats.breaker_tripped(data_type, status);
        }
    }

    pub fn data_type_state(&self, data_type: &str) -> BreakerState {
        self.lock_data_types()
            .get(data_type)
            .map_or(BreakerState::Enabled, CircuitBreakerState::state)
    }

    /// Pool for `target`, created on first use. Fails with [`Status::Stopped`] once the
    /// router is stopped.
    pub fn pool(&self, target: &HostPort) -> Result<ConnectionPool, Status> {
        let mut pools = self.lock_pools();
        // Checked under the pools lock, which `stop` takes after raising the flag.
        if self.stopped.load(Ordering::Acquire) {
            return Err(Status::Stopped);
        }
        let pool = pools.entry(target.clone()).or_insert_with(|| {
            debug!("creating pool for {target}");
            ConnectionPool::new(
                target.clone(),
                Arc::clone(&self.config),
                Arc::clone(&self.stats),
            )
        });
        Ok(pool.clone())
    }

    pub fn healthcheck(&self, target: &HostPort) -> HealthReport {
        match self.pool(target) {
            Ok(pool) => pool.healthcheck(),
            Err(status) => HealthReport {
                healthy: false,
                status,
                message: format!("{target}: routing stopped"),
            },
        }
    }

    pub fn pools(&self) -> Vec<PoolSnapshot> {
        let mut snapshots = self
            .lock_pools()
            .values()
            .map(ConnectionPool::snapshot)
            .collect::<Vec<_>>();
        snapshots.sort_by(|a, b| a.target.to_string().cmp(&b.target.to_string()));
        snapshots
    }

    /// Resumes routing after [`Router::stop`], forgetting every data-type decision.
    pub fn start(&self) {
        *self.lock_attributes() = Attributes::default();
        self.lock_data_types().clear();
        self.stopped.store(false, Ordering::Release);
        info!("routing started");
    }

    /// Disables routing and releases every pool. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools = self.lock_pools().drain().collect::<Vec<_>>();
        for (_, pool) in pools {
            pool.shutdown();
        }
        info!("routing stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn data_type_enabled(&self, data_type: &str) -> Result<(), Status> {
        let mut data_types = self.lock_data_types();
        let Some(breaker) = data_types.get_mut(data_type) else {
            return Ok(());
        };
        match breaker.is_enabled() {
            (true, _) => {
                // Data types have no probe of their own.
                breaker.take_healthcheck();
                Ok(())
            }
            (false, status) => {
                debug!("{data_type}: disabled by {status}");
                Err(Status::PoolDisabled)
            }
        }
    }

    fn attributes(&self, data_type: &str) -> Option<Arc<ServerAttributes>> {
        let config = self.config.snapshot();
        if !config.routes(data_type) {
            return None;
        }

        let version = self.config.version();
        let mut attributes = self.lock_attributes();
        if attributes.version != version {
            let targets = (
                config.master.clone(),
                config.secondary.clone(),
                config.data_type_targets.clone(),
            );
            if attributes.targets != targets {
                attributes.by_data_type.clear();
                attributes.targets = targets;
            }
            attributes.version = version;
        }
        if let Some(found) = attributes.by_data_type.get(data_type) {
            return Some(Arc::clone(found));
        }

        let (primary, secondary) = match config.data_type_targets.get(data_type) {
            Some((primary, secondary)) => (primary.clone(), secondary.clone()),
            None => (config.master.clone()?, config.secondary.clone()),
        };
        if primary.host.is_empty() || primary.port == 0 {
            return None;
        }
        let secondary = secondary
            .filter(|s| !s.host.is_empty() && s.port != 0)
            .map(|s| HostPort::from_endpoint(&s));
        let resolved = Arc::new(ServerAttributes::new(
            HostPort::from_endpoint(&primary),
            secondary,
        ));
        attributes
            .by_data_type
            .insert(data_type.to_string(), Arc::clone(&resolved));
        Some(resolved)
    }

    fn try_target(&self, target: &HostPort) -> Result<ConnectionPool, Status> {
        let config = self.config.snapshot();
        if target.is_local && config.local_port == Some(target.port) {
            // Never ask ourselves.
            return Err(Status::PoolDisabled);
        }

        let pool = self.pool(target)?;
        let (enabled, status) = pool.is_enabled();
        if !enabled {
            return Err(status);
        }
        if !config.asynchronous_healthcheck && !pool.run_pending_healthcheck() {
            return Err(pool.is_enabled().1);
        }
        Ok(pool)
    }

    fn lock_pools(&self) -> MutexGuard<'_, HashMap<HostPort, ConnectionPool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_attributes(&self) -> MutexGuard<'_, Attributes> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_data_types(&self) -> MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.data_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.stop();
    }
}
