//! Caller-facing surface.
//!
//! Data-access code depends on [`CacheClient`] only. Every answer other than
//! [`Status::ValueFound`] or [`Status::NotFound`] means "compute the value yourself": the
//! remote cache is a latency shortcut and never a source of truth.
//!
//! # Example
//! ```no_run
//! use rcache::{CacheClient, Config, RemoteCache};
//!
//! let config: Config = "MASTER_HOST=cache01\nMASTER_PORT=53701".parse().unwrap();
//! let cache = RemoteCache::new(config);
//!
//! let result = cache.fetch("FareInfo", b"ATL|DFW", false, 3);
//! if let Some(value) = result.value {
//!     println!("{} bytes from the master", value.len());
//! }
//! ```
use std::sync::Arc;

use log::debug;

use crate::{
    config::{Config, ConfigError, ConfigHandle, Endpoint},
    connection::Connection,
    database::CurrentDatabase,
    protocol::{RequestKey, Status},
    request::PendingRequest,
    router::{HostPort, Router},
    stats::{Stats, StatsCollector},
};

/// Answer to one lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResult {
    pub status: Status,
    /// Compressed cached value, present only with [`Status::ValueFound`].
    pub value: Option<Vec<u8>>,
}

impl CreateResult {
    fn failed(status: Status) -> Self {
        Self {
            status,
            value: None,
        }
    }

    /// Whether the master answered authoritatively, with or without a value.
    pub fn is_success(&self) -> bool {
        matches!(self.status, Status::ValueFound | Status::NotFound)
    }
}

pub trait CacheClient: Send + Sync {
    fn fetch(&self, data_type: &str, key: &[u8], historical: bool, dao_version: u32)
    -> CreateResult;
}

/// Remote cache client: routing, pooling and failover behind one call.
#[derive(Debug)]
pub struct RemoteCache {
    config: Arc<ConfigHandle>,
    stats: Arc<Stats>,
    databases: CurrentDatabase,
    router: Router,
}

impl RemoteCache {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(ConfigHandle::new(config));
        let stats = Arc::new(Stats::new());
        let router = Router::new(Arc::clone(&config), stats.clone());
        Self {
            config,
            stats,
            databases: CurrentDatabase::new(),
            router,
        }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Database connections changed; see [`CurrentDatabase::record`].
    pub fn record_database(&self, database: &str, historical: bool, connections: usize) {
        self.databases.record(database, historical, connections);
    }

    /// Looks `key` up on the master serving `data_type`, blocking the caller until an
    /// answer, a failure, or the connect plus processing timeout.
    pub fn get(
        &self,
        data_type: &str,
        key: &[u8],
        historical: bool,
        dao_version: u32,
    ) -> CreateResult {
        let config = self.config.snapshot();
        let request_key = RequestKey {
            persistent: config.persistent,
            build_label: config.build_label.clone(),
            data_type: data_type.to_string(),
            historical,
            database: self.databases.name(historical),
            key: key.to_vec(),
        };
        let timeout = config.connect_timeout + config.processing_timeout;
        let request = match PendingRequest::lookup(request_key, dao_version, timeout) {
            Ok(request) => request,
            Err(e) => {
                debug!("{data_type}: cannot encode lookup: {e}");
                self.stats
                    .request_finished(data_type, Status::InvalidRequest, Default::default());
                return CreateResult::failed(Status::InvalidRequest);
            }
        };

        if config.persistent {
            self.router.route(data_type, Arc::clone(&request));
        } else {
            match self.router.select(data_type) {
                Ok(pool) => Connection::ad_hoc(pool, Arc::clone(&request)).run(),
                Err(status) => {
                    request.cancel(status);
                }
            }
        }

        let outcome = request.wait();
        self.router.report(data_type, outcome.status);
        self.stats
            .request_finished(data_type, outcome.status, request.elapsed());

        CreateResult {
            status: outcome.status,
            value: (outcome.status == Status::ValueFound).then_some(outcome.payload),
        }
    }

    /// Resumes service, optionally against new masters.
    pub fn start(&self, primary: Option<Endpoint>, secondary: Option<Endpoint>) {
        if primary.is_some() {
            self.config.update(|config| {
                config.master = primary;
                config.secondary = secondary;
            });
        }
        self.router.start();
    }

    /// Stops every pool. Lookups fail with [`Status::Stopped`] until [`RemoteCache::start`].
    pub fn stop(&self) {
        self.router.stop();
    }

    pub fn healthcheck(&self, host: &str, port: u16) -> String {
        let target = HostPort::from_endpoint(&Endpoint::new(host, port));
        self.router.healthcheck(&target).message
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.config.update(|config| config.persistent = persistent);
    }

    pub fn parameters(&self) -> String {
        self.config.snapshot().describe()
    }

    pub fn set_parameter(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        self.config.set_parameter(name, value)
    }

    /// Counters followed by one line per pool.
    pub fn report(&self) -> String {
        let mut report = self.stats.report();
        for pool in self.router.pools() {
            report.push_str(&format!(
                "\n{}: active={} connecting={} stopping={} queued={} enqueues={} breaker={:?}",
                pool.target,
                pool.active,
                pool.connecting,
                pool.stopping,
                pool.queued,
                pool.enqueues,
                pool.breaker
            ));
        }
        report
    }
}

impl CacheClient for RemoteCache {
    fn fetch(
        &self,
        data_type: &str,
        key: &[u8],
        historical: bool,
        dao_version: u32,
    ) -> CreateResult {
        self.get(data_type, key, historical, dao_version)
    }
}
