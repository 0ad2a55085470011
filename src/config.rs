//! Remote cache configuration.
//!
//! Options are read once from a [`ConfigSource`] into a typed [`Config`] snapshot. The
//! snapshot lives in a [`ConfigHandle`]; components take a fresh snapshot at the start of
//! every operation, so a runtime [`ConfigHandle::set_parameter`] is picked up by the next
//! enqueue, connection or healthcheck without any component caching stale values.
//!
//! # Example
//! ```rust
//! use rcache::config::{Config, ConfigHandle};
//!
//! let config: Config = "MAX_NUMBER_CLIENTS=8\nQUEUE_TOLERANCE=0.5".parse().unwrap();
//! let handle = ConfigHandle::new(config);
//!
//! handle.set_parameter("MAX_NUMBER_CLIENTS", "4").unwrap();
//! assert_eq!(handle.snapshot().max_clients, 4);
//! assert_eq!(handle.version(), 1);
//! ```
use std::{
    collections::HashMap,
    fmt::Write,
    str::FromStr,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;

use crate::protocol::Status;

/// Backoff never retries a failed destination sooner than this.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for option {key}")]
    InvalidValue { key: String, value: String },

    #[error("unknown option {0}")]
    UnknownOption(String),

    #[error("malformed line {line}: '{text}'")]
    Syntax { line: usize, text: String },
}

/// Read-only source of raw option values.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Every key present in the source.
    fn keys(&self) -> Vec<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        HashMap::keys(self).cloned().collect()
    }
}

/// `KEY=VALUE` lines, `#` comments and blank lines ignored.
#[derive(Debug, Clone, Default)]
pub struct TextSource {
    entries: Vec<(String, String)>,
}

impl FromStr for TextSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Syntax {
                line: idx + 1,
                text: line.to_string(),
            })?;
            entries.push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(Self { entries })
    }
}

impl ConfigSource for TextSource {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for (key, _) in &self.entries {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

/// A configured destination before it is resolved for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.trim().rsplit_once(':').ok_or(())?;
        let port = port.parse::<u16>().map_err(|_| ())?;
        if host.is_empty() {
            return Err(());
        }
        Ok(Endpoint::new(host, port))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub max_clients: usize,
    pub min_clients_ratio: f64,
    pub queue_tolerance: f64,
    /// Enqueues between two shrink evaluations; zero disables count-based sampling.
    pub sampling_interval: u64,
    /// Wall-clock time between two shrink evaluations; zero disables it.
    pub adjust_interval: Duration,
    pub shrink_ratio: f64,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub processing_timeout: Duration,
    pub use_client_specified_timeout: bool,
    pub healthcheck: bool,
    pub healthcheck_period: Duration,
    pub healthcheck_timeout: Duration,
    pub asynchronous_healthcheck: bool,
    pub retry_interval: Duration,
    pub retry_intervals: HashMap<Status, Duration>,
    pub persistent: bool,
    pub linger: bool,
    pub linger_time: Duration,
    pub keep_alive: bool,
    pub ignore_database_mismatch: bool,
    pub master: Option<Endpoint>,
    pub secondary: Option<Endpoint>,
    pub master_all_data_types: bool,
    pub data_types: Vec<String>,
    pub data_type_targets: HashMap<String, (Endpoint, Option<Endpoint>)>,
    pub build_label: String,
    pub local_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_clients: 20,
            min_clients_ratio: 0.4,
            queue_tolerance: 0.2,
            sampling_interval: 1000,
            adjust_interval: Duration::ZERO,
            shrink_ratio: 0.5,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_millis(1000),
            processing_timeout: Duration::from_millis(2000),
            use_client_specified_timeout: false,
            healthcheck: true,
            healthcheck_period: Duration::ZERO,
            healthcheck_timeout: Duration::from_millis(1000),
            asynchronous_healthcheck: false,
            retry_interval: Duration::from_secs(60),
            retry_intervals: HashMap::new(),
            persistent: true,
            linger: false,
            linger_time: Duration::ZERO,
            keep_alive: false,
            ignore_database_mismatch: false,
            master: None,
            secondary: None,
            master_all_data_types: true,
            data_types: Vec::new(),
            data_type_targets: HashMap::new(),
            build_label: String::new(),
            local_port: None,
        }
    }
}

const RETRY_PREFIX: &str = "RETRY_INTERVAL.";
const DATA_TYPE_PREFIX: &str = "DATA_TYPE.";

impl Config {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for key in source.keys() {
            let Some(value) = source.get(&key) else {
                continue;
            };
            match config.apply(&key, &value) {
                Ok(()) | Err(ConfigError::UnknownOption(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(config)
    }

    /// Backoff for a destination that failed with `status`.
    pub fn retry_interval_for(&self, status: Status) -> Duration {
        self.retry_intervals
            .get(&status)
            .copied()
            .unwrap_or(self.retry_interval)
            .max(MIN_RETRY_INTERVAL)
    }

    /// Number of connections a pool keeps even when idle.
    pub fn min_clients(&self) -> usize {
        let ratio = self.min_clients_ratio.clamp(0.0, 1.0);
        ((self.max_clients as f64 * ratio).round() as usize).max(1)
    }

    /// Whether requests for `data_type` go to the remote cache at all.
    pub fn routes(&self, data_type: &str) -> bool {
        self.master_all_data_types
            || self.data_types.iter().any(|d| d == data_type)
            || self.data_type_targets.contains_key(data_type)
    }

    /// Sets one option by name.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let value = value.trim();

        if let Some(name) = key.strip_prefix(RETRY_PREFIX) {
            let status = Status::from_name(name).ok_or_else(invalid)?;
            self.retry_intervals.insert(status, seconds(value).ok_or_else(invalid)?);
            return Ok(());
        }
        if let Some(name) = key.strip_prefix(DATA_TYPE_PREFIX) {
            let mut targets = value.split(',').map(str::parse::<Endpoint>);
            let primary = targets.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
            let secondary = targets.next().transpose().map_err(|_| invalid())?;
            self.data_type_targets
                .insert(name.to_string(), (primary, secondary));
            return Ok(());
        }

        match key {
            "MAX_NUMBER_CLIENTS" => {
                self.max_clients = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(invalid)?
            }
            "MIN_CLIENTS_RATIO" => self.min_clients_ratio = ratio(value).ok_or_else(invalid)?,
            "QUEUE_TOLERANCE" => {
                self.queue_tolerance = value
                    .parse::<f64>()
                    .ok()
                    .filter(|t| *t >= 0.0)
                    .ok_or_else(invalid)?
            }
            "CLIENT_POOL_SAMPLING_INTERVAL" => {
                self.sampling_interval = value.parse().map_err(|_| invalid())?
            }
            "CLIENT_POOL_ADJUST_INTERVAL" => {
                self.adjust_interval = seconds(value).ok_or_else(invalid)?
            }
            "CLIENT_POOL_SHRINK_RATIO" => self.shrink_ratio = ratio(value).ok_or_else(invalid)?,
            "IDLE_SLAVE_TIMEOUT" => self.idle_timeout = seconds(value).ok_or_else(invalid)?,
            "CLIENT_CONNECTION_TIMEOUT" => {
                self.connect_timeout = millis(value).ok_or_else(invalid)?
            }
            "CLIENT_PROCESSING_TIMEOUT" => {
                self.processing_timeout = millis(value).ok_or_else(invalid)?
            }
            "USE_CLIENT_SPECIFIED_TIMEOUT" => {
                self.use_client_specified_timeout = flag(value).ok_or_else(invalid)?
            }
            "HEALTHCHECK" => self.healthcheck = flag(value).ok_or_else(invalid)?,
            "HEALTHCHECK_PERIOD" => self.healthcheck_period = seconds(value).ok_or_else(invalid)?,
            "HEALTHCHECK_TIMEOUT" => self.healthcheck_timeout = millis(value).ok_or_else(invalid)?,
            "ASYNCHRONOUS_HEALTHCHECK" => {
                self.asynchronous_healthcheck = flag(value).ok_or_else(invalid)?
            }
            "RETRY_INTERVAL" => self.retry_interval = seconds(value).ok_or_else(invalid)?,
            "PERSISTENT_CONNECTIONS" => self.persistent = flag(value).ok_or_else(invalid)?,
            "LINGER" => self.linger = flag(value).ok_or_else(invalid)?,
            "LINGER_TIME" => self.linger_time = seconds(value).ok_or_else(invalid)?,
            "KEEP_ALIVE" => self.keep_alive = flag(value).ok_or_else(invalid)?,
            "IGNORE_DATABASE_MISMATCH" => {
                self.ignore_database_mismatch = flag(value).ok_or_else(invalid)?
            }
            "MASTER_HOST" => set_host(&mut self.master, value),
            "MASTER_PORT" => set_port(&mut self.master, value).ok_or_else(invalid)?,
            "SECONDARY_HOST" => set_host(&mut self.secondary, value),
            "SECONDARY_PORT" => set_port(&mut self.secondary, value).ok_or_else(invalid)?,
            "MASTER_ALL_DATA_TYPES" => {
                self.master_all_data_types = flag(value).ok_or_else(invalid)?
            }
            "DATA_TYPES" => {
                self.data_types = value
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from)
                    .collect()
            }
            "BUILD_LABEL" => self.build_label = value.to_string(),
            "LOCAL_PORT" => self.local_port = Some(value.parse().map_err(|_| invalid())?),
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    /// Renders every option as `NAME=value`, one per line.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let endpoint = |e: &Option<Endpoint>| {
            e.as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".into())
        };

        let _ = writeln!(out, "MAX_NUMBER_CLIENTS={}", self.max_clients);
        let _ = writeln!(out, "MIN_CLIENTS_RATIO={}", self.min_clients_ratio);
        let _ = writeln!(out, "QUEUE_TOLERANCE={}", self.queue_tolerance);
        let _ = writeln!(out, "CLIENT_POOL_SAMPLING_INTERVAL={}", self.sampling_interval);
        let _ = writeln!(
            out,
            "CLIENT_POOL_ADJUST_INTERVAL={}",
            self.adjust_interval.as_secs()
        );
        let _ = writeln!(out, "CLIENT_POOL_SHRINK_RATIO={}", self.shrink_ratio);
        let _ = writeln!(out, "IDLE_SLAVE_TIMEOUT={}", self.idle_timeout.as_secs());
        let _ = writeln!(
            out,
            "CLIENT_CONNECTION_TIMEOUT={}",
            self.connect_timeout.as_millis()
        );
        let _ = writeln!(
            out,
            "CLIENT_PROCESSING_TIMEOUT={}",
            self.processing_timeout.as_millis()
        );
        let _ = writeln!(
            out,
            "USE_CLIENT_SPECIFIED_TIMEOUT={}",
            self.use_client_specified_timeout
        );
        let _ = writeln!(out, "HEALTHCHECK={}", self.healthcheck);
        let _ = writeln!(out, "HEALTHCHECK_PERIOD={}", self.healthcheck_period.as_secs());
        let _ = writeln!(
            out,
            "HEALTHCHECK_TIMEOUT={}",
            self.healthcheck_timeout.as_millis()
        );
        let _ = writeln!(
            out,
            "ASYNCHRONOUS_HEALTHCHECK={}",
            self.asynchronous_healthcheck
        );
        let _ = writeln!(out, "RETRY_INTERVAL={}", self.retry_interval.as_secs());
        let mut retries = self.retry_intervals.iter().collect::<Vec<_>>();
        retries.sort_by_key(|(status, _)| status.name());
        for (status, interval) in retries {
            let _ = writeln!(out, "{RETRY_PREFIX}{}={}", status.name(), interval.as_secs());
        }
        let _ = writeln!(out, "PERSISTENT_CONNECTIONS={}", self.persistent);
        let _ = writeln!(out, "LINGER={}", self.linger);
        let _ = writeln!(out, "LINGER_TIME={}", self.linger_time.as_secs());
        let _ = writeln!(out, "KEEP_ALIVE={}", self.keep_alive);
        let _ = writeln!(
            out,
            "IGNORE_DATABASE_MISMATCH={}",
            self.ignore_database_mismatch
        );
        let _ = writeln!(out, "MASTER={}", endpoint(&self.master));
        let _ = writeln!(out, "SECONDARY={}", endpoint(&self.secondary));
        let _ = writeln!(out, "MASTER_ALL_DATA_TYPES={}", self.master_all_data_types);
        let _ = writeln!(out, "DATA_TYPES={}", self.data_types.join(","));
        let mut targets = self.data_type_targets.iter().collect::<Vec<_>>();
        targets.sort_by(|a, b| a.0.cmp(b.0));
        for (name, (primary, secondary)) in targets {
            match secondary {
                Some(secondary) => {
                    let _ = writeln!(out, "{DATA_TYPE_PREFIX}{name}={primary},{secondary}");
                }
                None => {
                    let _ = writeln!(out, "{DATA_TYPE_PREFIX}{name}={primary}");
                }
            }
        }
        let _ = writeln!(out, "BUILD_LABEL={}", self.build_label);
        if let Some(port) = self.local_port {
            let _ = writeln!(out, "LOCAL_PORT={port}");
        }
        out
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source: TextSource = s.parse()?;
        Config::from_source(&source)
    }
}

fn flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "true" | "on" => Some(true),
        "0" | "n" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn ratio(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|r| (0.0..=1.0).contains(r))
}

fn seconds(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_secs)
}

fn millis(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_millis)
}

fn set_host(endpoint: &mut Option<Endpoint>, host: &str) {
    match endpoint {
        Some(e) => e.host = host.to_string(),
        None => *endpoint = Some(Endpoint::new(host, 0)),
    }
}

fn set_port(endpoint: &mut Option<Endpoint>, port: &str) -> Option<()> {
    let port = port.parse::<u16>().ok()?;
    match endpoint {
        Some(e) => e.port = port,
        None => *endpoint = Some(Endpoint::new("", port)),
    }
    Some(())
}

/// Versioned, swappable configuration snapshot.
#[derive(Debug, Default)]
pub struct ConfigHandle {
    current: RwLock<Arc<Config>>,
    version: AtomicU64,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            version: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Replaces the snapshot with a modified copy.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Config),
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Config::clone(&current);
        f(&mut next);
        *current = Arc::new(next);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Changes one option at runtime, by its option name.
    pub fn set_parameter(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Config::clone(&current);
        next.apply(key, value)?;
        *current = Arc::new(next);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_clients, 20);
        assert_eq!(config.min_clients(), 8);
        assert!(config.persistent);
        assert_eq!(config.retry_interval_for(Status::ConnectionRefused), Duration::from_secs(60));
    }

    #[test]
    fn parse_text_source() {
        let text = "
            # pool sizing
            MAX_NUMBER_CLIENTS = 10
            MIN_CLIENTS_RATIO=0.25
            CLIENT_PROCESSING_TIMEOUT=250
            ASYNCHRONOUS_HEALTHCHECK=Y
            MASTER_HOST=master01
            MASTER_PORT=5123
            SECONDARY_HOST=master02
            SECONDARY_PORT=5124
            RETRY_INTERVAL.CONNECTION_REFUSED=30
            DATA_TYPE.FareInfo=fares01:6000,fares02:6001
            SOMETHING_ELSE=ignored
        ";
        let config: Config = text.parse().unwrap();

        assert_eq!(config.max_clients, 10);
        assert_eq!(config.min_clients(), 3);
        assert_eq!(config.processing_timeout, Duration::from_millis(250));
        assert!(config.asynchronous_healthcheck);
        assert_eq!(config.master, Some(Endpoint::new("master01", 5123)));
        assert_eq!(config.secondary, Some(Endpoint::new("master02", 5124)));
        assert_eq!(
            config.retry_interval_for(Status::ConnectionRefused),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.data_type_targets["FareInfo"],
            (
                Endpoint::new("fares01", 6000),
                Some(Endpoint::new("fares02", 6001))
            )
        );
    }

    #[test]
    fn retry_interval_has_floor() {
        let config: Config = "RETRY_INTERVAL=1\nRETRY_INTERVAL.QUEUE_LIMIT_EXCEEDED=3"
            .parse()
            .unwrap();
        assert_eq!(config.retry_interval_for(Status::ConnectError), MIN_RETRY_INTERVAL);
        assert_eq!(
            config.retry_interval_for(Status::QueueLimitExceeded),
            MIN_RETRY_INTERVAL
        );
    }

    #[test]
    fn min_clients_is_at_least_one() {
        let config: Config = "MAX_NUMBER_CLIENTS=3\nMIN_CLIENTS_RATIO=0".parse().unwrap();
        assert_eq!(config.min_clients(), 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = "MAX_NUMBER_CLIENTS=many".parse::<Config>().unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "MAX_NUMBER_CLIENTS".into(),
                value: "many".into()
            }
        );

        assert!("MIN_CLIENTS_RATIO=1.5".parse::<Config>().is_err());
        assert!("RETRY_INTERVAL.NOT_A_STATUS=10".parse::<Config>().is_err());
        assert!("DATA_TYPE.Fare=nohost".parse::<Config>().is_err());
    }

    #[test]
    fn malformed_line() {
        let err = "MAX_NUMBER_CLIENTS".parse::<Config>().unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 1, .. }));
    }

    #[test]
    fn routing_filter() {
        let config: Config = "MASTER_ALL_DATA_TYPES=false\nDATA_TYPES=FareInfo, TaxCode"
            .parse()
            .unwrap();
        assert!(config.routes("TaxCode"));
        assert!(!config.routes("Currency"));
    }

    #[test]
    fn handle_versions_updates() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.snapshot();

        handle.set_parameter("QUEUE_TOLERANCE", "0.7").unwrap();
        handle.update(|c| c.persistent = false);

        assert_eq!(handle.version(), 2);
        assert_eq!(before.queue_tolerance, 0.2);
        assert_eq!(handle.snapshot().queue_tolerance, 0.7);
        assert!(!handle.snapshot().persistent);
    }

    #[test]
    fn handle_rejects_unknown_parameter() {
        let handle = ConfigHandle::new(Config::default());
        assert_eq!(
            handle.set_parameter("NOPE", "1"),
            Err(ConfigError::UnknownOption("NOPE".into()))
        );
        assert_eq!(handle.version(), 0);
    }

    #[test]
    fn describe_lists_options() {
        let config: Config = "MASTER_HOST=m\nMASTER_PORT=1".parse().unwrap();
        let text = config.describe();
        assert!(text.contains("MAX_NUMBER_CLIENTS=20\n"));
        assert!(text.contains("MASTER=m:1\n"));
        assert!(text.contains("SECONDARY=-\n"));
    }
}
