//! Pooled client for a remote warm cache.
//!
//! Application threads ask a master process for precomputed values over TCP instead of
//! recomputing them. Requests are routed per data type to a primary or secondary master,
//! queued on a per-destination [`ConnectionPool`], and served by persistent connections,
//! each running on its own thread. Destinations that fail at the host level are disabled
//! for a configurable backoff by a circuit breaker.
pub mod breaker;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
mod connection;
pub mod database;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod router;
pub mod stats;
pub mod timer;

#[cfg(test)]
mod testing;

pub use breaker::{BreakerState, CircuitBreakerState};
pub use cli::{ConsoleError, execute, prompt};
pub use client::{CacheClient, CreateResult, RemoteCache};
pub use command::{Command, CommandError};
pub use config::{Config, ConfigError, ConfigHandle, ConfigSource, Endpoint, TextSource};
pub use database::CurrentDatabase;
pub use pool::{ConnectionPool, HealthReport, PoolSnapshot};
pub use protocol::Status;
pub use request::{Outcome, PendingRequest};
pub use router::{HostPort, Router, ServerAttributes};
pub use stats::{NoStats, Stats, StatsCollector, StatsSnapshot};
