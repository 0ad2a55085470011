//! Outcome codes shared by the wire protocol, the pool breaker and callers.
//!
//! A [`Status`] travels as an `i32` in every response header and is the only way a
//! failure leaves a connection thread. Each status belongs to exactly one
//! [`StatusClass`], which decides who is affected by it: the single waiting caller,
//! every caller of a logical data type, or every caller of a destination.
use std::fmt;

/// Result code of a remote cache exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    None,
    ValueFound,
    NotFound,
    HealthcheckOk,

    ConnectionRefused,
    ConnectError,
    ConnectTimeout,
    WrongMagicString,
    ProtocolVersionMismatch,
    DatabaseMismatch,
    HistoricalMismatch,
    BuildLabelMismatch,
    QueueLimitExceeded,
    HealthcheckTimeout,
    ServerShutdown,

    DaoVersionMismatch,
    NotCached,

    ProcessingTimeout,
    ReadError,
    WriteError,
    InvalidRequest,
    ServerError,
    Expired,

    Cancelled,
    PoolDisabled,
    Throttled,
    Stopped,

    Unknown(i32),
}

/// Blast radius of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// The value was found or confirmed absent.
    Success,
    /// Affects every request to the destination; trips the pool breaker.
    HostLevel,
    /// Affects every request of one logical data type.
    DataTypeLevel,
    /// Affects only the request that observed it.
    Request,
    /// The request never reached the wire.
    Admission,
}

const TABLE: &[(Status, i32, &str)] = &[
    (Status::None, 0, "NONE"),
    (Status::ValueFound, 1, "VALUE_FOUND"),
    (Status::NotFound, 2, "NOT_FOUND"),
    (Status::HealthcheckOk, 3, "HEALTHCHECK_OK"),
    (Status::ConnectionRefused, 10, "CONNECTION_REFUSED"),
    (Status::ConnectError, 11, "CONNECT_ERROR"),
    (Status::ConnectTimeout, 12, "CONNECT_TIMEOUT"),
    (Status::WrongMagicString, 13, "WRONG_MAGIC_STRING"),
    (Status::ProtocolVersionMismatch, 14, "PROTOCOL_VERSION_MISMATCH"),
    (Status::DatabaseMismatch, 15, "DATABASE_MISMATCH"),
    (Status::HistoricalMismatch, 16, "HISTORICAL_MISMATCH"),
    (Status::BuildLabelMismatch, 17, "BUILD_LABEL_MISMATCH"),
    (Status::QueueLimitExceeded, 18, "QUEUE_LIMIT_EXCEEDED"),
    (Status::HealthcheckTimeout, 19, "HEALTHCHECK_TIMEOUT"),
    (Status::ServerShutdown, 20, "SERVER_SHUTDOWN"),
    (Status::DaoVersionMismatch, 30, "DAO_VERSION_MISMATCH"),
    (Status::NotCached, 31, "NOT_CACHED"),
    (Status::ProcessingTimeout, 40, "PROCESSING_TIMEOUT"),
    (Status::ReadError, 41, "READ_ERROR"),
    (Status::WriteError, 42, "WRITE_ERROR"),
    (Status::InvalidRequest, 43, "INVALID_REQUEST"),
    (Status::ServerError, 44, "SERVER_ERROR"),
    (Status::Expired, 45, "EXPIRED"),
    (Status::Cancelled, 50, "CANCELLED"),
    (Status::PoolDisabled, 51, "POOL_DISABLED"),
    (Status::Throttled, 52, "THROTTLED"),
    (Status::Stopped, 53, "STOPPED"),
];

impl Status {
    /// Wire code of this status.
    pub fn code(self) -> i32 {
        match self {
            Status::Unknown(code) => code,
            status => TABLE
                .iter()
                .find(|(s, _, _)| *s == status)
                .map(|(_, code, _)| *code)
                .unwrap_or(-1),
        }
    }

    /// Decodes a wire code; unrecognised codes are kept as [`Status::Unknown`].
    pub fn from_code(code: i32) -> Self {
        TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(s, _, _)| *s)
            .unwrap_or(Status::Unknown(code))
    }

    /// Stable upper-snake name, used in logs and `RETRY_INTERVAL.<NAME>` keys.
    pub fn name(self) -> &'static str {
        TABLE
            .iter()
            .find(|(s, _, _)| *s == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("UNKNOWN")
    }

    pub fn from_name(name: &str) -> Option<Self> {
        TABLE
            .iter()
            .find(|(_, _, n)| n.eq_ignore_ascii_case(name))
            .map(|(s, _, _)| *s)
    }

    pub fn class(self) -> StatusClass {
        match self {
            Status::ValueFound | Status::NotFound | Status::HealthcheckOk => StatusClass::Success,
            Status::ConnectionRefused
            | Status::ConnectError
            | Status::ConnectTimeout
            | Status::WrongMagicString
            | Status::ProtocolVersionMismatch
            | Status::DatabaseMismatch
            | Status::HistoricalMismatch
            | Status::BuildLabelMismatch
            | Status::QueueLimitExceeded
            | Status::HealthcheckTimeout
            | Status::ServerShutdown => StatusClass::HostLevel,
            Status::DaoVersionMismatch | Status::NotCached => StatusClass::DataTypeLevel,
            Status::Cancelled | Status::PoolDisabled | Status::Throttled | Status::Stopped => {
                StatusClass::Admission
            }
            Status::None
            | Status::ProcessingTimeout
            | Status::ReadError
            | Status::WriteError
            | Status::InvalidRequest
            | Status::ServerError
            | Status::Expired
            | Status::Unknown(_) => StatusClass::Request,
        }
    }

    pub fn is_success(self) -> bool {
        self.class() == StatusClass::Success
    }

    /// Whether this status trips the breaker of a whole destination.
    ///
    /// `ignore_database_mismatch` demotes [`Status::DatabaseMismatch`] to a request-scoped
    /// failure.
    pub fn is_host_level(self, ignore_database_mismatch: bool) -> bool {
        if ignore_database_mismatch && self == Status::DatabaseMismatch {
            return false;
        }
        self.class() == StatusClass::HostLevel
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unknown(code) => write!(f, "UNKNOWN({code})"),
            status => f.write_str(status.name()),
        }
    }
}
