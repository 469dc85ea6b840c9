//! Contains the `Error` and `Result` types that `sqlpool` uses.

use std::sync::Arc;

use thiserror::Error;

use crate::pool::TakenSnapshot;

/// The result type for all fallible operations in the `sqlpool` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `sqlpool` crate. The inner [`ErrorKind`] is
/// wrapped in an `Arc` so that `Error` stays cheap to clone — proxies hand
/// the same error back out through the connection's [`crate::collector::ExceptionCollector`]
/// and to the caller simultaneously.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Error {
            kind: Arc::new(kind),
        }
    }

    /// Returns the SQL-state code this error maps to, per the facade's
    /// error-bridging table (spec §6).
    pub fn sql_state(&self) -> &'static str {
        match &*self.kind {
            ErrorKind::CreateConnection { .. } => "08001",
            ErrorKind::Closed => "08003",
            ErrorKind::PoolClosed => "08006",
            ErrorKind::Driver(d) if d.is_serialization_failure => "40001",
            ErrorKind::Interrupted => "70100",
            _ => "HY000",
        }
    }

    /// Returns `true` if this error is classified as *transient* by the
    /// exception collector's decision rule (spec §4.5): a connection-timeout
    /// or serialization-failure error does not, by itself, invalidate the
    /// handle it was raised on. Every other driver error — including ones
    /// whose message merely mentions "connection unavailable" — is
    /// non-transient and gets recorded.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            &*self.kind,
            ErrorKind::Timeout { .. }
                | ErrorKind::Driver(DriverErrorInfo {
                    is_serialization_failure: true,
                    ..
                })
                | ErrorKind::Driver(DriverErrorInfo {
                    is_connection_timeout: true,
                    ..
                })
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// The taxonomy of errors `sqlpool` can raise, per spec §7.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Invalid or missing configuration, raised only at `DataSource::start`.
    #[error("invalid pool configuration: {message}")]
    #[non_exhaustive]
    Config { message: String },

    /// The raw driver refused to open a connection after all configured
    /// retries.
    #[error("failed to create connection after retrying: {message}")]
    #[non_exhaustive]
    CreateConnection { message: String },

    /// `try_take`'s deadline expired before a handle became available.
    #[error("timed out waiting for a connection{}", taken.as_ref().map(|_| " (taken-connections snapshot attached)").unwrap_or_default())]
    #[non_exhaustive]
    Timeout {
        /// A snapshot of the currently taken handles, present only when
        /// `log_taken_connections_on_timeout` is enabled.
        taken: Option<Vec<TakenSnapshot>>,
    },

    /// An operation was attempted against a pool in the `TERMINATED` state.
    #[error("pool is closed")]
    PoolClosed,

    /// A blocked `take` observed cancellation before a handle became
    /// available.
    #[error("interrupted while waiting for a connection")]
    Interrupted,

    /// A method was called on a proxy after it was closed.
    #[error("operation attempted on a closed handle")]
    Closed,

    /// The submitted SQL text was rejected by the configured restriction
    /// list (spec §4.7.4).
    #[error("query rejected by restriction policy: {prefix}")]
    #[non_exhaustive]
    RestrictedQuery { prefix: String },

    /// An error surfaced verbatim from the underlying driver.
    #[error("driver error: {0}")]
    Driver(#[from] DriverErrorInfo),

    /// Internal invariant violation; should never be observed by a caller
    /// acting within contract.
    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

/// Wraps an error returned by the underlying driver, classified so the
/// [`crate::collector::ExceptionCollector`] can decide whether it is
/// transient (spec §4.5).
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct DriverErrorInfo {
    pub message: String,
    pub is_serialization_failure: bool,
    pub is_connection_timeout: bool,
}

impl DriverErrorInfo {
    /// A classified, non-transient driver error (the common case).
    pub fn new(message: impl Into<String>) -> Self {
        DriverErrorInfo {
            message: message.into(),
            is_serialization_failure: false,
            is_connection_timeout: false,
        }
    }

    /// Marks this error as a transient serialization failure (maps to
    /// SQL-state `40001`).
    pub fn serialization_failure(mut self) -> Self {
        self.is_serialization_failure = true;
        self
    }

    /// Marks this error as a transient connection-timeout failure.
    pub fn connection_timeout(mut self) -> Self {
        self.is_connection_timeout = true;
        self
    }
}

pub(crate) fn timeout_with_snapshot(taken: Option<Vec<TakenSnapshot>>) -> Error {
    ErrorKind::Timeout { taken }.into()
}

pub(crate) fn config(message: impl Into<String>) -> Error {
    ErrorKind::Config {
        message: message.into(),
    }
    .into()
}

pub(crate) fn internal(message: impl Into<String>) -> Error {
    ErrorKind::Internal {
        message: message.into(),
    }
    .into()
}
