//! Driver-level error types
//!
//! [`TimeseriesError`] is what every driver operation returns. Backend
//! failures keep their original cause so callers can inspect it.

use crate::drivers::rrdtool::RrdError;
use crate::query::QueryError;
use thiserror::Error;

/// Errors surfaced by drivers, executors and the registry
#[derive(Error, Debug)]
pub enum TimeseriesError {
    /// Invalid or missing driver configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure to reach the backend
    #[error("Connection to {driver} failed: {message}")]
    Connection { driver: String, message: String },

    /// The backend rejected or failed a write
    #[error("Write failed: {0}")]
    Write(String),

    /// Compilation failure
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Execution failure, with the query that caused it
    #[error("{driver} execution failed: {source} (query: {query})")]
    Execution {
        driver: String,
        query: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Backend answered with a payload that cannot be interpreted
    #[error("{driver} returned an unreadable response: {message}")]
    Response { driver: String, message: String },

    /// Registry misuse (unknown driver name, duplicate registration)
    #[error("Driver error: {0}")]
    Driver(String),

    /// Schema registry violation
    #[error("Schema error: {0}")]
    Schema(String),

    /// RRDtool leaf errors
    #[error(transparent)]
    Rrd(#[from] RrdError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TimeseriesError {
    pub fn connection(driver: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            driver: driver.into(),
            message: message.to_string(),
        }
    }

    pub fn execution<E>(driver: impl Into<String>, query: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Execution {
            driver: driver.into(),
            query: query.into(),
            source: source.into(),
        }
    }

    pub fn response(driver: impl Into<String>, message: impl ToString) -> Self {
        Self::Response {
            driver: driver.into(),
            message: message.to_string(),
        }
    }

    /// Map a reqwest failure onto connection vs execution errors
    pub fn from_http(driver: &str, query: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::connection(driver, format!("request timed out: {}", err))
        } else if err.is_connect() {
            Self::connection(driver, err)
        } else {
            Self::execution(driver, query, err)
        }
    }

    /// Missing backend resource (e.g. an RRD file nobody has written yet)
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Rrd(e) => e.is_not_found(),
            Self::Execution { source, .. } => source
                .downcast_ref::<RrdError>()
                .map(RrdError::is_not_found)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Result type alias for driver operations
pub type TimeseriesResult<T> = Result<T, TimeseriesError>;
