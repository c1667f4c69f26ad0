//! Query error types
//!
//! Defines all error conditions that can occur while building, parsing and
//! compiling queries. Compilation errors are never retried.

use thiserror::Error;

/// Errors that can occur during query operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Query text parsing failed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Duration string outside the `<n><unit>` grammar
    #[error("Invalid duration: '{0}' (expected <number><s|m|h|d|w|y>)")]
    InvalidDuration(String),

    /// Unknown operator token
    #[error("Invalid operator: '{0}'")]
    InvalidOperator(String),

    /// A condition value cannot be rendered as a backend literal
    #[error("Unsupported value for '{field}': {reason}")]
    UnsupportedValue { field: String, reason: String },

    /// `Query::validate` reported problems
    #[error("Invalid query: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Backend-specific compilation failure, carrying the offending query
    #[error("{backend} query error: {message} (query: {query})")]
    RawQuery {
        backend: &'static str,
        query: String,
        message: String,
    },
}

/// Result type for query compilation
pub type CompileResult<T> = Result<T, QueryError>;
