//! Query inspection error types

use thiserror::Error;

/// Errors from query text inspection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The query string is empty or whitespace
    #[error("Query is empty")]
    Empty,

    /// The query could not be inspected
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Result type for query inspection
pub type QueryResult<T> = Result<T, QueryError>;
