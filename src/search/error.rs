//! Search Error Types
//!
//! Error taxonomy for the live search subscription engine. Variants carry
//! owned strings so terminal errors can be fanned out to every open output
//! stream.

use thiserror::Error;

/// Errors surfaced by the search subscription engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    /// The channel could not be established or was lost. Fatal to the
    /// session; all open output streams terminate with this error.
    #[error("Connection error: {reason}")]
    Connection { reason: String },

    /// The backend rejected the query at subscribe time. Surfaced from
    /// `subscribe` before any stream exists.
    #[error("Query syntax error: {message}")]
    QuerySyntax { message: String },

    /// A refilter payload was rejected, either by local validation or by
    /// the backend. Recoverable: the previous filter stays in effect and
    /// the error is surfaced only on the `set_filter` call's result.
    #[error("Filter rejected: {message}")]
    FilterRejected { message: String },

    /// An inbound frame could not be parsed. Isolated occurrences are
    /// logged and skipped; the session only terminates past a configured
    /// threshold.
    #[error("Malformed frame: {detail}")]
    MalformedFrame { detail: String },

    /// Operation on a session that has completed or been disposed.
    #[error("Session is closed")]
    Closed,
}

impl SearchError {
    pub(crate) fn connection(reason: impl Into<String>) -> Self {
        SearchError::Connection {
            reason: reason.into(),
        }
    }

    pub(crate) fn filter_rejected(message: impl Into<String>) -> Self {
        SearchError::FilterRejected {
            message: message.into(),
        }
    }
}

/// Result type for search operations
pub type SearchResult<T> = Result<T, SearchError>;
