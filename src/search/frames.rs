//! Wire Frame Types
//!
//! Defines the typed JSON frames exchanged with the search backend over the
//! subscription channel. Every frame is discriminated by an explicit `type`
//! tag; entry payload variants are discriminated by `kind`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::{DecodeError, Engine};
use serde::{Deserialize, Serialize};

use super::filter::{SearchFilter, TimeRange};

/// Frames sent from client to backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestFrame {
    /// Open a new search subscription
    Subscribe {
        /// Literal user query
        query: String,
        /// Full addressable time range for the search
        range: TimeRange,
        /// Initial filter, defaults already applied
        filter: SearchFilter,
        /// Arbitrary caller-supplied metadata, echoed back in stats
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// Re-scope a running search. Carries the full merged filter, not a diff.
    Refilter {
        search_id: String,
        filter: SearchFilter,
    },
    /// Cancel a running search
    Cancel { search_id: String },
}

/// Frames sent from backend to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Request acknowledgment. Subscribe acks carry the assigned search ID
    /// and the effective (macro-expanded) query; refilter acks carry only
    /// the search ID.
    Ack {
        search_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        effective_query: Option<String>,
    },
    /// A batch of search result entries
    EntryBatch {
        entries: Vec<SearchEntry>,
        /// End of this batch's delivery, not necessarily end of the search
        finished: bool,
    },
    /// Pipeline statistics plus raw frequency samples
    StatsUpdate {
        pipeline: Vec<ModuleStats>,
        query: String,
        effective_query: String,
        /// Smallest zoom window, in seconds, the query's aggregation
        /// module supports
        min_zoom_window: i64,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        frequency: Vec<FrequencySample>,
        finished: bool,
    },
    /// Completion percentage
    Progress { value: u8 },
    /// Backend-reported error
    Error { code: ErrorCode, message: String },
}

/// Error codes the backend may report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The query failed to parse or compile
    QuerySyntax,
    /// A refilter payload was rejected
    FilterRejected,
    /// Any other backend failure
    Internal,
}

/// One search result record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchEntry {
    /// Entry from the text renderer: payload plus enumerated values
    /// extracted by the query pipeline
    Text {
        /// Base64-encoded payload
        data: String,
        /// Ordered, named values extracted by pipeline modules
        values: Vec<EnumeratedValue>,
    },
    /// Entry from the raw renderer: payload only
    Raw {
        /// Base64-encoded payload
        data: String,
    },
}

impl SearchEntry {
    /// Decode the base64 payload
    pub fn decoded_data(&self) -> Result<Vec<u8>, DecodeError> {
        let data = match self {
            SearchEntry::Text { data, .. } => data,
            SearchEntry::Raw { data } => data,
        };
        BASE64.decode(data)
    }

    /// Enumerated values, empty for raw entries
    pub fn values(&self) -> &[EnumeratedValue] {
        match self {
            SearchEntry::Text { values, .. } => values,
            SearchEntry::Raw { .. } => &[],
        }
    }
}

/// A named value extracted from an entry by the query pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnumeratedValue {
    pub name: String,
    pub value: String,
}

/// Per-module statistics for the compiled query pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleStats {
    /// Module name (e.g., "json", "count")
    pub module: String,
    /// Entries the module accepted
    pub input_entries: u64,
    /// Entries the module produced
    pub output_entries: u64,
}

/// A raw frequency sample from the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FrequencySample {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub count: u64,
}
