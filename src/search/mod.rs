//! Live Search Subscription Engine
//!
//! Opens a long-lived connection to the search backend, drives the
//! per-search protocol exchange, and exposes the search's entries,
//! progress, and statistics as continuously-updating streams that can be
//! re-filtered while the search is still running.
//!
//! ## Architecture
//!
//! - **SearchSession**: orchestrating state machine; owns the components
//!   below, issues subscribe/refilter requests, exposes the five output
//!   streams and the mutation entry point
//! - **Transport**: one duplex WebSocket channel per session, typed frames
//!   in strict arrival order
//! - **FilterController**: validated merge of partial filter updates with a
//!   typed change-set
//! - **StatsAggregator**: running stats plus overview and zoom histograms
//!   with independently adjustable granularities
//! - **EntryDemux / ProgressTracker**: completion-aware entry republication
//!   and monotonic progress
//!
//! ## Example
//!
//! ```rust,no_run
//! use searchlight::{ClientConfig, FilterUpdate, SearchClient, SubscribeOptions, TimeRange};
//! # async fn run(range: TimeRange) -> Result<(), searchlight::SearchError> {
//! let client = SearchClient::new(ClientConfig::default());
//! let session = client
//!     .subscribe("tag=web json status | count", range, SubscribeOptions::default())
//!     .await?;
//!
//! // Re-bucket the zoom histogram while the search runs
//! session
//!     .set_filter(FilterUpdate::default().zoom_granularity(133))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod entries;
mod error;
mod filter;
mod frames;
mod progress;
mod session;
mod stats;
mod stream;
mod transport;

pub use entries::EntryBatch;
pub use error::{SearchError, SearchResult};
pub use filter::{
    EntriesOffset, FilterController, FilterDiff, FilterUpdate, SearchFilter, TimeRange,
    DEFAULT_ENTRY_COUNT, DEFAULT_GRANULARITY,
};
pub use frames::{
    EnumeratedValue, ErrorCode, FrequencySample, ModuleStats, RequestFrame, SearchEntry,
    ServerFrame,
};
pub use session::{SearchClient, SearchSession, SessionState, SubscribeOptions};
pub use stats::{FrequencyBucket, FrequencyHistogram, SearchStats};
pub use stream::OutputStream;
pub use transport::{TransportChannel, TransportEvent, TransportFactory, WsTransportFactory};
