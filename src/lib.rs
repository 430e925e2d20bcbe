//! # Searchlight
//!
//! Client library for a remote log-search engine. Issues a search over a
//! long-lived WebSocket subscription and exposes its results as live,
//! independently consumable streams that can be re-filtered while the
//! search is still running.
//!
//! ## Features
//!
//! - **Live subscriptions**: one duplex connection per search, typed frames
//! - **Re-filterable**: narrow the time window, page entries, or re-bucket
//!   histograms without restarting the search
//! - **Dual histograms**: a fixed overview over the full search range and a
//!   zoomable histogram over the filtered window, each with its own
//!   granularity
//! - **Ordered delivery**: frames are processed in strict arrival order
//!
//! ## Modules
//!
//! - [`search`]: the live search subscription engine
//! - [`query`]: client-side query text inspection
//! - [`rest`]: REST collaborators (tags, macros)
//! - [`config`]: configuration loading
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chrono::{TimeZone, Utc};
//! use searchlight::{ClientConfig, SearchClient, SubscribeOptions, TimeRange};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SearchClient::new(ClientConfig::default());
//!
//!     let range = TimeRange::new(
//!         Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
//!         Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
//!     )?;
//!
//!     let session = client
//!         .subscribe("tag=web json status | count", range, SubscribeOptions::default())
//!         .await?;
//!
//!     let mut entries = session.entries();
//!     while let Some(batch) = entries.recv().await? {
//!         println!("{} entries (finished: {})", batch.entries.len(), batch.finished);
//!         if batch.finished {
//!             break;
//!         }
//!     }
//!
//!     session.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod query;
pub mod rest;
pub mod search;

// Re-export top-level types for convenience
pub use config::{ApiConfig, ClientConfig, ConfigError, SearchConfig};

pub use search::{
    EntriesOffset, EntryBatch, EnumeratedValue, FilterDiff, FilterUpdate, FrequencyBucket,
    FrequencyHistogram, ModuleStats, OutputStream, RequestFrame, SearchClient, SearchEntry,
    SearchError, SearchFilter, SearchSession, SearchStats, ServerFrame, SessionState,
    SubscribeOptions, TimeRange, TransportChannel, TransportEvent, TransportFactory,
    WsTransportFactory,
};

pub use query::{inspect_query, QueryError, QueryPipeline};

pub use rest::{Macro, RestClient, RestError};
