//! Query Text Inspection
//!
//! Client-side inspection of search query strings. The backend owns query
//! compilation; this module only extracts the facts a client needs before
//! or without a round trip: the pipeline module names and the aggregation
//! time window (which fixes the search's minimum zoom window).
//!
//! # Query Shape
//!
//! ```text
//! tag=<tag> <module> [args...] | <module> [args...] | ...
//! ```
//!
//! # Examples
//!
//! ```text
//! tag=web json status | count            → modules: json, count
//! tag=web json value | raw               → modules: json, raw
//! tag=web json v | stats mean(v) over 5s → modules: json, stats; window: 5s
//! ```

mod error;
mod parser;

pub use error::{QueryError, QueryResult};
pub use parser::{inspect_query, QueryPipeline};
