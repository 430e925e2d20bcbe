//! REST Collaborators
//!
//! Thin request/response wrappers around the backend's REST surface that
//! the search core's callers need: listing active tags (to confirm ingest
//! visibility) and creating/deleting macros (for query composition). These
//! are stateless single-request calls; the live subscription engine never
//! invokes them itself.

mod client;

pub use client::{Macro, RestClient, RestError};
