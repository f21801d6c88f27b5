//! Result output and persistence.
//!
//! - `OutputWriter`: prints results as text, JSON, or NDJSON
//! - `StreamSink`: NDJSON session events for `--output stream`
//! - `ResultStore`: per-session and per-batch result files

mod store;
mod writer;

pub use store::ResultStore;
pub use writer::{OutputWriter, StreamSink};
