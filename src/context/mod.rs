//! Session context: the step log, its live rendering, and compaction.
//!
//! This module handles:
//! - The append-only step log with summaries and truncation markers
//! - Rendering of the sanitized live view and the raw audit record
//! - Compaction when the live view exceeds the context budget
//! - Persistence of the full window for post-mortem review

mod compaction;
mod persistence;
mod types;
mod window;

pub use compaction::{CompactionMethod, CompactionReport, CompactionSettings, ContextCompressor};
pub use persistence::ContextPersistence;
pub use types::{
    CommandOutcome, CommandRecord, Entry, LogEntry, Step, Summary, TruncationMarker,
};
pub use window::{ContextView, ContextWindow};
