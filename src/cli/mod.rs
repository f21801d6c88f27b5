//! Command-line interface definitions.
//!
//! - `Cli`, `Commands`: CLI argument definitions via clap
//! - `Display`: formatted terminal output with colors
//! - `ProgressSink`: batch progress bar fed by session events

mod commands;
mod display;

pub use commands::{Cli, Commands, ConfigAction, OutputFormat};
pub use display::{Display, ProgressSink};
