//! Shared utility functions.
//!
//! - UTF-8 safe truncation helpers
//! - Context size measurement (characters or estimated tokens)

mod string;
mod tokenizer;

pub use string::{truncate_at_boundary, truncate_chars, truncate_with_marker};
pub use tokenizer::SizeMeasure;
