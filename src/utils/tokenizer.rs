//! Context size measurement.
//!
//! Budgets are expressed either in characters or in estimated tokens. Token
//! counts use tiktoken encodings; the backing reasoning engines may tokenize
//! differently, so treat them as planning estimates.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn cl100k() -> Option<&'static CoreBPE> {
    CL100K.get_or_init(|| cl100k_base().ok()).as_ref()
}

fn o200k() -> Option<&'static CoreBPE> {
    O200K.get_or_init(|| o200k_base().ok()).as_ref()
}

const HEURISTIC_CHARS_PER_TOKEN: usize = 4;

/// Unit in which a context budget is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMeasure {
    #[default]
    Chars,
    Cl100kTokens,
    O200kTokens,
    HeuristicTokens,
}

impl SizeMeasure {
    pub fn measure(self, text: &str) -> usize {
        match self {
            Self::Chars => text.chars().count(),
            Self::Cl100kTokens => cl100k()
                .map(|bpe| bpe.encode_with_special_tokens(text).len())
                .unwrap_or_else(|| heuristic_estimate(text)),
            Self::O200kTokens => o200k()
                .map(|bpe| bpe.encode_with_special_tokens(text).len())
                .unwrap_or_else(|| heuristic_estimate(text)),
            Self::HeuristicTokens => heuristic_estimate(text),
        }
    }

    /// Shrink `text` until it measures at most `max_units`.
    ///
    /// Cuts at word boundaries and ends with "..." when anything was removed.
    pub fn fit(self, text: &str, max_units: usize) -> String {
        if self.measure(text) <= max_units {
            return text.to_string();
        }
        let mut max_chars = match self {
            Self::Chars => max_units,
            _ => max_units.saturating_mul(HEURISTIC_CHARS_PER_TOKEN),
        };
        loop {
            let candidate = super::truncate_at_boundary(text, max_chars);
            if max_chars == 0 || self.measure(&candidate) <= max_units {
                return candidate;
            }
            max_chars = max_chars * 9 / 10;
        }
    }
}

/// tokens ≈ bytes / 4
fn heuristic_estimate(text: &str) -> usize {
    text.len().div_ceil(HEURISTIC_CHARS_PER_TOKEN)
}
