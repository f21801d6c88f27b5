use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::window::{ContextWindow, render_step};
use crate::capability::{RetryPolicy, Summarizer, SummaryRequest};
use crate::config::EngineConfig;
use crate::error::CapabilityRole;
use crate::utils::SizeMeasure;

/// Summarizer attempts per compaction: the first call plus one retry.
const SUMMARIZER_ATTEMPTS: u32 = 2;

/// Knobs for one session's compaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionSettings {
    pub budget: usize,
    /// Fraction of the budget left free after compaction.
    pub headroom: f64,
    /// Most recent live steps that are never summarized.
    pub preserve_recent: usize,
    pub measure: SizeMeasure,
}

impl CompactionSettings {
    pub fn new(budget: usize, engine: &EngineConfig) -> Self {
        Self {
            budget,
            headroom: engine.compaction_headroom,
            preserve_recent: engine.preserve_recent_steps,
            measure: engine.size_unit,
        }
    }

    /// Size compaction aims for.
    pub fn target(&self) -> usize {
        let headroom = self.headroom.clamp(0.0, 0.9);
        ((self.budget as f64) * (1.0 - headroom)).floor() as usize
    }

    /// Upper bound on one summary's size.
    pub fn summary_limit(&self) -> usize {
        (self.target() / 2).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionMethod {
    Summarized,
    Truncated,
    /// Summary created, then older steps still had to be dropped.
    SummarizedAndTruncated,
}

/// What one compaction pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub method: CompactionMethod,
    pub size_before: usize,
    pub size_after: usize,
    pub budget: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer_error: Option<String>,
}

/// Keeps a window's live size within budget.
///
/// Prefers a rolling summary of the oldest uncovered steps. If no summarizer
/// is configured, or it fails twice, the oldest live steps are dropped and a
/// single merged marker tells downstream readers what went missing.
pub struct ContextCompressor {
    summarizer: Option<Arc<dyn Summarizer>>,
    policy: RetryPolicy,
    settings: CompactionSettings,
}

impl ContextCompressor {
    pub fn new(
        summarizer: Option<Arc<dyn Summarizer>>,
        policy: RetryPolicy,
        settings: CompactionSettings,
    ) -> Self {
        Self {
            summarizer,
            policy: policy.with_attempts(SUMMARIZER_ATTEMPTS),
            settings,
        }
    }

    pub fn needs_compaction(&self, window: &ContextWindow) -> bool {
        window.size(self.settings.measure) > self.settings.budget
    }

    /// Compact `window` if it exceeds the budget. `None` when nothing was done.
    pub async fn compact(&self, goal: &str, window: &mut ContextWindow) -> Option<CompactionReport> {
        let measure = self.settings.measure;
        let size_before = window.size(measure);
        if size_before <= self.settings.budget {
            return None;
        }
        let target = self.settings.target();
        debug!(size = size_before, budget = self.settings.budget, target, "Compacting context");

        let mut summarized = None;
        let mut summarizer_error = None;
        if let Some(summarizer) = &self.summarizer {
            match self.summarize(summarizer.as_ref(), goal, window, size_before).await {
                Ok(range) => summarized = range,
                Err(message) => {
                    warn!(error = %message, "Summarizer failed, falling back to drop-oldest");
                    summarizer_error = Some(message);
                }
            }
        }

        let dropped = self.drop_oldest(window, target);
        let size_after = window.size(measure);

        let method = match (summarized.is_some(), dropped.is_some()) {
            (true, false) => CompactionMethod::Summarized,
            (true, true) => CompactionMethod::SummarizedAndTruncated,
            (false, true) => CompactionMethod::Truncated,
            (false, false) => {
                warn!(size = size_before, budget = self.settings.budget, "Nothing left to compact");
                return None;
            }
        };
        info!(
            method = ?method,
            before = size_before,
            after = size_after,
            budget = self.settings.budget,
            "Context compacted"
        );

        Some(CompactionReport {
            method,
            size_before,
            size_after,
            budget: self.settings.budget,
            summarized,
            dropped,
            summarizer_error,
        })
    }

    /// Oldest uncovered run, excluding the preserved tail, that gets the
    /// window to target once replaced by a summary of `summary_limit` size.
    fn select_run(&self, window: &ContextWindow, size: usize) -> Vec<usize> {
        let measure = self.settings.measure;
        let live = window.live_steps();
        let eligible = live.len().saturating_sub(self.settings.preserve_recent);
        let prior = window
            .live_summary()
            .map_or(0, |s| measure.measure(&s.text));
        let target = self.settings.target();

        let mut projected = size.saturating_sub(prior) + self.settings.summary_limit();
        let mut run = Vec::new();
        for (pos, step) in live.iter().take(eligible) {
            let mut rendered = String::new();
            render_step(&mut rendered, step, false);
            projected = projected.saturating_sub(measure.measure(&rendered));
            run.push(*pos);
            if projected <= target {
                break;
            }
        }
        run
    }

    async fn summarize(
        &self,
        summarizer: &dyn Summarizer,
        goal: &str,
        window: &mut ContextWindow,
        size: usize,
    ) -> Result<Option<(u32, u32)>, String> {
        let run = self.select_run(window, size);
        if run.is_empty() {
            return Ok(None);
        }

        let mut steps = String::new();
        let mut range = (u32::MAX, 0);
        for (pos, step) in window.live_steps() {
            if run.contains(&pos) {
                render_step(&mut steps, step, false);
                range = (range.0.min(step.index), range.1.max(step.index));
            }
        }
        let request = SummaryRequest {
            goal: goal.to_string(),
            first_step: range.0,
            last_step: range.1,
            steps,
            prior_summary: window.live_summary().map(|s| s.text.clone()),
            max_size: self.settings.summary_limit(),
        };

        let text = self
            .policy
            .run(CapabilityRole::Summarizer, || summarizer.summarize(&request))
            .await
            .map_err(|e| e.to_string())?;
        let text = self.settings.measure.fit(text.trim(), self.settings.summary_limit());

        let mut trial = window.clone();
        trial.insert_summary(&run, text);
        if trial.size(self.settings.measure) >= size {
            return Err("summary did not reduce context size".to_string());
        }
        *window = trial;
        Ok(Some(range))
    }

    /// Drop the oldest live steps until the window fits `target`. Preserved
    /// steps are dropped only when the rest cannot get it under the budget.
    fn drop_oldest(&self, window: &mut ContextWindow, target: usize) -> Option<(u32, u32)> {
        let measure = self.settings.measure;
        let budget = self.settings.budget;
        let size = window.size(measure);
        if size <= budget {
            return None;
        }

        let live: Vec<(usize, u32)> = window
            .live_steps()
            .iter()
            .map(|(pos, step)| (*pos, step.index))
            .collect();
        let positions: Vec<usize> = live.iter().map(|(pos, _)| *pos).collect();
        let eligible = live.len().saturating_sub(self.settings.preserve_recent);

        for count in 1..=live.len() {
            let mut trial = window.clone();
            trial.drop_steps(&positions[..count])?;
            let trial_size = trial.size(measure);
            let done = if count < eligible {
                trial_size <= target
            } else if count == eligible {
                trial_size <= budget
            } else {
                trial_size <= budget || count == live.len()
            };
            if done && trial_size < size {
                *window = trial;
                let first = live[0].1;
                let last = live[count - 1].1;
                warn!(first, last, "Dropped oldest steps from the live context");
                return Some((first, last));
            }
        }
        None
    }
}
