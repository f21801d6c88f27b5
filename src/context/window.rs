use std::fmt::Write as _;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::{CommandOutcome, CommandRecord, Entry, LogEntry, Step, Summary, TruncationMarker};
use crate::error::{PilotError, Result};
use crate::utils::{SizeMeasure, truncate_with_marker};

/// Per-stream cap in the live rendering. Full output stays in the audit log.
const LIVE_OUTPUT_LIMIT: usize = 4000;

/// Ordered step log of one session with its summaries and truncation markers.
///
/// Steps are append-only with contiguous indices. Compaction never removes
/// entries; it marks them superseded so the audit record stays complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    entries: Vec<LogEntry>,
}

/// Sanitized live context handed to the Planner and Interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextView {
    pub target: String,
    pub text: String,
    pub next_step: u32,
    pub step_budget: u32,
}

impl ContextWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Every step ever appended, superseded ones included.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.entries.iter().filter_map(LogEntry::as_step)
    }

    pub fn step_count(&self) -> u32 {
        self.steps().count() as u32
    }

    pub fn next_index(&self) -> u32 {
        self.step_count()
    }

    pub fn append(&mut self, step: Step) -> Result<()> {
        let expected = self.next_index();
        if step.index != expected {
            return Err(PilotError::Other(format!(
                "step {} appended out of order, expected {}",
                step.index, expected
            )));
        }
        self.entries.push(LogEntry::live(Entry::Step(step)));
        Ok(())
    }

    pub fn live_entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| !e.superseded)
    }

    /// Live steps, oldest first, paired with their entry position.
    pub(crate) fn live_steps(&self) -> Vec<(usize, &Step)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.superseded)
            .filter_map(|(pos, e)| e.as_step().map(|s| (pos, s)))
            .collect()
    }

    pub fn live_summary(&self) -> Option<&Summary> {
        self.live_entries().find_map(|e| match &e.entry {
            Entry::Summary(summary) => Some(summary),
            _ => None,
        })
    }

    pub fn live_marker(&self) -> Option<&TruncationMarker> {
        self.live_entries().find_map(|e| match &e.entry {
            Entry::Truncation(marker) => Some(marker),
            _ => None,
        })
    }

    pub fn summary_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.entry, Entry::Summary(_)))
            .count()
    }

    pub fn has_truncation(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.entry, Entry::Truncation(_)))
    }

    /// Rendering fed to reasoning capabilities: live entries, sanitized output.
    pub fn render_live(&self) -> String {
        let mut out = String::new();
        for entry in self.live_entries() {
            render_entry(&mut out, &entry.entry, false);
        }
        out
    }

    /// Complete record with raw output and superseded entries.
    pub fn render_audit(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            if entry.superseded {
                out.push_str("(superseded)\n");
            }
            render_entry(&mut out, &entry.entry, true);
        }
        out
    }

    pub fn size(&self, measure: SizeMeasure) -> usize {
        measure.measure(&self.render_live())
    }

    pub fn view(&self, target: impl Into<String>, step_budget: u32) -> ContextView {
        ContextView {
            target: target.into(),
            text: self.render_live(),
            next_step: self.next_index(),
            step_budget,
        }
    }

    /// Replace the live steps at `positions` (and any live summary) with one
    /// summary entry, placed after the last step it covers.
    pub(crate) fn insert_summary(&mut self, positions: &[usize], text: String) -> Option<Summary> {
        let covered: Vec<u32> = positions
            .iter()
            .filter_map(|&p| self.entries.get(p).and_then(LogEntry::as_step))
            .map(|s| s.index)
            .collect();
        let (&first, &last) = (covered.first()?, covered.last()?);
        let prior_first = self.live_summary().map(|s| s.first_step);

        for entry in self.entries.iter_mut() {
            if matches!(entry.entry, Entry::Summary(_)) {
                entry.superseded = true;
            }
        }
        for &p in positions {
            if let Some(entry) = self.entries.get_mut(p) {
                entry.superseded = true;
            }
        }

        let summary = Summary {
            first_step: prior_first.map_or(first, |f| f.min(first)),
            last_step: last,
            text,
            created_at: Utc::now(),
        };
        let at = positions.iter().max().map_or(self.entries.len(), |p| p + 1);
        self.entries
            .insert(at, LogEntry::live(Entry::Summary(summary.clone())));
        Some(summary)
    }

    /// Drop live steps at `positions`, merging into the single live marker.
    pub(crate) fn drop_steps(&mut self, positions: &[usize]) -> Option<TruncationMarker> {
        let dropped: Vec<u32> = positions
            .iter()
            .filter_map(|&p| self.entries.get(p).and_then(LogEntry::as_step))
            .map(|s| s.index)
            .collect();
        let (&first, &last) = (dropped.first()?, dropped.last()?);

        let mut marker = TruncationMarker {
            first_step: first,
            last_step: last,
            dropped_steps: dropped.len() as u32,
            created_at: Utc::now(),
        };
        for entry in self.entries.iter_mut().filter(|e| !e.superseded) {
            if let Entry::Truncation(prior) = &entry.entry {
                marker.first_step = marker.first_step.min(prior.first_step);
                marker.last_step = marker.last_step.max(prior.last_step);
                marker.dropped_steps += prior.dropped_steps;
                entry.superseded = true;
            }
        }
        for &p in positions {
            if let Some(entry) = self.entries.get_mut(p) {
                entry.superseded = true;
            }
        }

        let at = positions.iter().max().map_or(self.entries.len(), |p| p + 1);
        self.entries
            .insert(at, LogEntry::live(Entry::Truncation(marker.clone())));
        Some(marker)
    }
}

fn render_entry(out: &mut String, entry: &Entry, raw: bool) {
    match entry {
        Entry::Summary(summary) => {
            let _ = writeln!(
                out,
                "[summary of steps {}-{}]\n{}\n",
                summary.first_step, summary.last_step, summary.text
            );
        }
        Entry::Truncation(marker) => {
            let _ = writeln!(
                out,
                "[steps {}-{} dropped ({} total), see audit log]\n",
                marker.first_step, marker.last_step, marker.dropped_steps
            );
        }
        Entry::Step(step) => render_step(out, step, raw),
    }
}

pub(crate) fn render_step(out: &mut String, step: &Step, raw: bool) {
    let _ = writeln!(
        out,
        "## Step {}: {}",
        step.index,
        step.fragment.as_deref().unwrap_or("(no further strategic step)")
    );
    if step.commands.is_empty() {
        out.push_str("(no commands)\n");
    }
    for record in &step.commands {
        render_command(out, record, raw);
    }
    if let Some(note) = &step.note {
        let _ = writeln!(out, "note: {}", note);
    }
    out.push('\n');
}

fn render_command(out: &mut String, record: &CommandRecord, raw: bool) {
    let _ = writeln!(out, "$ {}", record.command);
    match &record.outcome {
        CommandOutcome::Executed {
            output,
            sanitized_stdout,
            sanitized_stderr,
            injections,
        } => {
            let status = match (output.timed_out, output.exit_status) {
                (true, _) => "timed out".to_string(),
                (false, Some(code)) => format!("exit {}", code),
                (false, None) => "exit unknown".to_string(),
            };
            let _ = writeln!(out, "[{}, {} ms]", status, output.duration.as_millis());
            if output.reruns > 0 {
                let _ = writeln!(
                    out,
                    "[re-run {} time(s) after the session dropped; earlier runs may have partially executed]",
                    output.reruns
                );
            }
            let (stdout, stderr) = if raw {
                (output.stdout.as_str(), output.stderr.as_str())
            } else {
                (sanitized_stdout.as_str(), sanitized_stderr.as_str())
            };
            push_stream(out, "stdout", stdout, raw);
            push_stream(out, "stderr", stderr, raw);
            if raw && !injections.is_empty() {
                let names: Vec<&str> = injections.iter().map(|m| m.pattern.as_str()).collect();
                let _ = writeln!(out, "[neutralized for reasoning: {}]", names.join(", "));
            }
        }
        CommandOutcome::Rejected { reason, .. } => {
            let _ = writeln!(out, "[rejected by guardrail, not executed: {}]", reason);
        }
        CommandOutcome::Failed { error } => {
            let _ = writeln!(out, "[failed: {}]", error);
        }
        CommandOutcome::Cancelled => out.push_str("[cancelled]\n"),
    }
}

fn push_stream(out: &mut String, label: &str, text: &str, raw: bool) {
    let text = text.trim_end();
    if text.is_empty() {
        return;
    }
    let text = if raw {
        text.to_string()
    } else {
        truncate_with_marker(text, LIVE_OUTPUT_LIMIT)
    };
    let _ = writeln!(out, "{}:\n{}", label, text);
}
