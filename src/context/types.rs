use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::CommandOutput;
use crate::guardrail::{InjectionMatch, Sanitized, Verdict};

/// What happened to one command of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Reached the target. `output` is the raw audit copy; the sanitized
    /// streams are what reasoning capabilities get to see.
    Executed {
        output: CommandOutput,
        sanitized_stdout: String,
        sanitized_stderr: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        injections: Vec<InjectionMatch>,
    },
    /// Blocked by the outbound guardrail. Never reached the target.
    Rejected { rule: String, reason: String },
    /// Channel failure while running the command.
    Failed { error: String },
    /// Discarded because the session was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
}

impl CommandRecord {
    pub fn executed(
        command: impl Into<String>,
        output: CommandOutput,
        stdout: Sanitized,
        stderr: Sanitized,
    ) -> Self {
        let mut injections = stdout.matches;
        injections.extend(stderr.matches);
        Self {
            command: command.into(),
            outcome: CommandOutcome::Executed {
                output,
                sanitized_stdout: stdout.text,
                sanitized_stderr: stderr.text,
                injections,
            },
        }
    }

    /// Record for a command the guardrail denied. `None` for an allow verdict.
    pub fn rejected(command: impl Into<String>, verdict: Verdict) -> Option<Self> {
        match verdict {
            Verdict::Allow => None,
            Verdict::Deny { rule, reason, .. } => Some(Self {
                command: command.into(),
                outcome: CommandOutcome::Rejected { rule, reason },
            }),
        }
    }

    pub fn failed(command: impl Into<String>, error: impl ToString) -> Self {
        Self {
            command: command.into(),
            outcome: CommandOutcome::Failed {
                error: error.to_string(),
            },
        }
    }

    pub fn cancelled(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            outcome: CommandOutcome::Cancelled,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Rejected { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Cancelled)
    }

    pub fn output(&self) -> Option<&CommandOutput> {
        match &self.outcome {
            CommandOutcome::Executed { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn injection_count(&self) -> usize {
        match &self.outcome {
            CommandOutcome::Executed { injections, .. } => injections.len(),
            _ => 0,
        }
    }
}

/// One loop iteration. Immutable once appended to a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    /// Planner fragment; `None` when the planner had no further step.
    pub fragment: Option<String>,
    #[serde(default)]
    pub commands: Vec<CommandRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    pub fn new(index: u32, fragment: Option<String>) -> Self {
        Self {
            index,
            fragment,
            commands: Vec::new(),
            note: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_noop(&self) -> bool {
        self.commands.is_empty()
    }

    /// A step whose every command was blocked by the guardrail.
    pub fn is_rejected(&self) -> bool {
        !self.commands.is_empty() && self.commands.iter().all(CommandRecord::is_rejected)
    }

    pub fn was_cancelled(&self) -> bool {
        self.commands.iter().any(CommandRecord::is_cancelled)
    }
}

/// A condensed stand-in for a run of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub first_step: u32,
    pub last_step: u32,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Marks steps dropped by the drop-oldest fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationMarker {
    pub first_step: u32,
    pub last_step: u32,
    pub dropped_steps: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entry {
    Step(Step),
    Summary(Summary),
    Truncation(TruncationMarker),
}

/// Entry plus its supersession flag. Superseded entries stay for the audit
/// record but are excluded from the live view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub superseded: bool,
    pub entry: Entry,
}

impl LogEntry {
    pub fn live(entry: Entry) -> Self {
        Self {
            superseded: false,
            entry,
        }
    }

    pub fn as_step(&self) -> Option<&Step> {
        match &self.entry {
            Entry::Step(step) => Some(step),
            _ => None,
        }
    }
}
