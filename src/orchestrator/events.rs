
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{EngineState, SessionStatus};
use crate::context::CompactionReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted {
        target: String,
        goal: String,
        step_budget: u32,
    },
    StateChanged {
        from: EngineState,
        to: EngineState,
    },
    StepRecorded {
        step: u32,
        fragment: Option<String>,
        commands: usize,
        rejected: usize,
        injections: usize,
    },
    CommandRejected {
        step: u32,
        command: String,
        reason: String,
    },
    Compacted {
        report: CompactionReport,
    },
    Terminated {
        status: SessionStatus,
        reason: String,
        steps: u32,
        findings: usize,
    },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session.started",
            Self::StateChanged { .. } => "session.state",
            Self::StepRecorded { .. } => "step.recorded",
            Self::CommandRejected { .. } => "command.rejected",
            Self::Compacted { .. } => "context.compacted",
            Self::Terminated { .. } => "session.terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, task_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            created_at: Utc::now(),
            kind,
        }
    }
}

/// Receiver of session progress. Called inline from the session loop, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SessionEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &SessionEvent) {}
}
