use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::SessionStatus;
use crate::capability::{Finding, PlanState, TerminationReason};
use crate::context::{CompactionReport, ContextWindow};

/// Everything one session produced, handed to reporting unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub task_id: String,
    pub name: String,
    pub category: String,
    pub goal: String,
    pub target: String,
    pub status: SessionStatus,
    pub reason: TerminationReason,
    pub steps_taken: u32,
    pub step_budget: u32,
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compactions: Vec<CompactionReport>,
    pub plan: PlanState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Full step log, superseded entries and raw output included.
    pub context: ContextWindow,
}

impl SessionReport {
    pub fn goal_reached(&self) -> bool {
        self.status == SessionStatus::GoalReached
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total: usize,
    pub completed: usize,
    pub findings: usize,
}

/// Aggregate over every session of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    /// Percentage of sessions that reached their goal.
    pub completion_rate: f64,
    pub total_findings: usize,
    pub categories: BTreeMap<String, CategoryStats>,
    pub sessions: Vec<SessionReport>,
}

impl BatchSummary {
    pub fn from_sessions(started_at: DateTime<Utc>, sessions: Vec<SessionReport>) -> Self {
        let finished_at = Utc::now();
        let total_tasks = sessions.len();
        let completed_tasks = sessions.iter().filter(|s| s.goal_reached()).count();
        let total_findings = sessions.iter().map(|s| s.findings.len()).sum();

        let mut categories: BTreeMap<String, CategoryStats> = BTreeMap::new();
        for session in &sessions {
            let stats = categories.entry(session.category.clone()).or_default();
            stats.total += 1;
            if session.goal_reached() {
                stats.completed += 1;
            }
            stats.findings += session.findings.len();
        }

        let completion_rate = if total_tasks > 0 {
            completed_tasks as f64 / total_tasks as f64 * 100.0
        } else {
            0.0
        };

        Self {
            started_at,
            finished_at,
            duration_secs: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
            total_tasks,
            completed_tasks,
            completion_rate,
            total_findings,
            categories,
            sessions,
        }
    }

    pub fn all_completed(&self) -> bool {
        self.completed_tasks == self.total_tasks
    }
}
