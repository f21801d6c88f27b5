//! Reasoning capability contracts.
//!
//! The engine is independent of what backs each role: a model API, a local
//! program ([`ProcessCapability`]), or a scripted test double. Capabilities
//! only ever see the sanitized [`ContextView`]; the Extractor additionally
//! receives the full audit window at termination.

mod parse;
mod process;
mod retry;

pub use parse::{
    clean_commands, extract_json, parse_commands, parse_findings, parse_plan, parse_summary,
    parse_verdict,
};
pub use process::ProcessCapability;
pub use retry::RetryPolicy;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::CapabilitiesConfig;
use crate::context::{ContextView, ContextWindow};
use crate::error::{PilotError, Result};

/// One planned sub-goal with its verification criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubGoal {
    pub description: String,
    #[serde(default)]
    pub verification: String,
    #[serde(default)]
    pub done: bool,
}

/// Planner-owned strategic state. Opaque to the engine, passed back on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanState {
    #[serde(default)]
    pub sub_goals: Vec<SubGoal>,
    /// Index into `sub_goals` of the active sub-goal.
    #[serde(default)]
    pub active: Option<usize>,
}

impl PlanState {
    pub fn is_empty(&self) -> bool {
        self.sub_goals.is_empty()
    }

    pub fn active_sub_goal(&self) -> Option<&SubGoal> {
        self.active.and_then(|i| self.sub_goals.get(i))
    }

    /// First sub-goal not yet marked done.
    pub fn next_open(&self) -> Option<(usize, &SubGoal)> {
        self.sub_goals.iter().enumerate().find(|(_, g)| !g.done)
    }
}

/// Planner answer for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// Next strategic step, or `None` when the planner has nothing further.
    pub fragment: Option<String>,
    pub plan: PlanState,
}

impl PlanOutcome {
    pub fn step(fragment: impl Into<String>, plan: PlanState) -> Self {
        Self {
            fragment: Some(fragment.into()),
            plan,
        }
    }

    pub fn finished(plan: PlanState) -> Self {
        Self {
            fragment: None,
            plan,
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    GoalReached,
    StepLimit { steps: u32 },
    Fatal { message: String },
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GoalReached => write!(f, "goal reached"),
            Self::StepLimit { steps } => write!(f, "step budget of {} exhausted", steps),
            Self::Fatal { message } => write!(f, "fatal error: {}", message),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" | "none" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" | "moderate" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// One assessed finding, produced by the Extractor at termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// e.g. misconfiguration, vulnerability, credential exposure.
    pub category: String,
    pub description: String,
    /// Step index the evidence comes from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_step: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub evidence: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub remediation: String,
}

/// Input for one compaction call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRequest {
    pub goal: String,
    pub first_step: u32,
    pub last_step: u32,
    /// Sanitized rendering of the selected step run.
    pub steps: String,
    pub prior_summary: Option<String>,
    /// Size the summary should stay within, in the session's size unit.
    pub max_size: usize,
}

/// Input for the final extraction.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub goal: &'a str,
    pub target: &'a str,
    /// Full window, superseded entries and raw output included.
    pub window: &'a ContextWindow,
    pub reason: &'a TerminationReason,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str, context: &ContextView, plan: &PlanState)
    -> Result<PlanOutcome>;

    async fn verify_goal(&self, goal: &str, context: &ContextView) -> Result<bool>;
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Ordered shell commands for one strategic step. May be empty.
    async fn interpret(&self, fragment: &str, context: &ContextView) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<Vec<Finding>>;
}

/// The four roles wired into one session.
#[derive(Clone)]
pub struct Capabilities {
    pub planner: Arc<dyn Planner>,
    pub interpreter: Arc<dyn Interpreter>,
    /// `None` forces the drop-oldest fallback whenever compaction is needed.
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub extractor: Arc<dyn Extractor>,
}

impl Capabilities {
    /// Wire every role to its configured external program.
    ///
    /// Planner, interpreter and extractor are required; a missing summarizer
    /// leaves compaction to the drop-oldest fallback.
    pub fn from_config(config: &CapabilitiesConfig) -> Result<Self> {
        let mut missing = Vec::new();
        for (role, cmd) in [
            ("planner", &config.planner),
            ("interpreter", &config.interpreter),
            ("extractor", &config.extractor),
        ] {
            if cmd.is_none() {
                missing.push(format!("capabilities.{} must be configured to run sessions", role));
            }
        }
        let (Some(planner), Some(interpreter), Some(extractor)) =
            (&config.planner, &config.interpreter, &config.extractor)
        else {
            return Err(PilotError::invalid_config(missing));
        };

        Ok(Self {
            planner: Arc::new(ProcessCapability::new(planner.clone())),
            interpreter: Arc::new(ProcessCapability::new(interpreter.clone())),
            summarizer: config
                .summarizer
                .clone()
                .map(|cmd| Arc::new(ProcessCapability::new(cmd)) as Arc<dyn Summarizer>),
            extractor: Arc::new(ProcessCapability::new(extractor.clone())),
        })
    }
}
