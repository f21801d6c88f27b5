use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::TerminationReason;

/// Loop position of one attack session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Init,
    Plan,
    Interpret,
    Execute,
    Observe,
    Compact,
    GoalCheck,
    GoalReached,
    StepLimit,
    FatalError,
    Cancelled,
}

impl EngineState {
    pub fn allowed_transitions(&self) -> &'static [EngineState] {
        use EngineState::*;
        match self {
            Init => &[Plan, FatalError, Cancelled],
            Plan => &[Interpret, Observe, FatalError, Cancelled],
            Interpret => &[Execute, Observe, FatalError, Cancelled],
            Execute => &[Observe],
            Observe => &[Compact, GoalCheck, FatalError, Cancelled],
            Compact => &[GoalCheck, Cancelled],
            GoalCheck => &[Plan, GoalReached, StepLimit, FatalError, Cancelled],
            GoalReached => &[],
            StepLimit => &[],
            FatalError => &[],
            Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: EngineState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::GoalReached | Self::StepLimit | Self::FatalError | Self::Cancelled
        )
    }

    /// Terminal state a termination reason lands in.
    pub fn terminal_for(reason: &TerminationReason) -> Self {
        match reason {
            TerminationReason::GoalReached => Self::GoalReached,
            TerminationReason::StepLimit { .. } => Self::StepLimit,
            TerminationReason::Fatal { .. } => Self::FatalError,
            TerminationReason::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Plan => "PLAN",
            Self::Interpret => "INTERPRET",
            Self::Execute => "EXECUTE",
            Self::Observe => "OBSERVE",
            Self::Compact => "COMPACT",
            Self::GoalCheck => "GOAL_CHECK",
            Self::GoalReached => "GOAL_REACHED",
            Self::StepLimit => "STEP_LIMIT",
            Self::FatalError => "FATAL_ERROR",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Externally visible session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    GoalReached,
    StepLimitReached,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl From<&TerminationReason> for SessionStatus {
    fn from(reason: &TerminationReason) -> Self {
        match reason {
            TerminationReason::GoalReached => Self::GoalReached,
            TerminationReason::StepLimit { .. } => Self::StepLimitReached,
            TerminationReason::Fatal { .. } => Self::Failed,
            TerminationReason::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::GoalReached => "goal_reached",
            Self::StepLimitReached => "step_limit_reached",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}
