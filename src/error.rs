use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which reasoning role a capability call was made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRole {
    Planner,
    GoalVerifier,
    Interpreter,
    Summarizer,
    Extractor,
}

impl fmt::Display for CapabilityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planner => "planner",
            Self::GoalVerifier => "goal-verifier",
            Self::Interpreter => "interpreter",
            Self::Summarizer => "summarizer",
            Self::Extractor => "extractor",
        };
        write!(f, "{}", s)
    }
}

/// Failures of the remote command channel.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("connection to {address} failed: {message}")]
    Connect { address: String, message: String },

    #[error("authentication failed for {username}@{address}")]
    Authentication { address: String, username: String },

    #[error("host key mismatch for {address} (expected {expected}, got {observed})")]
    HostKeyMismatch {
        address: String,
        expected: String,
        observed: String,
    },

    #[error("command execution failed: {0}")]
    Exec(String),

    #[error("channel is closed")]
    Closed,
}

impl ChannelError {
    /// Authentication and host key problems will not fix themselves on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Exec(_) | Self::Closed)
    }
}

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("{role} capability unavailable: {message}")]
    CapabilityUnavailable {
        role: CapabilityRole,
        message: String,
    },

    #[error("{role} capability returned a malformed response: {message}")]
    MalformedResponse {
        role: CapabilityRole,
        message: String,
    },

    #[error("{role} capability timed out after {}s", .after.as_secs())]
    CapabilityTimeout {
        role: CapabilityRole,
        after: Duration,
    },

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("command rejected by guardrail: {reason} ({command})")]
    GuardrailRejection { command: String, reason: String },

    #[error("invalid configuration:\n  - {}", .violations.join("\n  - "))]
    ConfigurationInvalid { violations: Vec<String> },

    #[error("task graph error: {0}")]
    TaskGraph(String),

    #[error("credential unavailable: {0}")]
    Credential(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("invalid engine state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl PilotError {
    pub fn unavailable(role: CapabilityRole, message: impl Into<String>) -> Self {
        Self::CapabilityUnavailable {
            role,
            message: message.into(),
        }
    }

    pub fn malformed(role: CapabilityRole, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            role,
            message: message.into(),
        }
    }

    pub fn invalid_config(violations: Vec<String>) -> Self {
        Self::ConfigurationInvalid { violations }
    }

    /// Whether a bounded local retry may succeed.
    ///
    /// Malformed capability responses count as transient: the backing engine
    /// is nondeterministic and a second call often yields a usable answer.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CapabilityUnavailable { .. }
            | Self::MalformedResponse { .. }
            | Self::CapabilityTimeout { .. } => true,
            Self::Channel(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn violations(&self) -> &[String] {
        match self {
            Self::ConfigurationInvalid { violations } => violations,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;
