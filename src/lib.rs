pub mod capability;
pub mod channel;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod guardrail;
pub mod orchestrator;
pub mod output;
pub mod utils;

pub use capability::{Capabilities, Extractor, Finding, Interpreter, Planner, Summarizer};
pub use channel::{ChannelConnector, CommandOutput, RemoteChannel, SshConnector};
pub use config::{EffectiveSettings, RedpilotConfig, TaskFile, resolve};
pub use context::{ContextCompressor, ContextWindow};
pub use error::{PilotError, Result};
pub use guardrail::{Guardrail, Verdict};
pub use orchestrator::{
    AttackOrchestrator, BatchPlan, BatchRunner, BatchSummary, CancelHandle, SessionReport,
    SessionStatus,
};
