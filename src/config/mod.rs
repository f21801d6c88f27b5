//! Configuration types and loading.
//!
//! - `RedpilotConfig`: engine configuration file (TOML) with validation
//! - `DefaultSettings` / `GlobalSettings` / `TaskDefinition`: the three
//!   settings layers merged by [`resolve`] into `EffectiveSettings`
//! - `TaskFile`: task batches with dependencies (JSON)
//! - `TargetDescriptor` and credential references

mod layers;
mod settings;
mod target;
mod task_file;

pub use layers::{
    DEFAULT_CATEGORY, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_CONTEXT_BUDGET, DEFAULT_SSH_PORT,
    DEFAULT_STEP_BUDGET, DefaultSettings, EffectiveScope, EffectiveSettings, GlobalSettings,
    MIN_CONTEXT_BUDGET, ScopeSettings, TaskDefinition, is_valid_task_id, resolve,
};
pub use settings::{
    CapabilitiesConfig, ChannelConfig, DEFAULT_CONFIG_FILE, EngineConfig, GuardrailConfig,
    OutputConfig, ProcessCommand, RedpilotConfig,
};
pub use target::{
    Credential, CredentialRef, CredentialResolver, EnvCredentialResolver, TargetDescriptor,
    TargetSpec,
};
pub use task_file::{SINGLE_GOAL_TASK_ID, TaskFile};
