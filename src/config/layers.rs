//! Layered session settings.
//!
//! Three layers feed every session: engine defaults, the task file's global
//! settings, and the task definition itself. [`resolve`] merges them field by
//! field (task over global over defaults) and validates the result once,
//! reporting every violation together.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::target::{TargetDescriptor, TargetSpec};
use crate::error::{PilotError, Result};

/// Smallest context budget that leaves room for a summary plus a truncation marker.
pub const MIN_CONTEXT_BUDGET: usize = 512;

pub const DEFAULT_STEP_BUDGET: u32 = 15;
pub const DEFAULT_CONTEXT_BUDGET: usize = 16_000;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CATEGORY: &str = "general";

/// Engine-level defaults (`[defaults]` in the engine config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultSettings {
    pub step_budget: u32,
    pub context_budget: usize,
    pub summarizer_enabled: bool,
    pub command_timeout_secs: u64,
    pub target: TargetSpec,
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            step_budget: DEFAULT_STEP_BUDGET,
            context_budget: DEFAULT_CONTEXT_BUDGET,
            summarizer_enabled: true,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            target: TargetSpec {
                port: Some(DEFAULT_SSH_PORT),
                username: Some("root".to_string()),
                ..Default::default()
            },
        }
    }
}

/// Declared scope of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    /// Regex patterns for commands outside the declared intent.
    pub excluded_patterns: Vec<String>,
    /// Explicit acknowledgement of out-of-scope risk. Lifts every deny rule that
    /// does not protect the channel itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_out_of_scope: Option<bool>,
}

/// Task-file wide settings (`global_settings` plus the top-level `target`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    #[serde(alias = "max_steps", skip_serializing_if = "Option::is_none")]
    pub step_budget: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_budget: Option<usize>,
    #[serde(alias = "use_summarizer", skip_serializing_if = "Option::is_none")]
    pub summarizer_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    pub scope: ScopeSettings,
    #[serde(skip_serializing_if = "TargetSpec::is_empty")]
    pub target: TargetSpec,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// Task ids name result directories, so they are restricted to
/// `[A-Za-z0-9_.-]` and may not contain `..`.
pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// One task of a task file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub goal: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, alias = "max_steps", skip_serializing_if = "Option::is_none")]
    pub step_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_budget: Option<usize>,
    #[serde(default, alias = "use_summarizer", skip_serializing_if = "Option::is_none")]
    pub summarizer_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    #[serde(default)]
    pub scope: ScopeSettings,
    #[serde(default, skip_serializing_if = "TargetSpec::is_empty")]
    pub target: TargetSpec,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            goal: goal.into(),
            category: default_category(),
            requires: Vec::new(),
            step_budget: None,
            context_budget: None,
            summarizer_enabled: None,
            command_timeout_secs: None,
            scope: ScopeSettings::default(),
            target: TargetSpec::default(),
        }
    }
}

/// Scope after merging. Exclusions of both layers apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveScope {
    pub excluded_patterns: Vec<String>,
    pub allow_out_of_scope: bool,
}

/// Fully merged and validated configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveSettings {
    pub task_id: String,
    pub name: String,
    pub goal: String,
    pub category: String,
    pub target: TargetDescriptor,
    pub step_budget: u32,
    pub context_budget: usize,
    pub summarizer_enabled: bool,
    pub command_timeout_secs: u64,
    pub scope: EffectiveScope,
}

impl EffectiveSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Merge the three layers into one [`EffectiveSettings`].
///
/// Deterministic and side-effect free. All validation failures are collected
/// into a single [`PilotError::ConfigurationInvalid`].
pub fn resolve(
    defaults: &DefaultSettings,
    global: &GlobalSettings,
    task: &TaskDefinition,
) -> Result<EffectiveSettings> {
    let step_budget = task
        .step_budget
        .or(global.step_budget)
        .unwrap_or(defaults.step_budget);
    let context_budget = task
        .context_budget
        .or(global.context_budget)
        .unwrap_or(defaults.context_budget);
    let summarizer_enabled = task
        .summarizer_enabled
        .or(global.summarizer_enabled)
        .unwrap_or(defaults.summarizer_enabled);
    let command_timeout_secs = task
        .command_timeout_secs
        .or(global.command_timeout_secs)
        .unwrap_or(defaults.command_timeout_secs);

    let target = task.target.over(&global.target).over(&defaults.target);

    let mut excluded_patterns = global.scope.excluded_patterns.clone();
    for pattern in &task.scope.excluded_patterns {
        if !excluded_patterns.contains(pattern) {
            excluded_patterns.push(pattern.clone());
        }
    }
    let scope = EffectiveScope {
        excluded_patterns,
        allow_out_of_scope: task
            .scope
            .allow_out_of_scope
            .or(global.scope.allow_out_of_scope)
            .unwrap_or(false),
    };

    let mut violations = Vec::new();

    if task.id.trim().is_empty() {
        violations.push("task id must not be empty".to_string());
    }
    if task.goal.trim().is_empty() {
        violations.push("goal must not be empty".to_string());
    }
    if step_budget == 0 {
        violations.push("step_budget must be greater than 0".to_string());
    }
    if context_budget == 0 {
        violations.push("context_budget must be greater than 0".to_string());
    } else if context_budget < MIN_CONTEXT_BUDGET {
        violations.push(format!(
            "context_budget must be at least {} (got {})",
            MIN_CONTEXT_BUDGET, context_budget
        ));
    }
    if command_timeout_secs == 0 {
        violations.push("command_timeout_secs must be greater than 0".to_string());
    }
    match target.host.as_deref() {
        Some(host) if !host.trim().is_empty() => {}
        _ => violations.push("target.host is required".to_string()),
    }
    match target.port {
        Some(0) => violations.push("target.port must be between 1 and 65535".to_string()),
        Some(_) => {}
        None => violations.push("target.port is required".to_string()),
    }
    match target.username.as_deref() {
        Some(user) if !user.trim().is_empty() => {}
        _ => violations.push("target.username is required".to_string()),
    }
    if target.credential.is_none() {
        violations.push("target.credential is required".to_string());
    }
    if let Some(fingerprint) = &target.host_key_fingerprint
        && (fingerprint.is_empty() || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()))
    {
        violations.push("target.host_key_fingerprint must be a hex SHA-256 digest".to_string());
    }
    for pattern in &scope.excluded_patterns {
        if let Err(e) = Regex::new(pattern) {
            violations.push(format!("scope.excluded_patterns: invalid regex {:?}: {}", pattern, e));
        }
    }

    if !violations.is_empty() {
        return Err(PilotError::invalid_config(violations));
    }

    let (Some(host), Some(port), Some(username), Some(credential)) =
        (target.host, target.port, target.username, target.credential)
    else {
        return Err(PilotError::invalid_config(vec![
            "target descriptor is incomplete".to_string(),
        ]));
    };

    Ok(EffectiveSettings {
        task_id: task.id.clone(),
        name: task.name.clone(),
        goal: task.goal.clone(),
        category: task.category.clone(),
        target: TargetDescriptor {
            host,
            port,
            username,
            credential,
            host_key_fingerprint: target.host_key_fingerprint,
        },
        step_budget,
        context_budget,
        summarizer_enabled,
        command_timeout_secs,
        scope,
    })
}
