use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::layers::{DefaultSettings, MIN_CONTEXT_BUDGET};
use crate::error::{PilotError, Result};
use crate::guardrail::NeutralizeMode;
use crate::utils::SizeMeasure;

pub const DEFAULT_CONFIG_FILE: &str = "redpilot.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedpilotConfig {
    pub engine: EngineConfig,
    pub capabilities: CapabilitiesConfig,
    pub channel: ChannelConfig,
    pub guardrail: GuardrailConfig,
    pub defaults: DefaultSettings,
    pub output: OutputConfig,
}

impl RedpilotConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or from `redpilot.toml` in the working
    /// directory when present.
    pub async fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) if !path.exists() => Err(PilotError::Other(format!(
                "config file not found: {}",
                path.display()
            ))),
            Some(path) => Self::load(path).await,
            None => Self::load(Path::new(DEFAULT_CONFIG_FILE)).await,
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| PilotError::Other(e.to_string()))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values, reporting every violation at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Engine
        if !(0.0..=0.9).contains(&self.engine.compaction_headroom) {
            errors.push("engine.compaction_headroom must be between 0.0 and 0.9".into());
        }
        if self.engine.max_parallel_sessions == 0 {
            errors.push("engine.max_parallel_sessions must be greater than 0".into());
        }

        // Capabilities
        let caps = &self.capabilities;
        if caps.timeout_secs == 0 {
            errors.push("capabilities.timeout_secs must be greater than 0".into());
        }
        if caps.max_attempts == 0 {
            errors.push("capabilities.max_attempts must be greater than 0".into());
        }
        if caps.initial_backoff_ms > caps.max_backoff_ms {
            errors.push("capabilities.initial_backoff_ms must be <= max_backoff_ms".into());
        }
        for (role, command) in caps.process_commands() {
            if command.program.trim().is_empty() {
                errors.push(format!("capabilities.{}.program must not be empty", role));
            }
        }

        // Channel
        if self.channel.connect_timeout_secs == 0 {
            errors.push("channel.connect_timeout_secs must be greater than 0".into());
        }
        if self.channel.max_output_bytes < 1024 {
            errors.push("channel.max_output_bytes must be at least 1024".into());
        }

        // Guardrail
        for pattern in self
            .guardrail
            .deny_patterns
            .iter()
            .chain(&self.guardrail.injection_patterns)
        {
            if let Err(e) = Regex::new(pattern) {
                errors.push(format!("guardrail: invalid regex {:?}: {}", pattern, e));
            }
        }

        // Session defaults
        if self.defaults.step_budget == 0 {
            errors.push("defaults.step_budget must be greater than 0".into());
        }
        if self.defaults.context_budget < MIN_CONTEXT_BUDGET {
            errors.push(format!(
                "defaults.context_budget must be at least {}",
                MIN_CONTEXT_BUDGET
            ));
        }
        if self.defaults.command_timeout_secs == 0 {
            errors.push("defaults.command_timeout_secs must be greater than 0".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PilotError::invalid_config(errors))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of the context budget kept free after compaction.
    pub compaction_headroom: f64,
    /// Most recent steps never selected for summarization.
    pub preserve_recent_steps: usize,
    /// Unit in which context budgets are measured.
    pub size_unit: SizeMeasure,
    /// Independent sessions of one batch that may run at the same time.
    pub max_parallel_sessions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compaction_headroom: 0.2,
            preserve_recent_steps: 1,
            size_unit: SizeMeasure::Chars,
            max_parallel_sessions: 1,
        }
    }
}

/// External program serving one capability role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner: Option<ProcessCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<ProcessCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarizer: Option<ProcessCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extractor: Option<ProcessCommand>,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            planner: None,
            interpreter: None,
            summarizer: None,
            extractor: None,
        }
    }
}

impl CapabilitiesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn process_commands(&self) -> impl Iterator<Item = (&'static str, &ProcessCommand)> {
        [
            ("planner", self.planner.as_ref()),
            ("interpreter", self.interpreter.as_ref()),
            ("summarizer", self.summarizer.as_ref()),
            ("extractor", self.extractor.as_ref()),
        ]
        .into_iter()
        .filter_map(|(role, cmd)| cmd.map(|c| (role, c)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub connect_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    /// 0 disables keepalive.
    pub keepalive_secs: u32,
    /// Per-stream capture limit for command output.
    pub max_output_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 1000,
            keepalive_secs: 30,
            max_output_bytes: 256 * 1024,
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Extra command patterns denied on top of the built-in list.
    pub deny_patterns: Vec<String>,
    /// Extra injection patterns scanned for in command output.
    pub injection_patterns: Vec<String>,
    pub neutralize: NeutralizeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Write per-session reports and the batch results file.
    pub persist: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./attack_results"),
            persist: true,
        }
    }
}
