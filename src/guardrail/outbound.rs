//! Outbound check: commands are screened before they reach the target.

use std::fmt;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::EffectiveScope;
use crate::error::{PilotError, Result};

/// Why a rule exists. Decides whether an out-of-scope override lifts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Irreversible damage to the target.
    Destructive,
    /// Would terminate or hijack the command channel itself.
    ChannelHijack,
    /// Needs a terminal; hangs a non-interactive channel until timeout.
    Interactive,
    /// Excluded by the session's declared scope.
    Scope,
    /// Added through engine configuration.
    Custom,
}

impl RuleKind {
    /// Channel hijacks and interactive programs break the session regardless
    /// of what risk the operator accepted.
    pub fn overridable(self) -> bool {
        matches!(self, Self::Destructive | Self::Scope | Self::Custom)
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Destructive => "destructive",
            Self::ChannelHijack => "channel-hijack",
            Self::Interactive => "interactive",
            Self::Scope => "out-of-scope",
            Self::Custom => "denied",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct DenyRule {
    pub name: String,
    pub kind: RuleKind,
    pattern: Regex,
    /// Matching commands are allowed despite `pattern` (e.g. `top -b`).
    exempt: Option<Regex>,
}

impl DenyRule {
    pub fn new(name: &str, kind: RuleKind, pattern: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            kind,
            pattern: compile(pattern)?,
            exempt: None,
        })
    }

    fn with_exemption(mut self, pattern: &str) -> Result<Self> {
        self.exempt = Some(compile(pattern)?);
        Ok(self)
    }

    pub fn matches(&self, command: &str) -> bool {
        self.pattern.is_match(command)
            && !self.exempt.as_ref().is_some_and(|e| e.is_match(command))
    }
}

/// Rules run in multi-line mode: `^` and `$` also match around each newline,
/// so every line of a multi-line command is screened.
fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern).multi_line(true).build().map_err(|e| {
        PilotError::invalid_config(vec![format!(
            "deny pattern {:?} is not a valid regex: {}",
            pattern, e
        )])
    })
}

/// Start of a shell command: a line start, a separator, a substitution, a
/// wrapper (`sudo`, `nohup`, `env`, ...) or the script of `sh -c`. Wrapper
/// options, `VAR=value` assignments and a directory prefix may follow.
const CMD: &str = concat!(
    r"(?:^|[;&|(`{]|\$\(",
    r"|\b(?:sudo|doas|nohup|env|exec|xargs|nice|ionice|time|command|eval|watch|setsid|timeout\s+\S+)\s",
    r#"|\b(?:(?:ba|da|k|z)?sh|su)\s+(?:-\w+\s+)*-\w*c\w*\s+['"]?"#,
    r")\s*(?:-\S+\s+|\w+=\S*\s+)*(?:\S*/)?",
);

/// End of a command word.
const END: &str = r#"(?:\s|$|[;&|)`'"])"#;

fn builtin_rules() -> Result<Vec<DenyRule>> {
    use RuleKind::*;
    Ok(vec![
        DenyRule::new(
            "rm_root",
            Destructive,
            &format!(r#"\brm\s+(?:-\S+\s+)*(?:['"]?/(?:\.?/)*\.?\*?['"]?|--no-preserve-root){END}"#),
        )?,
        DenyRule::new("mkfs", Destructive, r"\bmkfs(?:\.\w+)?\b")?,
        DenyRule::new(
            "raw_disk_redirect",
            Destructive,
            r">\s*/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d)",
        )?,
        DenyRule::new(
            "dd_to_disk",
            Destructive,
            r"\bdd\b[^;&|]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk)",
        )?,
        DenyRule::new("dd_zero_fill", Destructive, r"\bdd\b[^;&|]*\bif=/dev/zero\b")?,
        DenyRule::new(
            "fork_bomb",
            Destructive,
            r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        )?,
        DenyRule::new(
            "power_state",
            ChannelHijack,
            &format!(r"{CMD}(?:shutdown|reboot|halt|poweroff)\b"),
        )?,
        DenyRule::new("init_runlevel", ChannelHijack, &format!(r"{CMD}(?:init|telinit)\s+[06]\b"))?,
        DenyRule::new(
            "systemctl_power",
            ChannelHijack,
            r"\bsystemctl\s+(?:poweroff|reboot|halt|kexec)\b",
        )?,
        DenyRule::new(
            "kill_sshd",
            ChannelHijack,
            r"\b(?:pkill|killall)\b[^;&|]*\bsshd?\b|\bkill\b[^;&|]*\$\(\s*pidof\s+sshd?\s*\)",
        )?,
        DenyRule::new(
            "stop_sshd",
            ChannelHijack,
            r"\bsystemctl\s+(?:stop|restart|kill|disable)\s+(?:ssh|sshd)(?:\.service)?\b|\bservice\s+sshd?\s+(?:stop|restart)\b",
        )?,
        DenyRule::new("exit_shell", ChannelHijack, &format!(r"{CMD}(?:exit|logout)\b"))?,
        DenyRule::new(
            "interactive_program",
            Interactive,
            &format!(r"{CMD}(?:vi|vim|nvim|nano|emacs|less|more|htop){END}"),
        )?,
        DenyRule::new("interactive_top", Interactive, &format!(r"{CMD}top\b"))?
            .with_exemption(r"\btop\b[^;&|]*\s-[a-zA-Z]*b")?,
        DenyRule::new(
            "passwd_login_user",
            Interactive,
            &format!(r"{CMD}passwd\s*(?:$|[;&|)`'])"),
        )?,
    ])
}

static BUILTIN_RULES: LazyLock<Vec<DenyRule>> =
    LazyLock::new(|| builtin_rules().expect("built-in deny rules compile"));

/// Result of screening one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny {
        rule: String,
        kind: RuleKind,
        reason: String,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn into_error(self, command: &str) -> Option<PilotError> {
        match self {
            Self::Allow => None,
            Self::Deny { reason, .. } => Some(PilotError::GuardrailRejection {
                command: command.to_string(),
                reason,
            }),
        }
    }
}

/// Denylist for one session: built-in rules, configured extras, scope exclusions.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    rules: Vec<DenyRule>,
    allow_out_of_scope: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            rules: BUILTIN_RULES.clone(),
            allow_out_of_scope: false,
        }
    }
}

impl CommandPolicy {
    pub fn new(extra_deny: &[String], scope: &EffectiveScope) -> Result<Self> {
        let mut rules = BUILTIN_RULES.clone();
        let mut errors = Vec::new();
        for (i, pattern) in extra_deny.iter().enumerate() {
            match DenyRule::new(&format!("custom_{}", i), RuleKind::Custom, pattern) {
                Ok(rule) => rules.push(rule),
                Err(e) => errors.extend(e.violations().iter().cloned()),
            }
        }
        for (i, pattern) in scope.excluded_patterns.iter().enumerate() {
            match DenyRule::new(&format!("scope_{}", i), RuleKind::Scope, pattern) {
                Ok(rule) => rules.push(rule),
                Err(e) => errors.extend(e.violations().iter().cloned()),
            }
        }
        if !errors.is_empty() {
            return Err(PilotError::invalid_config(errors));
        }
        Ok(Self {
            rules,
            allow_out_of_scope: scope.allow_out_of_scope,
        })
    }

    pub fn check(&self, command: &str) -> Verdict {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Verdict::Deny {
                rule: "empty".into(),
                kind: RuleKind::Custom,
                reason: "empty command".into(),
            };
        }
        for rule in &self.rules {
            if self.allow_out_of_scope && rule.kind.overridable() {
                continue;
            }
            if rule.matches(trimmed) {
                return Verdict::Deny {
                    rule: rule.name.clone(),
                    kind: rule.kind,
                    reason: format!("{} command (rule {})", rule.kind, rule.name),
                };
            }
        }
        Verdict::Allow
    }
}
