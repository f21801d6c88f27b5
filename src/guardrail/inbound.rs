//! Inbound check: command output is attacker-controlled text.
//!
//! Output is scanned for prompt-injection markers before it reaches a
//! reasoning capability. The sanitized copy has every match neutralized;
//! the raw output is kept untouched for the audit record.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PilotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for InjectionSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// How matched spans are rendered in the sanitized copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeutralizeMode {
    /// Keep the text visible but defanged, inside an `[untrusted: ...]` wrapper.
    #[default]
    Escape,
    /// Replace the span with a removal marker.
    Strip,
}

#[derive(Debug, Clone)]
pub struct InjectionPattern {
    pub name: String,
    pub regex: Regex,
    pub severity: InjectionSeverity,
}

impl InjectionPattern {
    pub fn new(name: &str, pattern: &str, severity: InjectionSeverity) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            PilotError::invalid_config(vec![format!(
                "injection pattern {:?} is not a valid regex: {}",
                pattern, e
            )])
        })?;
        Ok(Self {
            name: name.to_string(),
            regex,
            severity,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionMatch {
    pub pattern: String,
    pub severity: InjectionSeverity,
    pub matched_text: String,
}

/// Sanitized copy of one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    pub matches: Vec<InjectionMatch>,
}

impl Sanitized {
    pub fn is_clean(&self) -> bool {
        self.matches.is_empty()
    }
}

const BUILTIN_PATTERNS: &[(&str, &str, InjectionSeverity)] = &[
    (
        "instruction_override",
        r"(?i)ignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions|constraints|rules|directions)",
        InjectionSeverity::Critical,
    ),
    (
        "role_reassignment",
        r"(?i)you\s+are\s+now\s+(a|an|the|in)\s+",
        InjectionSeverity::Critical,
    ),
    (
        "context_dismissal",
        r"(?i)disregard\s+(all\s+)?(prior|previous|above|earlier)",
        InjectionSeverity::Critical,
    ),
    (
        "system_override",
        r"(?i)override\s+(your\s+)?(system|instructions|rules|guardrails?)",
        InjectionSeverity::Critical,
    ),
    (
        "new_instructions",
        r"(?i)(new|updated|revised)\s+instructions\s*:",
        InjectionSeverity::High,
    ),
    (
        "role_marker",
        r"(?im)^\s*(system|assistant|human|user)\s*:",
        InjectionSeverity::High,
    ),
    (
        "role_tag",
        r"(?i)</?\s*(system|assistant|user|instructions?)\s*>",
        InjectionSeverity::High,
    ),
    (
        "markdown_header_injection",
        r"(?i)#{2,}\s*(system|instruction|prompt)",
        InjectionSeverity::High,
    ),
    (
        "llama_format",
        r"(?i)\[/?INST\]|<</?SYS>>",
        InjectionSeverity::High,
    ),
    (
        "chatml_format",
        r"(?i)<\|(im_start|im_end|endoftext|system|user|assistant)\|>",
        InjectionSeverity::High,
    ),
    (
        "base64_override",
        r"aWdub3JlIHByZXZpb3Vz",
        InjectionSeverity::Medium,
    ),
    (
        "persona_manipulation",
        r"(?i)pretend\s+(you\s+are|to\s+be)",
        InjectionSeverity::Medium,
    ),
    (
        "memory_wipe",
        r"(?i)forget\s+(everything|all\s+(previous|prior)|what\s+you)",
        InjectionSeverity::Medium,
    ),
    (
        "goal_spoof",
        r"(?i)(the\s+)?goal\s+(has\s+been|is)\s+(reached|achieved|complete)",
        InjectionSeverity::Medium,
    ),
];

static BUILTIN: LazyLock<Vec<InjectionPattern>> = LazyLock::new(|| {
    BUILTIN_PATTERNS
        .iter()
        .map(|(name, pattern, severity)| {
            InjectionPattern::new(name, pattern, *severity).expect("built-in pattern compiles")
        })
        .collect()
});

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("ansi regex compiles")
});

static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex compiles"));

const REMOVED_MARKER: &str = "[removed: suspected injection]";
const WITHHELD_NOTICE: &str = "[output withheld: injection markers persisted after neutralization]";
const MAX_PASSES: usize = 3;

/// Scans and neutralizes injection markers in untrusted text.
#[derive(Debug, Clone)]
pub struct InjectionDetector {
    patterns: Vec<InjectionPattern>,
    mode: NeutralizeMode,
}

impl Default for InjectionDetector {
    fn default() -> Self {
        Self::new(NeutralizeMode::default())
    }
}

impl InjectionDetector {
    pub fn new(mode: NeutralizeMode) -> Self {
        Self {
            patterns: BUILTIN.clone(),
            mode,
        }
    }

    /// Built-in patterns plus extra regexes from configuration.
    pub fn with_extra_patterns(mode: NeutralizeMode, extra: &[String]) -> Result<Self> {
        let mut detector = Self::new(mode);
        for (i, pattern) in extra.iter().enumerate() {
            detector.patterns.push(InjectionPattern::new(
                &format!("custom_{}", i),
                pattern,
                InjectionSeverity::High,
            )?);
        }
        Ok(detector)
    }

    pub fn scan(&self, text: &str) -> Vec<InjectionMatch> {
        self.patterns
            .iter()
            .flat_map(|p| {
                p.regex.find_iter(text).map(|m| InjectionMatch {
                    pattern: p.name.clone(),
                    severity: p.severity,
                    matched_text: m.as_str().to_string(),
                })
            })
            .collect()
    }

    /// Sanitized copy of `raw`: terminal escapes and hidden comments dropped,
    /// injection markers neutralized.
    ///
    /// The returned text never matches any configured pattern.
    pub fn sanitize(&self, raw: &str) -> Sanitized {
        let cleaned = ANSI_ESCAPE.replace_all(raw, "");
        let cleaned = HTML_COMMENT.replace_all(&cleaned, "");
        let cleaned: String = cleaned
            .chars()
            .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
            .collect();

        let matches = self.scan(&cleaned);
        if matches.is_empty() {
            return Sanitized {
                text: cleaned,
                matches,
            };
        }

        let mut text = self.rewrite(&cleaned, self.mode);
        let mut passes = 1;
        while self.matches_any(&text) {
            if passes >= MAX_PASSES {
                text = WITHHELD_NOTICE.to_string();
                break;
            }
            text = self.rewrite(&text, NeutralizeMode::Strip);
            passes += 1;
        }

        Sanitized { text, matches }
    }

    fn matches_any(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.regex.is_match(text))
    }

    fn rewrite(&self, text: &str, mode: NeutralizeMode) -> String {
        let mut spans: Vec<(usize, usize)> = self
            .patterns
            .iter()
            .flat_map(|p| p.regex.find_iter(text).map(|m| (m.start(), m.end())))
            .collect();
        spans.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end) in merged {
            out.push_str(&text[cursor..start]);
            match mode {
                NeutralizeMode::Escape => {
                    out.push_str("[untrusted: ");
                    out.push_str(&defang(&text[start..end]));
                    out.push(']');
                }
                NeutralizeMode::Strip => out.push_str(REMOVED_MARKER),
            }
            cursor = end;
        }
        out.push_str(&text[cursor..]);
        out
    }
}

/// Break the token structure of a matched span while keeping it readable.
fn defang(span: &str) -> String {
    span.chars()
        .map(|c| match c {
            c if c.is_whitespace() => '_',
            '<' => '‹',
            '>' => '›',
            '|' => '¦',
            '[' => '(',
            ']' => ')',
            ':' => '˸',
            '#' => '♯',
            other => other,
        })
        .collect()
}
