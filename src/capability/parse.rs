//! Tolerant parsing of capability replies.
//!
//! Reasoning engines wrap JSON in code fences, prefix commands with shell
//! prompts, or answer in prose. These parsers accept the common shapes and
//! report anything else as a malformed (and therefore retryable) response.

use serde_json::Value;

use super::{Finding, PlanOutcome, PlanState, Severity, SubGoal};
use crate::error::{CapabilityRole, PilotError, Result};

/// Find a JSON document in free text.
///
/// Tries, in order: a ```json fence, any ``` fence, the whole text, and the
/// outermost `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(body) = fenced_block(trimmed, "```json") {
        candidates.push(body);
    }
    if let Some(body) = fenced_block(trimmed, "```") {
        candidates.push(body);
    }
    candidates.push(trimmed);
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && start < end
        {
            candidates.push(&trimmed[start..=end]);
        }
    }
    candidates
        .into_iter()
        .find_map(|c| serde_json::from_str::<Value>(c.trim()).ok())
        .filter(|v| v.is_object() || v.is_array())
}

fn fenced_block<'a>(text: &'a str, fence: &str) -> Option<&'a str> {
    let start = text.find(fence)? + fence.len();
    let rest = &text[start..];
    // Skip a language tag on the fence line.
    let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
    let rest = &rest[body_start..];
    let end = rest.find("```").unwrap_or(rest.len());
    Some(&rest[..end])
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn bool_like(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => word_verdict(s),
        _ => None,
    }
}

fn word_verdict(text: &str) -> Option<bool> {
    let first = text
        .trim()
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .split(|c: char| !c.is_alphanumeric())
        .next()?
        .to_ascii_lowercase();
    match first.as_str() {
        "yes" | "true" | "reached" | "achieved" => Some(true),
        "no" | "false" | "not" => Some(false),
        _ => None,
    }
}

/// Planner reply: `{"steps": [...], "goal_verification": "...", "goal_reached": bool}`,
/// optionally with `fragment`/`next_step` and `active`.
///
/// Steps may be plain strings or `{description, verification, done}` objects.
/// Without an explicit fragment the first open sub-goal becomes the next step.
pub fn parse_plan(text: &str, prior: &PlanState) -> Result<PlanOutcome> {
    let role = CapabilityRole::Planner;
    let value = extract_json(text).ok_or_else(|| PilotError::malformed(role, "no JSON object in reply"))?;

    let default_verification = str_field(&value, &["goal_verification", "verification"])
        .unwrap_or_default()
        .to_string();

    let plan = match value.get("steps").or_else(|| value.get("sub_goals")) {
        Some(Value::Array(items)) => {
            let mut sub_goals = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) if !s.trim().is_empty() => sub_goals.push(SubGoal {
                        description: s.trim().to_string(),
                        verification: default_verification.clone(),
                        done: false,
                    }),
                    Value::Object(_) => {
                        let Some(description) = str_field(item, &["description", "step", "goal"])
                        else {
                            continue;
                        };
                        sub_goals.push(SubGoal {
                            description: description.to_string(),
                            verification: str_field(item, &["verification", "criterion"])
                                .map(str::to_string)
                                .unwrap_or_else(|| default_verification.clone()),
                            done: item.get("done").and_then(bool_like).unwrap_or(false),
                        });
                    }
                    _ => {}
                }
            }
            let active = value
                .get("active")
                .and_then(Value::as_u64)
                .map(|i| i as usize)
                .filter(|i| *i < sub_goals.len());
            PlanState { sub_goals, active }
        }
        Some(_) => return Err(PilotError::malformed(role, "'steps' must be a list")),
        None => prior.clone(),
    };

    let goal_reached = value
        .get("goal_reached")
        .and_then(bool_like)
        .unwrap_or(false);

    let explicit = ["fragment", "next_step"]
        .iter()
        .find_map(|k| value.get(*k));
    let fragment = match explicit {
        Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => return Err(PilotError::malformed(role, "'fragment' must be a string or null")),
        None if goal_reached => None,
        None => {
            let open = plan
                .active_sub_goal()
                .filter(|g| !g.done)
                .or_else(|| plan.next_open().map(|(_, g)| g));
            match open {
                Some(goal) => Some(goal.description.clone()),
                None if plan.is_empty() => {
                    return Err(PilotError::malformed(role, "reply has neither steps nor a fragment"));
                }
                None => None,
            }
        }
    };

    let mut plan = plan;
    if plan.active.is_none() {
        plan.active = plan.next_open().map(|(i, _)| i);
    }
    Ok(PlanOutcome { fragment, plan })
}

/// Goal-check reply: JSON with `goal_reached`/`reached`/`verdict`, or prose
/// starting with yes/no.
pub fn parse_verdict(text: &str) -> Result<bool> {
    if let Some(value) = extract_json(text) {
        for key in ["goal_reached", "reached", "verdict", "result"] {
            if let Some(b) = value.get(key).and_then(bool_like) {
                return Ok(b);
            }
        }
    }
    word_verdict(text).ok_or_else(|| {
        PilotError::malformed(CapabilityRole::GoalVerifier, "reply is not a yes/no verdict")
    })
}

/// Split interpreter text into commands.
///
/// Drops code fences, blank and comment lines, `$ ` prompts, and quotes
/// wrapping a whole line.
pub fn clean_commands(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("```"))
        .map(|line| line.strip_prefix("$ ").unwrap_or(line).trim())
        .map(strip_wrapping_quotes)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn strip_wrapping_quotes(line: &str) -> &str {
    for quote in ['`', '"', '\''] {
        if line.len() >= 2 && line.starts_with(quote) && line.ends_with(quote) {
            let inner = &line[1..line.len() - 1];
            if !inner.contains(quote) {
                return inner.trim();
            }
        }
    }
    line
}

/// Interpreter reply: `{"commands": [...]}`, a JSON array, or plain text.
pub fn parse_commands(text: &str) -> Result<Vec<String>> {
    let list = match extract_json(text) {
        Some(Value::Array(items)) if !items.is_empty() && items.iter().all(Value::is_string) => {
            Some(items)
        }
        Some(Value::Object(map)) => match map.get("commands") {
            Some(Value::Array(items)) => Some(items.clone()),
            Some(_) => {
                return Err(PilotError::malformed(
                    CapabilityRole::Interpreter,
                    "'commands' must be a list",
                ));
            }
            None => None,
        },
        _ => None,
    };
    match list {
        Some(items) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .flat_map(clean_commands)
            .collect()),
        None => Ok(clean_commands(text)),
    }
}

/// Summarizer reply: `{"summary": "..."}` or plain text.
pub fn parse_summary(text: &str) -> Result<String> {
    let summary = extract_json(text)
        .as_ref()
        .and_then(|v| str_field(v, &["summary", "text"]).map(str::to_string))
        .unwrap_or_else(|| text.trim().to_string());
    if summary.is_empty() {
        return Err(PilotError::malformed(CapabilityRole::Summarizer, "empty summary"));
    }
    Ok(summary)
}

/// Extractor reply: `{"vulnerabilities" | "findings": [...]}` or a bare list.
pub fn parse_findings(text: &str) -> Result<Vec<Finding>> {
    let role = CapabilityRole::Extractor;
    let value = extract_json(text).ok_or_else(|| PilotError::malformed(role, "no JSON in reply"))?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(_) => match value.get("findings").or_else(|| value.get("vulnerabilities")) {
            Some(Value::Array(items)) => items,
            _ => return Err(PilotError::malformed(role, "missing 'findings' list")),
        },
        _ => return Err(PilotError::malformed(role, "unexpected JSON shape")),
    };

    Ok(items
        .iter()
        .filter_map(|item| {
            let description = str_field(item, &["description", "title", "summary"])?;
            let evidence_step = ["evidence_step", "step", "evidence"]
                .iter()
                .find_map(|k| item.get(*k).and_then(Value::as_u64))
                .map(|n| n as u32);
            Some(Finding {
                category: str_field(item, &["category", "type"])
                    .unwrap_or("vulnerability")
                    .to_ascii_lowercase(),
                description: description.to_string(),
                evidence_step,
                evidence: str_field(item, &["evidence"]).unwrap_or_default().to_string(),
                severity: str_field(item, &["severity"])
                    .and_then(|s| s.parse::<Severity>().ok())
                    .unwrap_or_default(),
                remediation: str_field(item, &["remediation", "recommendation"])
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect())
}
