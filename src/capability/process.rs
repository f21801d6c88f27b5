//! Capability served by an external program.
//!
//! The engine writes one JSON request to the program's stdin and reads the
//! reply from stdout. The reply may be JSON, fenced JSON, or plain text where
//! the role allows it. Timeouts and retries are applied by the caller; the
//! child is killed when the call is dropped.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
    ExtractionRequest, Extractor, Finding, Interpreter, PlanOutcome, PlanState, Planner,
    SummaryRequest, Summarizer, parse_commands, parse_findings, parse_plan, parse_summary,
    parse_verdict,
};
use crate::config::ProcessCommand;
use crate::context::ContextView;
use crate::error::{CapabilityRole, PilotError, Result};
use crate::utils::truncate_chars;

#[derive(Debug, Clone)]
pub struct ProcessCapability {
    command: ProcessCommand,
}

impl ProcessCapability {
    pub fn new(command: ProcessCommand) -> Self {
        Self { command }
    }

    async fn call(&self, role: CapabilityRole, request: serde_json::Value) -> Result<String> {
        let payload = serde_json::to_vec(&request)?;
        debug!(%role, program = %self.command.program, bytes = payload.len(), "Invoking capability process");

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PilotError::unavailable(role, format!("cannot start {}: {}", self.command.program, e))
            })?;

        // Feed stdin from its own task so a child that writes before it has
        // read the whole request cannot stall on a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let written = stdin.write_all(&payload).await;
                drop(stdin);
                written
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PilotError::unavailable(role, e.to_string()))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The child may answer without reading everything.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => {
                    return Err(PilotError::unavailable(
                        role,
                        format!("cannot write request: {}", e),
                    ));
                }
                Err(e) => {
                    return Err(PilotError::unavailable(
                        role,
                        format!("request writer failed: {}", e),
                    ));
                }
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PilotError::unavailable(
                role,
                format!(
                    "{} exited with {}: {}",
                    self.command.program,
                    output.status,
                    truncate_chars(stderr.trim(), 300)
                ),
            ));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| PilotError::malformed(role, "reply is not valid UTF-8"))
    }
}

#[async_trait]
impl Planner for ProcessCapability {
    async fn plan(&self, goal: &str, context: &ContextView, plan: &PlanState) -> Result<PlanOutcome> {
        let reply = self
            .call(
                CapabilityRole::Planner,
                json!({
                    "role": "planner",
                    "operation": "plan",
                    "goal": goal,
                    "context": context,
                    "plan": plan,
                }),
            )
            .await?;
        parse_plan(&reply, plan)
    }

    async fn verify_goal(&self, goal: &str, context: &ContextView) -> Result<bool> {
        let reply = self
            .call(
                CapabilityRole::GoalVerifier,
                json!({
                    "role": "planner",
                    "operation": "verify_goal",
                    "goal": goal,
                    "context": context,
                }),
            )
            .await?;
        parse_verdict(&reply)
    }
}

#[async_trait]
impl Interpreter for ProcessCapability {
    async fn interpret(&self, fragment: &str, context: &ContextView) -> Result<Vec<String>> {
        let reply = self
            .call(
                CapabilityRole::Interpreter,
                json!({
                    "role": "interpreter",
                    "operation": "interpret",
                    "fragment": fragment,
                    "context": context,
                }),
            )
            .await?;
        parse_commands(&reply)
    }
}

#[async_trait]
impl Summarizer for ProcessCapability {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        let reply = self
            .call(
                CapabilityRole::Summarizer,
                json!({
                    "role": "summarizer",
                    "operation": "summarize",
                    "request": request,
                }),
            )
            .await?;
        parse_summary(&reply)
    }
}

#[async_trait]
impl Extractor for ProcessCapability {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<Vec<Finding>> {
        let reply = self
            .call(
                CapabilityRole::Extractor,
                json!({
                    "role": "extractor",
                    "operation": "extract",
                    "goal": request.goal,
                    "target": request.target,
                    "termination": request.reason,
                    "transcript": request.window.render_audit(),
                    "entries": request.window.entries(),
                }),
            )
            .await?;
        parse_findings(&reply)
    }
}
