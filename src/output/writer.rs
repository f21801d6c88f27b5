use std::io::{self, Write};

use serde::Serialize;

use crate::cli::OutputFormat;
use crate::config::EffectiveSettings;
use crate::guardrail::Verdict;
use crate::orchestrator::{BatchPlan, BatchSummary, EventSink, SessionEvent, SessionReport};
use crate::utils::truncate_at_boundary;

/// Writes command results in the selected format.
///
/// - Text: human-readable tables (default)
/// - Json: one JSON document at completion
/// - Stream: NDJSON, session events as they happen followed by the result
pub struct OutputWriter {
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn emit_batch(&self, summary: &BatchSummary) {
        match self.format {
            OutputFormat::Text => self.print_batch(summary),
            OutputFormat::Json | OutputFormat::Stream => self.write_json(summary),
        }
    }

    pub fn emit_plan(&self, plan: &BatchPlan) {
        match self.format {
            OutputFormat::Text => self.print_plan(plan),
            OutputFormat::Json | OutputFormat::Stream => {
                let waves: Vec<Vec<&EffectiveSettings>> =
                    plan.waves.iter().map(|w| w.iter().collect()).collect();
                self.write_json(&PlanOutput {
                    task_count: plan.task_count(),
                    waves,
                });
            }
        }
    }

    pub fn emit_verdict(&self, command: &str, verdict: &Verdict) {
        match self.format {
            OutputFormat::Text => match verdict {
                Verdict::Allow => println!("allowed: {}", command),
                Verdict::Deny { reason, .. } => println!("denied: {} ({})", command, reason),
            },
            OutputFormat::Json | OutputFormat::Stream => self.write_json(&VerdictOutput {
                command,
                verdict,
            }),
        }
    }

    pub fn emit_message(&self, message: &str) {
        match self.format {
            OutputFormat::Text => println!("{}", message),
            OutputFormat::Json | OutputFormat::Stream => self.write_json(&MessageOutput {
                message: message.to_string(),
            }),
        }
    }

    fn write_json<T: Serialize>(&self, value: &T) {
        write_json_line(value);
    }

    fn print_batch(&self, summary: &BatchSummary) {
        println!();
        println!(
            "{:<16} {:<20} {:<20} {:>7} {:>9}",
            "Task", "Category", "Status", "Steps", "Findings"
        );
        println!("{}", "-".repeat(76));
        for session in &summary.sessions {
            println!(
                "{:<16} {:<20} {:<20} {:>7} {:>9}",
                truncate_at_boundary(&session.task_id, 15),
                truncate_at_boundary(&session.category, 19),
                session.status.to_string(),
                format!("{}/{}", session.steps_taken, session.step_budget),
                session.findings.len()
            );
        }

        println!();
        println!(
            "Completed {}/{} tasks ({:.1}%), {} findings in {:.1}s",
            summary.completed_tasks,
            summary.total_tasks,
            summary.completion_rate,
            summary.total_findings,
            summary.duration_secs
        );
        for (category, stats) in &summary.categories {
            println!(
                "  {}: {}/{} completed, {} findings",
                category, stats.completed, stats.total, stats.findings
            );
        }

        for session in &summary.sessions {
            self.print_findings(session);
        }
    }

    fn print_findings(&self, session: &SessionReport) {
        if session.findings.is_empty() && session.extraction_error.is_none() {
            return;
        }
        println!();
        println!("Findings for {} ({}):", session.task_id, session.reason);
        for finding in &session.findings {
            let step = finding
                .evidence_step
                .map(|s| format!(" [step {}]", s))
                .unwrap_or_default();
            println!(
                "  [{}] {}: {}{}",
                finding.severity, finding.category, finding.description, step
            );
            if !finding.remediation.is_empty() {
                println!("      fix: {}", finding.remediation);
            }
        }
        if let Some(error) = &session.extraction_error {
            println!("  extraction failed: {}", error);
        }
    }

    fn print_plan(&self, plan: &BatchPlan) {
        println!();
        println!("{} task(s) in {} wave(s)", plan.task_count(), plan.waves.len());
        for (index, wave) in plan.waves.iter().enumerate() {
            println!();
            println!("Wave {}:", index + 1);
            for settings in wave {
                println!("  {} - {}", settings.task_id, settings.name);
                println!("      target:     {} ({})", settings.target, settings.target.credential);
                println!(
                    "      budget:     {} steps, context {}, timeout {}s",
                    settings.step_budget, settings.context_budget, settings.command_timeout_secs
                );
                println!(
                    "      summarizer: {}",
                    if settings.summarizer_enabled { "on" } else { "off" }
                );
                if !settings.scope.excluded_patterns.is_empty() {
                    println!("      excluded:   {}", settings.scope.excluded_patterns.join(", "));
                }
                if settings.scope.allow_out_of_scope {
                    println!("      out-of-scope override acknowledged");
                }
            }
        }
    }
}

/// NDJSON event stream on stdout, used with `--output stream`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamSink;

impl EventSink for StreamSink {
    fn emit(&self, event: &SessionEvent) {
        write_json_line(event);
    }
}

fn write_json_line<T: Serialize + ?Sized>(value: &T) {
    if let Ok(json) = serde_json::to_string(value) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", json);
        let _ = stdout.flush();
    }
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    task_count: usize,
    waves: Vec<Vec<&'a EffectiveSettings>>,
}

#[derive(Serialize)]
struct VerdictOutput<'a> {
    command: &'a str,
    #[serde(flatten)]
    verdict: &'a Verdict,
}

#[derive(Serialize)]
struct MessageOutput {
    message: String,
}
