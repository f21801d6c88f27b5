use std::time::Duration;

use console::{Style, style};
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::{EventKind, EventSink, SessionEvent, SessionStatus};
use crate::utils::truncate_chars;

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }

    pub fn status_style(&self, status: SessionStatus) -> Style {
        match status {
            SessionStatus::Running => Style::new().yellow().bold(),
            SessionStatus::GoalReached => Style::new().green(),
            SessionStatus::StepLimitReached => Style::new().yellow(),
            SessionStatus::Failed => Style::new().red().bold(),
            SessionStatus::Cancelled => Style::new().dim().strikethrough(),
        }
    }

    /// Progress bar over the tasks of a batch.
    pub fn create_batch_progress(&self, total: usize) -> ProgressBar {
        let pb = ProgressBar::new(total as u64);
        if let Ok(template) =
            ProgressStyle::default_bar().template("{spinner:.cyan} [{bar:30.green/dim}] {pos}/{len} {msg}")
        {
            pb.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏").progress_chars("█░ "));
        }
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

/// Session events rendered onto a batch progress bar.
pub struct ProgressSink {
    bar: ProgressBar,
}

impl ProgressSink {
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EventSink for ProgressSink {
    fn emit(&self, event: &SessionEvent) {
        let task = &event.task_id;
        match &event.kind {
            EventKind::SessionStarted { target, .. } => {
                self.bar.set_message(format!("{} on {}", task, target));
            }
            EventKind::StepRecorded {
                step,
                fragment,
                commands,
                ..
            } => {
                let fragment = fragment.as_deref().unwrap_or("(no further step)");
                self.bar.set_message(format!(
                    "{} step {}: {} ({} cmd)",
                    task,
                    step,
                    truncate_chars(fragment, 40),
                    commands
                ));
            }
            EventKind::CommandRejected { command, reason, .. } => {
                self.bar.println(format!(
                    "{} {} rejected `{}`: {}",
                    style("!").yellow().bold(),
                    task,
                    truncate_chars(command, 60),
                    reason
                ));
            }
            EventKind::Compacted { report } => {
                self.bar.println(format!(
                    "{} {} context compacted {} -> {} ({:?})",
                    style("→").cyan(),
                    task,
                    report.size_before,
                    report.size_after,
                    report.method
                ));
            }
            EventKind::Terminated {
                status, findings, ..
            } => {
                let styled = Display::new().status_style(*status).apply_to(status.to_string());
                self.bar
                    .println(format!("{} {} ({} findings)", task, styled, findings));
                self.bar.inc(1);
            }
            EventKind::StateChanged { .. } => {}
        }
    }
}
