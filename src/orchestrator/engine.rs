use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::events::{EventKind, EventSink, NullSink, SessionEvent};
use super::report::SessionReport;
use super::signal::CancelHandle;
use super::state::{EngineState, SessionStatus};
use crate::capability::{
    Capabilities, ExtractionRequest, Finding, PlanState, RetryPolicy, TerminationReason,
};
use crate::channel::{ChannelConnector, ReconnectingChannel, RemoteChannel};
use crate::config::{EffectiveSettings, RedpilotConfig};
use crate::context::{
    CommandOutcome, CommandRecord, CompactionReport, CompactionSettings, ContextCompressor,
    ContextWindow, Step,
};
use crate::error::{CapabilityRole, PilotError, Result};
use crate::guardrail::Guardrail;

/// Drives attack sessions: plan, interpret, execute, observe, compact,
/// verify, until the goal is reached or the step budget runs out.
///
/// One orchestrator can run many sessions, concurrently if the caller wants;
/// sessions share nothing mutable. Inside a session everything is sequential.
pub struct AttackOrchestrator {
    config: Arc<RedpilotConfig>,
    capabilities: Capabilities,
    connector: Arc<dyn ChannelConnector>,
    events: Arc<dyn EventSink>,
}

impl AttackOrchestrator {
    pub fn new(
        config: Arc<RedpilotConfig>,
        capabilities: Capabilities,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        Self {
            config,
            capabilities,
            connector,
            events: Arc::new(NullSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RedpilotConfig {
        &self.config
    }

    /// Run one session to a terminal state.
    ///
    /// Only a guardrail that cannot be built fails the call; every runtime
    /// failure ends the session as `failed` with findings still extracted.
    pub async fn run(
        &self,
        settings: &EffectiveSettings,
        cancel: &CancelHandle,
    ) -> Result<SessionReport> {
        let guardrail = Guardrail::from_config(&self.config.guardrail, &settings.scope)?;
        let policy = RetryPolicy::from(&self.config.capabilities);
        let summarizer = if settings.summarizer_enabled {
            self.capabilities.summarizer.clone()
        } else {
            None
        };
        let compressor = ContextCompressor::new(
            summarizer,
            policy,
            CompactionSettings::new(settings.context_budget, &self.config.engine),
        );

        let mut session = Session {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            settings,
            target: settings.target.to_string(),
            capabilities: &self.capabilities,
            policy,
            guardrail,
            compressor,
            events: self.events.as_ref(),
            cancel,
            state: EngineState::Init,
            window: ContextWindow::new(),
            plan: PlanState::default(),
            compactions: Vec::new(),
        };
        let started_at = Utc::now();
        let clock = Instant::now();

        info!(
            session = %session.id,
            task = %settings.task_id,
            target = %session.target,
            step_budget = settings.step_budget,
            "Starting attack session"
        );
        session.emit(EventKind::SessionStarted {
            target: session.target.clone(),
            goal: settings.goal.clone(),
            step_budget: settings.step_budget,
        });

        let reason = match self.open_channel(settings, cancel).await {
            Ok(channel) => {
                let reason = session
                    .drive(&channel)
                    .await
                    .unwrap_or_else(|e| TerminationReason::Fatal {
                        message: e.to_string(),
                    });
                channel.close().await;
                reason
            }
            Err(PilotError::Cancelled) => TerminationReason::Cancelled,
            Err(e) => {
                error!(session = %session.id, target = %session.target, error = %e, "Cannot open channel");
                TerminationReason::Fatal {
                    message: e.to_string(),
                }
            }
        };

        Ok(session.finish(reason, started_at, clock).await)
    }

    async fn open_channel(
        &self,
        settings: &EffectiveSettings,
        cancel: &CancelHandle,
    ) -> Result<ReconnectingChannel> {
        let policy = RetryPolicy::from(&self.config.channel);
        tokio::select! {
            _ = cancel.cancelled() => Err(PilotError::Cancelled),
            channel = ReconnectingChannel::establish(
                self.connector.clone(),
                settings.target.clone(),
                policy,
            ) => channel,
        }
    }
}

/// State owned by one running session.
struct Session<'a> {
    id: String,
    settings: &'a EffectiveSettings,
    target: String,
    capabilities: &'a Capabilities,
    policy: RetryPolicy,
    guardrail: Guardrail,
    compressor: ContextCompressor,
    events: &'a dyn EventSink,
    cancel: &'a CancelHandle,
    state: EngineState,
    window: ContextWindow,
    plan: PlanState,
    compactions: Vec<CompactionReport>,
}

impl Session<'_> {
    fn emit(&self, kind: EventKind) {
        self.events
            .emit(&SessionEvent::new(&self.id, &self.settings.task_id, kind));
    }

    fn transition(&mut self, to: EngineState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            error!(
                session = %self.id,
                from = %self.state,
                to = %to,
                allowed = ?self.state.allowed_transitions(),
                "Invalid state transition attempted"
            );
            return Err(PilotError::InvalidState {
                expected: format!("one of {:?}", self.state.allowed_transitions()),
                actual: format!("{} -> {}", self.state, to),
            });
        }
        debug!(session = %self.id, from = %self.state, to = %to, "State transition");
        let from = self.state;
        self.state = to;
        self.emit(EventKind::StateChanged { from, to });
        Ok(())
    }

    async fn drive(&mut self, channel: &dyn RemoteChannel) -> Result<TerminationReason> {
        let settings = self.settings;
        let capabilities = self.capabilities;
        let cancel = self.cancel;
        let goal = settings.goal.as_str();
        let budget = settings.step_budget;

        loop {
            if cancel.is_cancelled() {
                return Ok(TerminationReason::Cancelled);
            }
            let index = self.window.next_index();

            self.transition(EngineState::Plan)?;
            let view = self.window.view(&self.target, budget);
            let planned = tokio::select! {
                _ = cancel.cancelled() => return Ok(TerminationReason::Cancelled),
                result = self.policy.run(CapabilityRole::Planner, || {
                    capabilities.planner.plan(goal, &view, &self.plan)
                }) => result,
            };
            let outcome = match planned {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(session = %self.id, step = index, error = %e, "Planner unavailable");
                    return Ok(TerminationReason::Fatal {
                        message: e.to_string(),
                    });
                }
            };
            self.plan = outcome.plan;

            let mut step = Step::new(index, outcome.fragment.clone());
            let mut exit = None;
            match outcome.fragment {
                None => {
                    debug!(session = %self.id, step = index, "Planner has no further step");
                    step.note = Some("planner reported no further step".into());
                }
                Some(fragment) => {
                    self.transition(EngineState::Interpret)?;
                    let interpreted = tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = self.policy.run(CapabilityRole::Interpreter, || {
                            capabilities.interpreter.interpret(&fragment, &view)
                        }) => Some(result),
                    };
                    match interpreted {
                        None => {
                            step.note = Some("cancelled before commands were produced".into());
                            exit = Some(TerminationReason::Cancelled);
                        }
                        Some(Err(e)) => {
                            error!(session = %self.id, step = index, error = %e, "Interpreter unavailable");
                            step.note = Some(format!("interpreter failed: {}", e));
                            exit = Some(TerminationReason::Fatal {
                                message: e.to_string(),
                            });
                        }
                        Some(Ok(commands)) if commands.is_empty() => {
                            debug!(session = %self.id, step = index, "Interpreter returned no commands");
                            step.note = Some("interpreter returned no commands".into());
                        }
                        Some(Ok(commands)) => {
                            self.transition(EngineState::Execute)?;
                            exit = self.execute(channel, &commands, &mut step).await;
                        }
                    }
                }
            }

            self.transition(EngineState::Observe)?;
            self.record(step)?;
            if let Some(reason) = exit {
                return Ok(reason);
            }

            if self.compressor.needs_compaction(&self.window) {
                self.transition(EngineState::Compact)?;
                let compacted = tokio::select! {
                    _ = cancel.cancelled() => return Ok(TerminationReason::Cancelled),
                    report = self.compressor.compact(goal, &mut self.window) => report,
                };
                if let Some(report) = compacted {
                    self.emit(EventKind::Compacted {
                        report: report.clone(),
                    });
                    self.compactions.push(report);
                }
            }

            self.transition(EngineState::GoalCheck)?;
            let view = self.window.view(&self.target, budget);
            let verified = tokio::select! {
                _ = cancel.cancelled() => return Ok(TerminationReason::Cancelled),
                result = self.policy.run(CapabilityRole::GoalVerifier, || {
                    capabilities.planner.verify_goal(goal, &view)
                }) => result,
            };
            match verified {
                Ok(true) => return Ok(TerminationReason::GoalReached),
                Ok(false) if self.window.step_count() >= budget => {
                    return Ok(TerminationReason::StepLimit { steps: budget });
                }
                Ok(false) => {}
                Err(e) => {
                    error!(session = %self.id, error = %e, "Goal verification unavailable");
                    return Ok(TerminationReason::Fatal {
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Run one step's commands in order. Returns a termination reason when the
    /// session must stop after this step.
    async fn execute(
        &self,
        channel: &dyn RemoteChannel,
        commands: &[String],
        step: &mut Step,
    ) -> Option<TerminationReason> {
        let timeout = self.settings.command_timeout();

        for (position, command) in commands.iter().enumerate() {
            let verdict = self.guardrail.check_command(command);
            if let Some(record) = CommandRecord::rejected(command.as_str(), verdict) {
                if let CommandOutcome::Rejected { reason, .. } = &record.outcome {
                    warn!(session = %self.id, step = step.index, command = %command, reason = %reason, "Command rejected");
                    self.emit(EventKind::CommandRejected {
                        step: step.index,
                        command: command.clone(),
                        reason: reason.clone(),
                    });
                }
                step.commands.push(record);
                continue;
            }

            debug!(session = %self.id, step = step.index, command = %command, "Executing command");
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = channel.run(command, timeout) => Some(result),
            };
            match result {
                None => {
                    info!(session = %self.id, step = step.index, "Discarding in-flight command on cancellation");
                    step.commands.extend(
                        commands[position..]
                            .iter()
                            .map(|c| CommandRecord::cancelled(c.as_str())),
                    );
                    return Some(TerminationReason::Cancelled);
                }
                Some(Ok(output)) => {
                    let stdout = self.guardrail.sanitize_output(&output.stdout);
                    let stderr = self.guardrail.sanitize_output(&output.stderr);
                    if !stdout.is_clean() || !stderr.is_clean() {
                        warn!(
                            session = %self.id,
                            step = step.index,
                            command = %command,
                            matches = stdout.matches.len() + stderr.matches.len(),
                            "Neutralized suspected injection in command output"
                        );
                    }
                    if output.timed_out {
                        warn!(session = %self.id, step = step.index, command = %command, "Command timed out");
                    }
                    step.commands.push(CommandRecord::executed(
                        command.as_str(),
                        output,
                        stdout,
                        stderr,
                    ));
                }
                Some(Err(e)) => {
                    error!(session = %self.id, step = step.index, command = %command, error = %e, "Channel failed");
                    step.commands.push(CommandRecord::failed(command.as_str(), &e));
                    let skipped = commands.len() - position - 1;
                    if skipped > 0 {
                        step.note = Some(format!(
                            "{} remaining commands skipped after channel failure",
                            skipped
                        ));
                    }
                    return Some(TerminationReason::Fatal {
                        message: e.to_string(),
                    });
                }
            }
        }

        if step.is_rejected() {
            step.note = Some("every command was rejected by the guardrail".into());
        }
        None
    }

    fn record(&mut self, step: Step) -> Result<()> {
        let rejected = step.commands.iter().filter(|c| c.is_rejected()).count();
        let injections = step
            .commands
            .iter()
            .map(CommandRecord::injection_count)
            .sum();
        info!(
            session = %self.id,
            step = step.index,
            commands = step.commands.len(),
            rejected,
            injections,
            "Step recorded"
        );
        let kind = EventKind::StepRecorded {
            step: step.index,
            fragment: step.fragment.clone(),
            commands: step.commands.len(),
            rejected,
            injections,
        };
        self.window.append(step)?;
        self.emit(kind);
        Ok(())
    }

    async fn extract(&self, reason: &TerminationReason) -> (Vec<Finding>, Option<String>) {
        let extractor = &self.capabilities.extractor;
        let request = ExtractionRequest {
            goal: &self.settings.goal,
            target: &self.target,
            window: &self.window,
            reason,
        };
        match self
            .policy
            .run(CapabilityRole::Extractor, || extractor.extract(request))
            .await
        {
            Ok(findings) => (findings, None),
            Err(e) => {
                error!(session = %self.id, error = %e, "Extractor failed, no findings recorded");
                (Vec::new(), Some(e.to_string()))
            }
        }
    }

    async fn finish(
        mut self,
        reason: TerminationReason,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> SessionReport {
        let terminal = EngineState::terminal_for(&reason);
        if self.transition(terminal).is_err() {
            self.state = terminal;
        }

        let (findings, extraction_error) = self.extract(&reason).await;
        let status = SessionStatus::from(&reason);
        let steps_taken = self.window.step_count();

        info!(
            session = %self.id,
            task = %self.settings.task_id,
            status = %status,
            reason = %reason,
            steps = steps_taken,
            findings = findings.len(),
            "Attack session finished"
        );
        self.emit(EventKind::Terminated {
            status,
            reason: reason.to_string(),
            steps: steps_taken,
            findings: findings.len(),
        });

        SessionReport {
            session_id: self.id,
            task_id: self.settings.task_id.clone(),
            name: self.settings.name.clone(),
            category: self.settings.category.clone(),
            goal: self.settings.goal.clone(),
            target: self.target,
            status,
            reason,
            steps_taken,
            step_budget: self.settings.step_budget,
            findings,
            extraction_error,
            compactions: self.compactions,
            plan: self.plan,
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            context: self.window,
        }
    }
}
