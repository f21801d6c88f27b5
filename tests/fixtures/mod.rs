//! Scripted capability and channel doubles for engine tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use redpilot::capability::{
    Capabilities, ExtractionRequest, Extractor, Finding, Interpreter, PlanOutcome, PlanState,
    Planner, Severity, Summarizer, SummaryRequest,
};
use redpilot::channel::{ChannelConnector, CommandOutput, RemoteChannel};
use redpilot::config::{
    CredentialRef, EffectiveScope, EffectiveSettings, RedpilotConfig, TargetDescriptor,
};
use redpilot::context::ContextView;
use redpilot::error::{CapabilityRole, ChannelError, PilotError, Result};

/// Engine config with millisecond backoffs so failure paths stay fast.
pub fn fast_config() -> RedpilotConfig {
    let mut config = RedpilotConfig::default();
    config.capabilities.initial_backoff_ms = 1;
    config.capabilities.max_backoff_ms = 2;
    config.capabilities.timeout_secs = 5;
    config.channel.reconnect_backoff_ms = 1;
    config
}

pub fn target() -> TargetDescriptor {
    TargetDescriptor {
        host: "10.0.0.5".into(),
        port: 22,
        username: "root".into(),
        credential: CredentialRef::Password {
            env: "REDPILOT_TEST_PASSWORD".into(),
        },
        host_key_fingerprint: None,
    }
}

pub fn settings(task_id: &str, goal: &str, step_budget: u32) -> EffectiveSettings {
    EffectiveSettings {
        task_id: task_id.into(),
        name: format!("Task {}", task_id),
        goal: goal.into(),
        category: "recon".into(),
        target: target(),
        step_budget,
        context_budget: 16_000,
        summarizer_enabled: true,
        command_timeout_secs: 5,
        scope: EffectiveScope::default(),
    }
}

// -- Planner ------------------------------------------------------------------

pub struct ScriptedPlanner {
    fragments: Mutex<VecDeque<Option<String>>>,
    default_fragment: Option<String>,
    verdicts: Mutex<VecDeque<bool>>,
    fail: AtomicBool,
    pub plan_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub views: Mutex<Vec<ContextView>>,
}

impl ScriptedPlanner {
    /// Always plans `fragment` and never declares the goal reached.
    pub fn repeating(fragment: &str) -> Self {
        Self {
            fragments: Mutex::new(VecDeque::new()),
            default_fragment: Some(fragment.to_string()),
            verdicts: Mutex::new(VecDeque::new()),
            fail: AtomicBool::new(false),
            plan_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            views: Mutex::new(Vec::new()),
        }
    }

    /// Goal verdicts per `verify_goal` call; `false` once exhausted.
    pub fn with_verdicts(self, verdicts: &[bool]) -> Self {
        *self.verdicts.lock() = verdicts.iter().copied().collect();
        self
    }

    /// Scripted fragments per `plan` call; the default once exhausted.
    pub fn with_fragments(self, fragments: Vec<Option<&str>>) -> Self {
        *self.fragments.lock() = fragments
            .into_iter()
            .map(|f| f.map(str::to_string))
            .collect();
        self
    }

    pub fn failing() -> Self {
        let planner = Self::repeating("unused");
        planner.fail.store(true, Ordering::SeqCst);
        planner
    }

    pub fn plan_count(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn verify_count(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _goal: &str, context: &ContextView, plan: &PlanState) -> Result<PlanOutcome> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        self.views.lock().push(context.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(PilotError::unavailable(CapabilityRole::Planner, "planner offline"));
        }
        let fragment = self
            .fragments
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_fragment.clone());
        Ok(match fragment {
            Some(fragment) => PlanOutcome::step(fragment, plan.clone()),
            None => PlanOutcome::finished(plan.clone()),
        })
    }

    async fn verify_goal(&self, _goal: &str, context: &ContextView) -> Result<bool> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        self.views.lock().push(context.clone());
        Ok(self.verdicts.lock().pop_front().unwrap_or(false))
    }
}

// -- Interpreter --------------------------------------------------------------

pub struct ScriptedInterpreter {
    commands: Vec<String>,
    fail: bool,
    pub calls: AtomicUsize,
}

impl ScriptedInterpreter {
    pub fn always(commands: &[&str]) -> Self {
        Self {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            commands: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn interpret(&self, _fragment: &str, _context: &ContextView) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PilotError::unavailable(
                CapabilityRole::Interpreter,
                "interpreter offline",
            ));
        }
        Ok(self.commands.clone())
    }
}

// -- Summarizer ---------------------------------------------------------------

pub struct ScriptedSummarizer {
    response: Option<String>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<SummaryRequest>>,
}

impl ScriptedSummarizer {
    pub fn replying(text: &str) -> Self {
        Self {
            response: Some(text.to_string()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            response: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        self.response
            .clone()
            .ok_or_else(|| PilotError::unavailable(CapabilityRole::Summarizer, "summarizer offline"))
    }
}

// -- Extractor ----------------------------------------------------------------

#[derive(Default)]
pub struct RecordingExtractor {
    fail: bool,
    pub calls: AtomicUsize,
    /// Step count of the window seen on each call.
    pub seen_steps: Mutex<Vec<u32>>,
    pub audits: Mutex<Vec<String>>,
}

impl RecordingExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for RecordingExtractor {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<Vec<Finding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_steps.lock().push(request.window.step_count());
        self.audits.lock().push(request.window.render_audit());
        if self.fail {
            return Err(PilotError::unavailable(CapabilityRole::Extractor, "extractor offline"));
        }
        if request.window.step_count() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Finding {
            category: "credential exposure".into(),
            description: "world-readable backup of /etc/shadow".into(),
            evidence_step: Some(0),
            evidence: "-rw-r--r-- 1 root root /var/backups/shadow.bak".into(),
            severity: Severity::High,
            remediation: "restrict permissions on /var/backups".into(),
        }])
    }
}

// -- Channel ------------------------------------------------------------------

type Responder = dyn Fn(&str) -> Result<CommandOutput> + Send + Sync;

/// Shared record of what reached the remote side.
#[derive(Default)]
pub struct ChannelLog {
    pub commands: Mutex<Vec<String>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl ChannelLog {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

pub fn output(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        exit_status: Some(0),
        duration: Duration::from_millis(3),
        ..Default::default()
    }
}

pub struct MockChannel {
    log: Arc<ChannelLog>,
    responder: Arc<Responder>,
    delay: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed.into());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.commands.lock().push(command.to_string());
        (self.responder)(command)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockConnector {
    pub log: Arc<ChannelLog>,
    responder: Arc<Responder>,
    delay: Duration,
    /// Connect attempts that fail with a transient error before one succeeds.
    transient_failures: AtomicUsize,
    reject_auth: bool,
}

impl MockConnector {
    /// Every command succeeds with `stdout`.
    pub fn answering(stdout: &str) -> Self {
        let stdout = stdout.to_string();
        Self::with_responder(move |_| Ok(output(&stdout)))
    }

    pub fn with_responder(
        responder: impl Fn(&str) -> Result<CommandOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            log: Arc::new(ChannelLog::default()),
            responder: Arc::new(responder),
            delay: Duration::ZERO,
            transient_failures: AtomicUsize::new(0),
            reject_auth: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_connects(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn rejecting_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteChannel>> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth {
            return Err(ChannelError::Authentication {
                address: target.address(),
                username: target.username.clone(),
            }
            .into());
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ChannelError::Connect {
                address: target.address(),
                message: "connection refused".into(),
            }
            .into());
        }
        Ok(Box::new(MockChannel {
            log: self.log.clone(),
            responder: self.responder.clone(),
            delay: self.delay,
            closed: AtomicBool::new(false),
        }))
    }
}

// -- Wiring -------------------------------------------------------------------

pub struct Doubles {
    pub planner: Arc<ScriptedPlanner>,
    pub interpreter: Arc<ScriptedInterpreter>,
    pub summarizer: Option<Arc<ScriptedSummarizer>>,
    pub extractor: Arc<RecordingExtractor>,
}

impl Doubles {
    pub fn new(planner: ScriptedPlanner, interpreter: ScriptedInterpreter) -> Self {
        Self {
            planner: Arc::new(planner),
            interpreter: Arc::new(interpreter),
            summarizer: None,
            extractor: Arc::new(RecordingExtractor::new()),
        }
    }

    pub fn with_summarizer(mut self, summarizer: ScriptedSummarizer) -> Self {
        self.summarizer = Some(Arc::new(summarizer));
        self
    }

    pub fn with_extractor(mut self, extractor: RecordingExtractor) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            planner: self.planner.clone(),
            interpreter: self.interpreter.clone(),
            summarizer: self
                .summarizer
                .clone()
                .map(|s| s as Arc<dyn Summarizer>),
            extractor: self.extractor.clone(),
        }
    }
}
