use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use redpilot::capability::Capabilities;
use redpilot::channel::SshConnector;
use redpilot::cli::{Cli, Commands, ConfigAction, Display, OutputFormat, ProgressSink};
use redpilot::config::{
    DEFAULT_CONFIG_FILE, EffectiveScope, EnvCredentialResolver, RedpilotConfig, TargetSpec,
    TaskFile,
};
use redpilot::error::{PilotError, Result};
use redpilot::guardrail::Guardrail;
use redpilot::orchestrator::{
    AttackOrchestrator, BatchPlan, BatchRunner, CancelHandle, EventSink, NullSink, SessionStatus,
};
use redpilot::output::{OutputWriter, ResultStore, StreamSink};

/// Context for command output handling.
struct OutputContext<'a> {
    display: &'a Display,
    writer: &'a OutputWriter,
}

impl OutputContext<'_> {
    fn is_text(&self) -> bool {
        self.writer.format() == OutputFormat::Text
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "redpilot=debug" } else { "redpilot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();
    let writer = OutputWriter::new(cli.output);
    let out = OutputContext {
        display: &display,
        writer: &writer,
    };
    let config_path = cli.config;

    match cli.command {
        Commands::Run {
            task_file,
            goal,
            max_steps,
            target,
            tasks,
            dry_run,
            max_parallel,
        } => {
            let source = match (task_file, goal) {
                (_, Some(goal)) => TaskSource::Goal {
                    goal,
                    max_steps,
                    target,
                },
                (Some(path), None) => TaskSource::File(path),
                (None, None) => {
                    return Err(PilotError::Other("a task file or --goal is required".into()));
                }
            };
            cmd_run(&out, config_path.as_deref(), source, &tasks, dry_run, max_parallel).await
        }
        Commands::Validate { task_file } => {
            cmd_validate(&out, config_path.as_deref(), &task_file).await
        }
        Commands::CheckCommand {
            command,
            allow_out_of_scope,
            excluded,
        } => {
            cmd_check_command(&out, config_path.as_deref(), &command, allow_out_of_scope, excluded)
                .await
        }
        Commands::Config { action } => cmd_config(&out, config_path, action).await,
    }
}

/// Where the sessions of `run` come from.
enum TaskSource {
    File(PathBuf),
    Goal {
        goal: String,
        max_steps: Option<u32>,
        target: Option<String>,
    },
}

impl TaskSource {
    async fn load(self) -> Result<TaskFile> {
        match self {
            Self::File(path) => TaskFile::load(&path).await,
            Self::Goal {
                goal,
                max_steps,
                target,
            } => {
                let target = match target {
                    Some(address) => TargetSpec::from_address(&address)?,
                    None => TargetSpec::default(),
                };
                TaskFile::single_goal(&goal, max_steps, target)
            }
        }
    }
}

async fn cmd_run(
    out: &OutputContext<'_>,
    config_path: Option<&Path>,
    source: TaskSource,
    tasks: &[String],
    dry_run: bool,
    max_parallel: Option<usize>,
) -> Result<()> {
    let config = RedpilotConfig::discover(config_path).await?;
    let file = source.load().await?;
    let plan = BatchPlan::prepare(&file, &config.defaults, tasks)?;

    if dry_run {
        if out.is_text() {
            out.display.print_header("Dry run");
        }
        out.writer.emit_plan(&plan);
        return Ok(());
    }

    let capabilities = Capabilities::from_config(&config.capabilities)?;
    if out.is_text() {
        for settings in plan.sessions().filter(|s| s.scope.allow_out_of_scope) {
            out.display.print_warning(&format!(
                "{}: out-of-scope override acknowledged, scope rules are lifted",
                settings.task_id
            ));
        }
    }
    let connector = Arc::new(SshConnector::new(
        config.channel.clone(),
        Arc::new(EnvCredentialResolver),
    ));
    let results_dir = file
        .output_dir()
        .cloned()
        .unwrap_or_else(|| config.output.dir.clone());
    let persist = config.output.persist;

    let progress = out
        .is_text()
        .then(|| Arc::new(ProgressSink::new(out.display.create_batch_progress(plan.task_count()))));
    let events: Arc<dyn EventSink> = match (out.writer.format(), &progress) {
        (OutputFormat::Text, Some(sink)) => sink.clone() as Arc<dyn EventSink>,
        (OutputFormat::Stream, _) => Arc::new(StreamSink),
        _ => Arc::new(NullSink),
    };

    let orchestrator = Arc::new(
        AttackOrchestrator::new(Arc::new(config), capabilities, connector).with_events(events),
    );
    let mut runner = BatchRunner::new(orchestrator);
    if let Some(n) = max_parallel {
        runner = runner.with_max_parallel(n);
    }
    let store = persist.then(|| ResultStore::new(&results_dir));
    let batch_file = store.as_ref().map(|s| s.batch_file().to_path_buf());
    if let Some(store) = store {
        runner = runner.with_store(store);
    }

    let cancel = CancelHandle::new();
    cancel.cancel_on_ctrl_c();

    let result = runner.run(plan, &cancel).await;
    if let Some(sink) = &progress {
        sink.finish();
    }
    let summary = result?;

    out.writer.emit_batch(&summary);
    if out.is_text() {
        if let Some(path) = &batch_file {
            out.display
                .print_info(&format!("Results written to {}", path.display()));
        }
        if summary.all_completed() {
            out.display.print_success("Every session reached its goal");
        }
    }

    let unfinished = summary
        .sessions
        .iter()
        .filter(|s| matches!(s.status, SessionStatus::Failed | SessionStatus::Cancelled))
        .count();
    if unfinished > 0 {
        return Err(PilotError::Other(format!(
            "{} of {} session(s) failed or were cancelled",
            unfinished, summary.total_tasks
        )));
    }
    Ok(())
}

async fn cmd_validate(
    out: &OutputContext<'_>,
    config_path: Option<&Path>,
    task_file: &Path,
) -> Result<()> {
    let config = RedpilotConfig::discover(config_path).await?;
    let file = TaskFile::load(task_file).await?;
    let plan = BatchPlan::prepare(&file, &config.defaults, &[])?;

    out.writer.emit_plan(&plan);
    if out.is_text() {
        println!();
        out.display.print_success(&format!(
            "{} is valid ({} task(s))",
            task_file.display(),
            plan.task_count()
        ));
    }
    Ok(())
}

async fn cmd_check_command(
    out: &OutputContext<'_>,
    config_path: Option<&Path>,
    command: &str,
    allow_out_of_scope: bool,
    excluded_patterns: Vec<String>,
) -> Result<()> {
    let config = RedpilotConfig::discover(config_path).await?;
    let scope = EffectiveScope {
        excluded_patterns,
        allow_out_of_scope,
    };
    let guardrail = Guardrail::from_config(&config.guardrail, &scope)?;
    let verdict = guardrail.check_command(command);
    out.writer.emit_verdict(command, &verdict);
    Ok(())
}

async fn cmd_config(
    out: &OutputContext<'_>,
    config_path: Option<PathBuf>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = RedpilotConfig::discover(config_path.as_deref()).await?;
            match out.writer.format() {
                OutputFormat::Text => {
                    let yaml = serde_yaml_bw::to_string(&config)?;
                    println!("{}", yaml);
                }
                OutputFormat::Json | OutputFormat::Stream => {
                    let json = serde_json::to_string_pretty(&config)?;
                    println!("{}", json);
                }
            }
        }
        ConfigAction::Init { force } => {
            let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            if path.exists() && !force {
                return Err(PilotError::Other(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            RedpilotConfig::default().save(&path).await?;
            if out.is_text() {
                out.display
                    .print_success(&format!("Wrote default configuration to {}", path.display()));
            } else {
                out.writer
                    .emit_message(&format!("Wrote default configuration to {}", path.display()));
            }
        }
    }

    Ok(())
}
