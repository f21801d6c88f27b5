use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "redpilot")]
#[command(author, version, about = "Autonomous attack session orchestrator for authorized engagements", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Path to the engine configuration (default: ./redpilot.toml)
    #[arg(long, global = true, env = "REDPILOT_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Output format for CLI results.
/// - Text: Human-readable text output (default)
/// - Json: Single JSON object at completion
/// - Stream: NDJSON streaming (one JSON object per line, real-time events)
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Stream,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sessions of a task file, or a single goal
    Run {
        /// Task file (JSON)
        #[arg(required_unless_present = "goal", conflicts_with = "goal")]
        task_file: Option<PathBuf>,

        /// Run one session for this goal instead of a task file
        #[arg(long, short = 'g')]
        goal: Option<String>,

        /// Step budget for --goal
        #[arg(long, short = 'm', requires = "goal")]
        max_steps: Option<u32>,

        /// Target for --goal as host[:port] (default: [defaults.target])
        #[arg(long, requires = "goal")]
        target: Option<String>,

        /// Only run these task ids (their requirements are included)
        #[arg(long = "task", short = 't')]
        tasks: Vec<String>,

        /// Resolve and validate settings without connecting anywhere
        #[arg(long)]
        dry_run: bool,

        /// Maximum sessions running at once
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Validate a task file and print the effective settings
    Validate {
        /// Task file (JSON)
        task_file: PathBuf,
    },

    /// Check a command against the guardrail policy
    CheckCommand {
        /// Command line to check
        command: String,

        /// Lift scope rules, as an acknowledged out-of-scope override would
        #[arg(long)]
        allow_out_of_scope: bool,

        /// Extra excluded pattern (repeatable)
        #[arg(long = "exclude")]
        excluded: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
