//! Kiln CLI entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load an optional JSON [`EngineConfig`] from
//!    `--config` / `KILN_CONFIG`, then apply flag and environment overrides.
//! 2. **Wire observability**: see [`telemetry`].
//! 3. **Construct the pipeline**: dry-run stage executors, an optional judge
//!    council, an in-memory checkpoint store, the graph and the coordinator.
//! 4. **Execute**: `run` prints the final state as JSON; `stream` prints one
//!    JSON event per line; `config` prints the effective configuration.
//!
//! Ctrl-C requests cooperative cancellation of the running task; the pipeline
//! stops before its next stage and the cancelled state is still printed.

mod telemetry;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use nodes::dry_run::{self, DryRunOptions};
use nodes::{
    CancellationRegistry, EventKind, ExecutionCoordinator, InMemoryCheckpointStore,
    InterruptController, InvokeOptions, WorkflowGraph,
};
use pipeline::{
    EngineConfig, InterruptPointName, ResumeAction, StateUpdate, TaskId, Topology, WorkflowState,
    WorkflowStatus,
};

use crate::telemetry::LogFormat;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "kiln", version, about = "Multi-stage code generation pipeline orchestrator")]
struct Cli {
    /// JSON engine configuration; absent fields take their defaults.
    #[arg(long, global = true, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty, env = "KILN_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one task to completion and print the final state.
    Run {
        #[command(flatten)]
        task: TaskArgs,

        /// Interrupt point to pause at (repeatable), e.g. `plan_approval`.
        #[arg(long = "interrupt", value_parser = parse_point)]
        interrupts: Vec<InterruptPointName>,

        /// Decision applied at every pause.
        #[arg(long, default_value = "continue", value_parser = ResumeAction::from_str)]
        on_interrupt: ResumeAction,

        /// JSON state modifications applied at the first pause.
        #[arg(long)]
        modify: Option<String>,
    },
    /// Run one task and print its lifecycle events as JSON lines.
    Stream {
        #[command(flatten)]
        task: TaskArgs,

        /// Event kinds to print (comma separated); terminal events always print.
        #[arg(long, value_delimiter = ',', value_parser = EventKind::from_str)]
        events: Vec<EventKind>,
    },
    /// Print the effective engine configuration.
    Config,
}

#[derive(Debug, Args)]
struct TaskArgs {
    /// What the pipeline should build.
    description: String,

    #[arg(long, default_value_t = 1, env = "KILN_TASK_ID")]
    task_id: u64,

    /// Wall-clock budget in seconds; overrides the configuration.
    #[arg(long, env = "KILN_TIMEOUT_SECONDS")]
    timeout: Option<f64>,

    #[arg(long, value_enum)]
    topology: Option<TopologyArg>,

    /// Maximum review iterations; overrides the configuration.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Review with the configured judge council instead of a single reviewer.
    #[arg(long)]
    council: bool,

    /// Simulated latency of every dry-run stage, in milliseconds.
    #[arg(long, default_value_t = 0)]
    stage_delay_ms: u64,

    /// Revisions the dry-run reviewer asks for before approving.
    #[arg(long, default_value_t = 1)]
    approve_after: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TopologyArg {
    Linear,
    Supervised,
}

impl From<TopologyArg> for Topology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::Linear => Topology::Linear,
            TopologyArg::Supervised => Topology::Supervised,
        }
    }
}

fn parse_point(s: &str) -> Result<InterruptPointName, String> {
    InterruptPointName::new(s).ok_or_else(|| "interrupt point name must not be empty".to_string())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let telemetry = telemetry::init(cli.log_format)?;

    let result = execute(cli).await;
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "kiln failed");
    }
    telemetry.shutdown();
    result
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let base = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&base)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            task,
            interrupts,
            on_interrupt,
            modify,
        } => {
            let mut config = apply_overrides(base, &task);
            if !interrupts.is_empty() {
                config.interrupts.active = interrupts;
            }
            let modifications = modify
                .map(|text| serde_json::from_str::<StateUpdate>(&text))
                .transpose()
                .context("--modify must be a JSON object of state fields")?;
            let coordinator = build(config, &task)?;
            let state = run(&coordinator, &task, on_interrupt, modifications).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(exit_code(&state))
        }
        Command::Stream { task, events } => {
            let config = apply_overrides(base, &task);
            let coordinator = build(config, &task)?;
            let kinds = (!events.is_empty()).then(|| events.into_iter().collect::<HashSet<_>>());
            let task_id = TaskId::new(task.task_id);
            cancel_on_ctrl_c(&coordinator, task_id);

            let opts = InvokeOptions {
                timeout: timeout_override(task.timeout)?,
                ..InvokeOptions::default()
            };
            let mut stream = coordinator.stream(task.description.clone(), task_id, opts, kinds);
            let mut failed = false;
            while let Some(event) = stream.next().await {
                failed |= event.kind == EventKind::WorkflowError;
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = EngineConfig::from_json(&text)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded engine configuration");
    Ok(config)
}

fn apply_overrides(mut config: EngineConfig, task: &TaskArgs) -> EngineConfig {
    if let Some(topology) = task.topology {
        config.topology = topology.into();
    }
    if let Some(max) = task.max_iterations {
        config.max_review_iterations = max;
    }
    config
}

fn build(config: EngineConfig, task: &TaskArgs) -> anyhow::Result<ExecutionCoordinator> {
    let options = DryRunOptions {
        latency: Duration::from_millis(task.stage_delay_ms),
        approve_after: task.approve_after,
    };
    let council = task.council.then(|| config.council.clone());
    let stages = dry_run::stages(&options, council)?;
    let graph = WorkflowGraph::new(stages, config, Some(Arc::new(InMemoryCheckpointStore::new())))?;
    tracing::debug!(graph = ?graph, "Pipeline constructed");
    Ok(ExecutionCoordinator::new(
        Arc::new(graph),
        Arc::new(CancellationRegistry::new()),
    ))
}

/// Runs the task, answering every interrupt with `action` until the run
/// finishes or is rejected.
async fn run(
    coordinator: &ExecutionCoordinator,
    task: &TaskArgs,
    action: ResumeAction,
    mut modifications: Option<StateUpdate>,
) -> anyhow::Result<WorkflowState> {
    let task_id = TaskId::new(task.task_id);
    cancel_on_ctrl_c(coordinator, task_id);

    let opts = InvokeOptions {
        timeout: timeout_override(task.timeout)?,
        ..InvokeOptions::default()
    };
    let mut report = coordinator
        .invoke_report(&task.description, task_id, opts.clone())
        .await;
    if report.paused_before.is_none() {
        return Ok(report.state);
    }

    let controller = InterruptController::new(coordinator.clone())?;
    while let Some(stage) = report.paused_before {
        let thread_id = report
            .state
            .metadata
            .thread_id
            .context("paused run has no thread id")?;
        tracing::info!(stage = %stage, action = %action, "Answering interrupt");
        report = controller
            .resume_with(thread_id, modifications.take(), action, opts.clone())
            .await?;
    }
    Ok(report.state)
}

fn timeout_override(seconds: Option<f64>) -> anyhow::Result<Option<Duration>> {
    seconds
        .map(|s| Duration::try_from_secs_f64(s).context("--timeout must be a non-negative number"))
        .transpose()
}

fn cancel_on_ctrl_c(coordinator: &ExecutionCoordinator, task_id: TaskId) {
    let registry = coordinator.registry().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(task_id = %task_id, "Interrupt received; cancelling");
            registry.request_cancel(task_id, "interrupted by user");
        }
    });
}

fn exit_code(state: &WorkflowState) -> ExitCode {
    match state.status {
        WorkflowStatus::Complete => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
