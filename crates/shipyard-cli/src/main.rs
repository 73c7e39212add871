mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use shipyard_agent::event::parse_stream;
use shipyard_agent::ClaudeExecutor;
use shipyard_core::config::{Config, PipelineConfig};
use shipyard_core::lifecycle::{LifecycleMachine, TaskStatus, TransitionContext};
use shipyard_core::memory::InMemoryIterationStore;
use shipyard_core::pipeline::{PipelineRunner, StepExecutor};
use shipyard_core::steps::StepRegistry;
use shipyard_core::{Feature, StepEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "shipyard", about = "Task lifecycle and review pipeline engine")]
struct Cli {
    /// Read settings from this dotenv file instead of ./.env
    #[arg(long, global = true, env = "SHIPYARD_ENV_FILE")]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a pipeline configuration file and print the parsed steps.
    Validate { file: PathBuf },
    /// Check a comma separated sequence of states against the lifecycle graph.
    CheckPath { states: String },
    /// List lifecycle transitions, optionally only those leaving one state.
    Transitions {
        #[arg(long)]
        from: Option<String>,
    },
    /// Apply a JSON list of {task, to, context} transitions and print each outcome.
    Replay { file: PathBuf },
    /// Summarise a captured `claude --output-format stream-json` session.
    Transcript { file: PathBuf },
    /// Run a pipeline against a feature using the claude CLI.
    Run {
        #[arg(long)]
        pipeline: PathBuf,
        /// JSON file describing the feature.
        #[arg(long)]
        feature: PathBuf,
        /// Working directory handed to the agent.
        #[arg(long)]
        project: Option<PathBuf>,
    },
}

#[derive(Deserialize)]
struct ReplayEntry {
    task: String,
    to: String,
    #[serde(default)]
    context: TransitionContext,
}

fn parse_status(s: &str) -> Result<TaskStatus> {
    TaskStatus::parse(s).with_context(|| format!("unknown task state {s:?}"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.env_file {
        Some(path) => Config::from_env_file(path)?,
        None => Config::from_env()?,
    };
    logging::init(config.log_format);

    let ok = match cli.command {
        Command::Validate { file } => validate(&file)?,
        Command::CheckPath { states } => check_path(&config, &states)?,
        Command::Transitions { from } => transitions(&config, from.as_deref())?,
        Command::Replay { file } => replay(&config, &file).await?,
        Command::Transcript { file } => transcript(&file)?,
        Command::Run {
            pipeline,
            feature,
            project,
        } => run(&config, &pipeline, &feature, project).await?,
    };
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn validate(file: &Path) -> Result<bool> {
    let pipeline = PipelineConfig::load(file)?;
    println!(
        "{}: {} step(s), onFailure={:?}, enabled={}",
        file.display(),
        pipeline.steps.len(),
        pipeline.on_failure,
        pipeline.enabled
    );
    for step in &pipeline.steps {
        let deps = if step.dependencies.is_empty() {
            String::new()
        } else {
            format!(" after [{}]", step.dependencies.join(", "))
        };
        println!(
            "  {} ({}) required={}{deps}",
            step.id,
            step.step_type().as_str(),
            step.required
        );
    }
    Ok(true)
}

fn check_path(config: &Config, states: &str) -> Result<bool> {
    let path = states
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_status)
        .collect::<Result<Vec<_>>>()?;
    let machine = LifecycleMachine::new(config.strict_mode);
    let report = machine.validate_workflow_path(&path);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.valid)
}

fn transitions(config: &Config, from: Option<&str>) -> Result<bool> {
    let machine = LifecycleMachine::new(config.strict_mode);
    let from = from.map(parse_status).transpose()?;
    let edges = match from {
        Some(state) => machine.available_transitions(state),
        None => machine.transitions().iter().collect(),
    };
    for t in edges {
        let guard = if t.validation.is_some() { " [guarded]" } else { "" };
        println!(
            "{} -> {}  {}{guard}",
            t.from.as_str(),
            t.to.as_str(),
            t.phase.unwrap_or("-")
        );
    }
    Ok(true)
}

async fn replay(config: &Config, file: &Path) -> Result<bool> {
    let entries: Vec<ReplayEntry> = read_json(file)?;
    let machine = LifecycleMachine::new(config.strict_mode);
    let mut all_valid = true;
    for entry in entries {
        let to = parse_status(&entry.to)?;
        let outcome = machine.transition(&entry.task, to, &entry.context).await;
        all_valid &= outcome.valid;
        println!("{}", serde_json::to_string(&outcome)?);
    }
    println!("{}", serde_json::to_string_pretty(&machine.stats().await)?);
    Ok(all_valid)
}

fn transcript(file: &Path) -> Result<bool> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let transcript = parse_stream(&data);
    println!("{}", serde_json::to_string_pretty(&transcript)?);
    Ok(!transcript.is_error)
}

async fn run(
    config: &Config,
    pipeline_path: &Path,
    feature_path: &Path,
    project: Option<PathBuf>,
) -> Result<bool> {
    let pipeline = PipelineConfig::load(pipeline_path)?;
    let feature: Feature = read_json(feature_path)?;
    let project = project.unwrap_or_else(|| config.project_path.clone());

    let registry = StepRegistry::new(
        Arc::new(ClaudeExecutor::from_config(config)),
        Arc::new(InMemoryIterationStore::new()),
    );
    let runner = PipelineRunner::new(Arc::new(StepExecutor::new(
        registry,
        config.default_model.clone(),
    )));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling pipeline");
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<StepEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match &event {
                StepEvent::Started { step_id, name, .. } => info!(step_id = %step_id, "started {name}"),
                StepEvent::Progress { step_id, message } => info!(step_id = %step_id, "{message}"),
                StepEvent::Finished { step_id, status } => {
                    info!(step_id = %step_id, status = ?status, "finished")
                }
                StepEvent::Failed { step_id, error } => warn!(step_id = %step_id, "failed: {error}"),
            }
        }
    });

    info!(feature_id = %feature.id, steps = pipeline.steps.len(), project = %project.display(), "running pipeline");
    let summary = runner
        .run(&feature, &pipeline, &project, &cancel, Some(&tx))
        .await;
    drop(tx);
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary.passed)
}
