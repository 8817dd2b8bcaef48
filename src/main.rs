mod cli;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Command};
use quillflow::agents::AgentRegistry;
use quillflow::config::AppConfig;
use quillflow::orchestrator::{DirPersonaResolver, JsonlOutputStore, Orchestrator};
use quillflow::state_machine::{RunStatus, WorkflowDefinition};
use quillflow::ui::{self, TerminalSink};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose.
    let default_level = if cli.verbose {
        "quillflow=debug"
    } else {
        "quillflow=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match run_command(cli).await {
        Ok(true) => process::exit(0),
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

/// Returns whether the command succeeded.
async fn run_command(cli: Cli) -> Result<bool> {
    let mut config = AppConfig::load()?;
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    match cli.command {
        Command::Validate { workflow } => {
            let path = workflow_path(workflow, &config)?;
            let definition = WorkflowDefinition::load(&path)
                .with_context(|| format!("invalid workflow {}", path.display()))?;
            println!(
                "{} is valid: {} states, {} agents",
                path.display(),
                definition.states.len(),
                definition.agents.len()
            );
            Ok(true)
        }
        Command::Run {
            workflow,
            run_id,
            start,
        } => {
            let path = workflow_path(workflow, &config)?;
            let definition = WorkflowDefinition::load(&path)
                .with_context(|| format!("loading workflow {}", path.display()))?;
            execute(definition, &config, run_id, start).await
        }
    }
}

fn workflow_path(flag: Option<PathBuf>, config: &AppConfig) -> Result<PathBuf> {
    flag.or_else(|| config.workflow_path.clone())
        .ok_or_else(|| anyhow!("no workflow given: pass --workflow or set workflow_path"))
}

async fn execute(
    definition: WorkflowDefinition,
    config: &AppConfig,
    run_id: Option<String>,
    start: Option<String>,
) -> Result<bool> {
    let registry = AgentRegistry::with_defaults(config.agent_env());
    let agents = registry.build_all(&definition.agents)?;

    let workflow_sets_skip = definition.auto_skip_score.is_some();
    let workflow_sets_timeout = definition.approval_timeout_secs.is_some();
    let sink = Arc::new(TerminalSink::new());

    let mut orchestrator = Orchestrator::new(definition, agents)
        .with_personas(Arc::new(DirPersonaResolver::new(&config.personas_dir)))
        .with_output_store(Arc::new(JsonlOutputStore::new(&config.output_dir)))
        .with_event_sink(sink.clone());
    if !workflow_sets_skip {
        orchestrator = orchestrator.with_auto_skip_score(config.auto_skip_score);
    }
    if !workflow_sets_timeout {
        orchestrator = orchestrator.with_approval_timeout(config.approval_timeout());
    }
    let handle = orchestrator.handle();
    let mut orchestrator =
        orchestrator.with_approval_notifier(Arc::new(sink.approver(handle.clone())));

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting run");
            ctrl_c.abort();
        }
    });

    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    orchestrator.initialize(run_id);
    let outcome = orchestrator.run(start.as_deref()).await?;
    info!(status = %outcome.status, cost = outcome.summary.cost, "run finished");

    ui::print_summary(&outcome);
    Ok(outcome.status == RunStatus::Complete)
}
