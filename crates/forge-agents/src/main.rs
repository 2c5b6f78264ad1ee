use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use forge_agents::{
    OrchestratorConfig, RunEvent, RunRequest, RunStage, WorkflowOrchestrator,
};
use genpipe::LanguageRegistry;

#[derive(Parser)]
#[command(name = "forge-agents", about = "Requirements-to-tested-code workflow runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full workflow against a requirements document.
    Run {
        /// Path to the requirements file.
        #[arg(short = 'f', long, conflicts_with = "text")]
        requirements: Option<PathBuf>,
        /// Requirements text given inline.
        #[arg(short, long)]
        text: Option<String>,
        /// Per-scenario attempt budget.
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// List supported target languages.
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            requirements,
            text,
            max_attempts,
        } => {
            let requirements = match (requirements, text) {
                (Some(path), None) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, Some(text)) => text,
                _ => bail!("provide requirements via --requirements <file> or --text <text>"),
            };
            run_workflow(requirements, max_attempts).await
        }
        Command::Languages => {
            for name in LanguageRegistry::builtin().names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

async fn run_workflow(requirements: String, max_attempts: Option<u32>) -> Result<()> {
    let config = OrchestratorConfig::default();
    info!(endpoint = %config.llm.url, model = %config.llm.model, "Workflow orchestrator starting");

    let orchestrator = Arc::new(WorkflowOrchestrator::from_config(config));
    let mut events = orchestrator.subscribe();

    let run_id = orchestrator
        .start(RunRequest {
            requirements,
            max_attempts,
        })
        .await?;

    // Relay progress while the pipeline task does the work.
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::ProgressUpdated {
                    percent, message, ..
                } => info!(percent, "{message}"),
                RunEvent::ScenarioCompleted {
                    scenario_id,
                    status,
                    attempts,
                    ..
                } => info!(scenario = %scenario_id, %status, attempts, "Scenario finished"),
                RunEvent::RunCompleted { .. }
                | RunEvent::RunFailed { .. }
                | RunEvent::RunCancelled { .. } => break,
                _ => {}
            }
        }
    });

    let snapshot = loop {
        match orchestrator.get_status(run_id).await {
            Some(snapshot) if snapshot.is_terminal() => break snapshot,
            Some(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            None => bail!("run {run_id} disappeared from the store"),
        }
    };
    printer.abort();

    match snapshot.stage {
        RunStage::Completed => {
            let report = snapshot
                .report
                .context("completed run carries no report")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        RunStage::Failed => {
            bail!(
                "run failed: {}",
                snapshot.error.unwrap_or_else(|| "unknown error".into())
            )
        }
        other => bail!("run ended in unexpected stage {other}"),
    }
}
