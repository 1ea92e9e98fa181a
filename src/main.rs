// ABOUTME: Entry point for the switchyard binary.
// ABOUTME: Parses CLI arguments, initializes tracing, builds agents from a workflow file, and runs them.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use switchyard_agent::{Agent, GenerationEngine, Orchestrator, create_engine};
use switchyard_core::EventBus;
use switchyard_mcp::{ConnectionRegistry, TransportConnector};

use crate::config::{SwitchyardConfig, WorkflowFile};

#[derive(Parser)]
#[command(name = "switchyard", version, about = "Run multi-agent plans over capability servers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and execute an objective with the workflow's agents, then print the result.
    Run {
        #[arg(long)]
        workflow: PathBuf,
        objective: String,
    },
    /// Connect every agent and print its merged tool catalog.
    Tools {
        #[arg(long)]
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("switchyard=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SwitchyardConfig::from_env()?;
    tracing::info!(provider = %config.provider, "switchyard starting up");

    let connector = TransportConnector::new().with_request_timeout(config.request_timeout);
    let registry = Arc::new(ConnectionRegistry::with_retry(
        Arc::new(connector),
        config.retry_policy(),
    ));
    let engine = create_engine(&config.provider, config.model.as_deref())?;
    let events = EventBus::default();

    let outcome = match cli.command {
        Command::Run {
            workflow,
            objective,
        } => run(&config, &registry, engine, events, &workflow, &objective).await,
        Command::Tools { workflow } => tools(&config, &registry, engine, &workflow).await,
    };

    for (server, err) in registry.disconnect_all().await {
        tracing::warn!(server = %server, error = %err, "error while disconnecting");
    }
    outcome
}

async fn build_agents(
    config: &SwitchyardConfig,
    registry: &Arc<ConnectionRegistry>,
    engine: &Arc<dyn GenerationEngine>,
    events: Option<&EventBus>,
    workflow: &WorkflowFile,
) -> anyhow::Result<Vec<Agent>> {
    let mut agents = Vec::with_capacity(workflow.agents.len());
    for spec in &workflow.agents {
        let mut builder = Agent::builder(&spec.name)
            .description(&spec.description)
            .engine(Arc::clone(engine))
            .servers(workflow.descriptors_for(spec))
            .registry(Arc::clone(registry))
            .max_iterations(spec.max_iterations.unwrap_or(config.max_iterations))
            .load_policy(config.load_policy);
        if let Some(events) = events {
            builder = builder.events(events.clone());
        }
        let agent = builder
            .build()
            .await
            .with_context(|| format!("failed to build agent '{}'", spec.name))?;
        agents.push(agent);
    }
    Ok(agents)
}

async fn run(
    config: &SwitchyardConfig,
    registry: &Arc<ConnectionRegistry>,
    engine: Arc<dyn GenerationEngine>,
    events: EventBus,
    workflow_path: &std::path::Path,
    objective: &str,
) -> anyhow::Result<()> {
    let workflow = WorkflowFile::load(workflow_path)?;
    let agents = build_agents(config, registry, &engine, Some(&events), &workflow).await?;

    let mut rx = events.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::info!(
                    source = %event.source,
                    kind = event.payload.kind(),
                    "progress"
                ),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "progress observer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut builder = Orchestrator::builder().engine(engine).events(events);
    for agent in agents {
        builder = builder.worker(agent);
    }
    let orchestrator = builder.build().await?;

    let outcome = orchestrator.generate(objective).await;
    orchestrator.close().await;
    // Dropping the last bus handle closes the channel and ends the observer
    drop(orchestrator);
    progress.await.ok();

    let result = outcome?;
    println!("{}", result.result);
    Ok(())
}

async fn tools(
    config: &SwitchyardConfig,
    registry: &Arc<ConnectionRegistry>,
    engine: Arc<dyn GenerationEngine>,
    workflow_path: &std::path::Path,
) -> anyhow::Result<()> {
    let workflow = WorkflowFile::load(workflow_path)?;
    let agents = build_agents(config, registry, &engine, None, &workflow).await?;

    for agent in &agents {
        println!("{}", agent.name());
        let Some(aggregator) = agent.aggregator() else {
            println!("  (no servers)");
            continue;
        };
        for tool in aggregator.get_all_tools() {
            println!("  {}/{}: {}", tool.server_id, tool.name(), tool.spec.description);
        }
        for skipped in aggregator.skipped() {
            println!("  [skipped {}: {}]", skipped.server_id, skipped.reason);
        }
    }
    Ok(())
}
