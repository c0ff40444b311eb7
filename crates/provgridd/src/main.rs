//! provgridd: the provgrid daemon.
//!
//! # Usage
//!
//! ```text
//! provgridd run --config provgridd.toml --deploy shop.toml
//! provgridd check --config provgridd.toml --deploy shop.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use provgrid_state::{SharedSink, TracingSink};
use provgridd::audit::{FanoutSink, JsonLinesSink};
use provgridd::telemetry::{self, LogFormat};
use provgridd::{Collaborators, DeploymentFile, DryRunProvisioner, Orchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "provgridd", about = "provgrid orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted.
    Run {
        /// Orchestrator configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Deployment files to deploy at startup.
        #[arg(long)]
        deploy: Vec<PathBuf>,
    },
    /// Validate configuration and deployment files, then exit.
    Check {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        deploy: Vec<PathBuf>,
    },
}

fn load(config: Option<&PathBuf>, deploy: &[PathBuf]) -> anyhow::Result<(OrchestratorConfig, Vec<DeploymentFile>)> {
    let config = match config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };
    let deployments = deploy
        .iter()
        .map(|p| DeploymentFile::from_file(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    for d in &deployments {
        d.opstring.validate()?;
    }
    Ok((config, deployments))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    match cli.command {
        Command::Run { config, deploy } => {
            let (config, deployments) = load(config.as_ref(), &deploy)?;
            run(config, deployments).await
        }
        Command::Check { config, deploy } => {
            let (config, deployments) = load(config.as_ref(), &deploy)?;
            info!(
                replica = %config.replica_id,
                nodes = config.nodes.len(),
                deployments = deployments.len(),
                "configuration ok"
            );
            Ok(())
        }
    }
}

async fn run(config: OrchestratorConfig, deployments: Vec<DeploymentFile>) -> anyhow::Result<()> {
    info!("provgrid daemon starting");

    let mut sinks: Vec<SharedSink> = vec![Arc::new(TracingSink)];
    if let Some(path) = &config.audit_log {
        sinks.push(Arc::new(JsonLinesSink::open(path)?));
        info!(path = %path.display(), "audit log opened");
    }
    let orchestrator = Orchestrator::start(
        config,
        Collaborators {
            provisioner: Arc::new(DryRunProvisioner::new()),
            sink: Arc::new(FanoutSink::new(sinks)),
            metrics: None,
        },
    )?;

    for deployment in deployments {
        let name = deployment.opstring.name.clone();
        let ids = match orchestrator.deploy(deployment.opstring).await {
            Ok(ids) => ids,
            Err(e) if e.is_not_leader() => {
                warn!(opstring = %name, "standby replica, deployment skipped");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        for (element, rules) in deployment.rules {
            if let Some(id) = ids.iter().find(|id| id.name == element) {
                orchestrator.load_rules(id, rules).await?;
            }
        }
        info!(opstring = %name, elements = ids.len(), "deployed");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let status = orchestrator.status().await;
    info!(status = %serde_json::to_string(&status)?, "final status");
    orchestrator.shutdown().await;

    info!("provgrid daemon stopped");
    Ok(())
}
