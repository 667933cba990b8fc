//! stratusd — the Stratus orchestrator daemon.
//!
//! Single binary that assembles the orchestrator:
//! - State store (redb)
//! - Driver registry (infra manager, batch scheduler, container
//!   orchestrator, job scheduler)
//! - Deployment engine + supervisor
//!
//! Deployment records are picked up from the state store: every record
//! in `not_started` status gets a background deploy task. Submission
//! itself (the REST API, the CLI) lives outside this process.
//!
//! # Usage
//!
//! ```text
//! stratusd run --config /etc/stratus/stratus.toml
//! ```

mod clients;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use stratus_core::{EngineConfig, StratusConfig};
use stratus_engine::{HttpCallback, Orchestrator, Supervisor};
use stratus_providers::batch::BatchSchedulerDriver;
use stratus_providers::client::StaticToken;
use stratus_providers::container::ContainerGroupDriver;
use stratus_providers::driver::DeploymentDriver;
use stratus_providers::http::{
    RestBatchClient, RestContainerClient, RestInfraManagerClient, RestJobClient, RestTransport,
};
use stratus_providers::infra::InfraManagerDriver;
use stratus_providers::jobs::JobSchedulerDriver;
use stratus_providers::DriverRegistry;
use stratus_state::{DeploymentStatus, StateStore};

use crate::clients::{RestCatalog, RestRanker};

#[derive(Parser)]
#[command(name = "stratusd", about = "Stratus orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator.
    Run {
        /// Path to the stratus.toml configuration file.
        #[arg(long, default_value = "/etc/stratus/stratus.toml")]
        config: PathBuf,

        /// Override the data directory from the configuration.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stratusd=debug,stratus=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, data_dir } => run(config, data_dir).await,
    }
}

async fn run(config_path: PathBuf, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!("stratus orchestrator starting");

    let mut config = if config_path.exists() {
        StratusConfig::from_file(&config_path)?
    } else {
        warn!(path = ?config_path, "configuration file not found, using defaults");
        StratusConfig::default()
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("stratus.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let transport = RestTransport::default();
    let registry = Arc::new(build_registry(&store, &config, &transport)?);
    info!(kinds = ?registry.kinds(), "driver registry built");

    let ranker = match &config.services.ranker {
        Some(service) => Arc::new(RestRanker::new(
            transport.clone(),
            service.address.clone(),
            service.token.clone(),
        )),
        None => anyhow::bail!("services.ranker must be configured"),
    };
    let catalog = match &config.services.catalog {
        Some(service) => Arc::new(RestCatalog::new(
            transport.clone(),
            service.address.clone(),
            service.token.clone(),
        )),
        None => anyhow::bail!("services.catalog must be configured"),
    };

    let engine = Arc::new(Orchestrator::new(
        store.clone(),
        registry,
        ranker,
        catalog,
        Arc::new(HttpCallback::default()),
        config.engine.clone(),
    ));
    let supervisor = Arc::new(Supervisor::new(engine));

    reconcile_previous_run(&store);

    // Pick up newly submitted deployments from the store.
    let intake = {
        let store = store.clone();
        let supervisor = supervisor.clone();
        let engine_config = config.engine.clone();
        tokio::spawn(async move {
            intake_loop(store, supervisor, engine_config).await;
        })
    };

    info!("stratus orchestrator ready");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    intake.abort();
    supervisor.stop_all().await;
    Ok(())
}

fn build_registry(
    store: &StateStore,
    config: &StratusConfig,
    transport: &RestTransport,
) -> anyhow::Result<DriverRegistry> {
    let broker_url = config
        .services
        .broker
        .as_ref()
        .map(|b| b.address.clone())
        .unwrap_or_default();

    let token_for = |platform: &Option<stratus_core::config::PlatformConfig>| {
        Arc::new(StaticToken(
            platform
                .as_ref()
                .and_then(|p| p.token.clone())
                .unwrap_or_default(),
        ))
    };

    let drivers: Vec<Arc<dyn DeploymentDriver>> = vec![
        Arc::new(InfraManagerDriver::new(
            store.clone(),
            Arc::new(RestInfraManagerClient::new(transport.clone(), broker_url)),
            token_for(&config.providers.infra_manager),
        )),
        Arc::new(BatchSchedulerDriver::new(
            store.clone(),
            Arc::new(RestBatchClient::new(transport.clone())),
            token_for(&config.providers.batch),
        )),
        Arc::new(ContainerGroupDriver::new(
            store.clone(),
            Arc::new(RestContainerClient::new(transport.clone())),
            token_for(&config.providers.container),
        )),
        Arc::new(JobSchedulerDriver::new(
            store.clone(),
            Arc::new(RestJobClient::new(transport.clone())),
            token_for(&config.providers.jobs),
        )),
    ];
    Ok(DriverRegistry::new(drivers)?)
}

/// Deployments left in progress by a previous run cannot be resumed
/// mid-attempt; mark them failed so operators see what happened.
fn reconcile_previous_run(store: &StateStore) {
    let deployments = match store.list_deployments() {
        Ok(deployments) => deployments,
        Err(err) => {
            error!(error = %err, "failed to list deployments at startup");
            return;
        }
    };
    let writer = stratus_providers::StatusWriter::new(store.clone());
    for deployment in deployments {
        if deployment.status.is_terminal() || deployment.status == DeploymentStatus::NotStarted {
            continue;
        }
        warn!(
            deployment_id = %deployment.id,
            status = ?deployment.status,
            "deployment was in progress when the orchestrator stopped, marking failed"
        );
        if let Err(err) = writer.update_on_error(
            &deployment.id,
            "orchestrator restarted while the deployment was in progress",
        ) {
            error!(deployment_id = %deployment.id, error = %err, "failed to mark deployment");
        }
    }
}

async fn intake_loop(store: StateStore, supervisor: Arc<Supervisor>, config: EngineConfig) {
    let interval = Duration::from_secs(config.poll_interval_secs.max(1));
    loop {
        match store.list_deployments() {
            Ok(deployments) => {
                for deployment in deployments {
                    if deployment.status != DeploymentStatus::NotStarted {
                        continue;
                    }
                    if supervisor.is_active(&deployment.id).await {
                        continue;
                    }
                    info!(deployment_id = %deployment.id, "picking up submitted deployment");
                    if let Err(err) = supervisor.start_deploy(&deployment.id).await {
                        warn!(
                            deployment_id = %deployment.id,
                            error = %err,
                            "could not start deploy task"
                        );
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "failed to scan for submitted deployments");
            }
        }
        tokio::time::sleep(interval).await;
    }
}
