//! quayd — the QuayGrid provisioner daemon.
//!
//! Loads quay.toml, opens the metadata and cluster stores, wires the
//! scheduler and the admin HTTP surface, and serves until interrupted.
//!
//! # Usage
//!
//! ```text
//! quayd serve --config /etc/quaygrid/quay.toml --listen 0.0.0.0:8888
//! ```

mod healer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use quay_core::QuayConfig;
use quaygrid_api::AdminState;
use quaygrid_cluster::{
    Cluster, ClusterStorage, DockerEngineFactory, MachineProviders, MemoryStorage, RedbStorage,
    Scheduler,
};
use quaygrid_provision::Provisioner;
use quaygrid_router::MemoryRouter;
use quaygrid_scheduler::{RoundRobinScheduler, SegregatedScheduler};
use quaygrid_state::MetaStore;

#[derive(Parser)]
#[command(name = "quayd", about = "QuayGrid provisioner daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the provisioner and its admin API.
    Serve {
        /// Path to quay.toml.
        #[arg(long, default_value = "/etc/quaygrid/quay.toml")]
        config: PathBuf,

        /// Address the admin API listens on.
        #[arg(long, default_value = "0.0.0.0:8888")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,quayd=debug,quaygrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, listen } => serve(config, listen).await,
    }
}

async fn serve(config_path: PathBuf, listen: SocketAddr) -> anyhow::Result<()> {
    info!(config = ?config_path, "quayd starting");
    let config = QuayConfig::from_file(&config_path)?;

    std::fs::create_dir_all(&config.cluster.data_dir)?;
    let metadata_db = config
        .cluster
        .data_dir
        .join(format!("{}.redb", config.collection));
    let store = MetaStore::open(&metadata_db)?;
    info!(dir = ?config.cluster.data_dir, "metadata store opened");

    let storage: Arc<dyn ClusterStorage> = match config.cluster.storage.as_str() {
        "redb" => Arc::new(RedbStorage::open(
            &config.cluster.data_dir.join("cluster.redb"),
        )?),
        "memory" => Arc::new(MemoryStorage::new()),
        other => anyhow::bail!("invalid cluster storage backend: {other}"),
    };

    let scheduler: Arc<dyn Scheduler> = if config.segregate {
        info!("segregated scheduler enabled");
        Arc::new(SegregatedScheduler::new(store.clone()))
    } else {
        Arc::new(RoundRobinScheduler::new())
    };

    let cluster = Arc::new(Cluster::new(
        storage,
        scheduler,
        Arc::new(DockerEngineFactory::new()),
    ));
    if config.auto_healing {
        info!("node auto-healing enabled");
        cluster.set_healer(Arc::new(healer::RecycleHealer::new(Arc::downgrade(
            &cluster,
        ))));
    }

    // Static node list only applies outside segregated mode; segregated
    // clusters grow through the node-add endpoint.
    if !config.segregate {
        for server in &config.servers {
            cluster.register(server, HashMap::new()).await?;
        }
        info!(count = config.servers.len(), "static nodes registered");
    }

    if config.router != "memory" {
        anyhow::bail!("unknown router implementation: {}", config.router);
    }
    let router = Arc::new(MemoryRouter::new());
    let provisioner = Arc::new(Provisioner::new(
        config.clone(),
        cluster.clone(),
        store,
        router,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitoring = if config.active_monitoring {
        info!("active node monitoring enabled");
        Some(
            cluster
                .clone()
                .start_active_monitoring(Duration::from_secs(60), shutdown_rx),
        )
    } else {
        None
    };

    let state = AdminState {
        provisioner,
        machines: Arc::new(MachineProviders::new()),
    };
    let app = quaygrid_api::build_router(state);

    info!(%listen, "admin API listening");
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = monitoring {
        let _ = handle.await;
    }
    info!("quayd stopped");
    Ok(())
}
