//! fleetd — the Fleetgrid daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Connection registry + site WebSocket sessions
//! - Command dispatcher with its timeout sweep
//! - Offline command queue
//! - Deployment and canary rollout orchestrators
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd serve --config /etc/fleetgrid/fleetd.toml
//! fleetd check-config --config /etc/fleetgrid/fleetd.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use fleet_core::{EventBus, FleetConfig};
use fleet_deploy::LocalObjectStorage;
use fleet_gateway::{GatewayState, build_router};
use fleet_state::StateStore;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleetgrid control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Path to fleetd.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Override `server.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Parse and validate a configuration file, then print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleet=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path),
        None => Ok(FleetConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            run_server(config).await
        }
        Command::CheckConfig { config } => {
            let config = FleetConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_server(config: FleetConfig) -> anyhow::Result<()> {
    info!("Fleetgrid daemon starting");

    let data_dir = &config.server.data_dir;
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let objects_dir = data_dir.join("objects");
    std::fs::create_dir_all(&objects_dir)?;
    let storage = Arc::new(LocalObjectStorage::new(
        objects_dir,
        config.server.public_base_url.clone(),
    ));

    let gateway = GatewayState::assemble(store, &config, storage, EventBus::new()).await;
    info!("control plane assembled");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let sweep_handle = tokio::spawn(gateway.dispatcher.clone().run_sweep(
        Duration::from_secs(config.dispatcher.sweep_interval_secs),
        shutdown_rx.clone(),
    ));
    let cleanup_handle = tokio::spawn(gateway.queue.clone().run_cleanup(
        Duration::from_secs(config.queue.cleanup_interval_secs),
        shutdown_rx.clone(),
    ));
    let stability_handle = tokio::spawn(
        gateway
            .canaries
            .clone()
            .run_stability_checks(shutdown_rx.clone()),
    );

    // ── Start API server ───────────────────────────────────────

    let canaries = gateway.canaries.clone();
    let router = build_router(gateway);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    canaries.shutdown().await;
    let _ = sweep_handle.await;
    let _ = cleanup_handle.await;
    let _ = stability_handle.await;

    info!("Fleetgrid daemon stopped");
    Ok(())
}
