//! keeld — the Keel daemon.
//!
//! Assembles the reconciliation core:
//! - Desired-state store (redb)
//! - Message bus
//! - Reconciler (health monitor feedback → fleet commands)
//! - State observer (committed desired-state changes → fleet commands)
//! - Gateway (HTTP feedback ingress, fleet command egress)
//!
//! # Usage
//!
//! ```text
//! keeld run --config /etc/keel/keel.toml --data-dir /var/lib/keel
//! keeld check-config --config /etc/keel/keel.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use keel_bus::MessageBus;
use keel_core::KeelConfig;
use keel_gateway::FleetForwarder;
use keel_reconcile::{BusFleetClient, Reconciler, StateObserver};
use keel_state::StateStore;

#[derive(Parser)]
#[command(name = "keeld", about = "Keel reconciliation daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciler and state observer until interrupted.
    Run {
        /// Path to keel.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the state store; overrides `[store] data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse a config file and print the effective configuration.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

const DEFAULT_FILTER: &str = "info,keeld=debug,keel=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, data_dir } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = data_dir {
                config.store.data_dir = dir;
            }
            run(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<KeelConfig> {
    match path {
        Some(path) => KeelConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(KeelConfig::default()),
    }
}

async fn run(config: KeelConfig) -> anyhow::Result<()> {
    info!("Keel daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let data_dir = &config.store.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("keel.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let bus = MessageBus::new();
    let fleet = BusFleetClient::new(bus.clone(), config.fleet.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Start background tasks ─────────────────────────────────

    let observer = StateObserver::new(fleet.clone());
    handles.push(tokio::spawn(
        observer.run(store.subscribe_changes(), shutdown_rx.clone()),
    ));

    if config.reconciler.enabled {
        let reconciler = Reconciler::new(store.clone(), fleet);
        handles.push(tokio::spawn(reconciler.run(
            bus.clone(),
            config.bus.clone(),
            shutdown_rx.clone(),
        )));
    } else {
        warn!("reconciler disabled by configuration");
    }

    let forwarder = FleetForwarder::new(bus.clone(), config.fleet.clone());
    handles.push(tokio::spawn(forwarder.run(shutdown_rx)));

    // ── Start gateway ──────────────────────────────────────────

    if config.gateway.enabled {
        let router = keel_gateway::build_router(bus, &config.bus);
        let addr = &config.gateway.listen;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway on {addr}"))?;
        info!(%addr, "gateway listening");

        // Graceful shutdown on Ctrl-C.
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .context("gateway server failed")?;
    } else {
        warn!("gateway disabled by configuration; the bus has no external ingress");
        shutdown_signal(shutdown_tx).await;
    }

    for handle in handles {
        let _ = handle.await;
    }

    info!("Keel daemon stopped");
    Ok(())
}

/// Resolve on Ctrl-C and tell every background task to stop.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install CTRL+C handler");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
