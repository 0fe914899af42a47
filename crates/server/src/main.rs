//! Stash server binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use stash_core::config::AppConfig;
use stash_metadata::repos::TransferQueueRepo;
use stash_server::{AppState, create_router};
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stash - content-addressed file ingestion service
#[derive(Parser, Debug)]
#[command(name = "stashd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "STASH_CONFIG", default_value = "config/server.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server with its migration worker and sweeper (default)
    Serve,
    /// Inspect or requeue transfers that exhausted their retries
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand, Debug)]
enum DeadLetterAction {
    /// List dead-lettered transfers
    List {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Move a dead-lettered transfer back to the queue
    Requeue { task_id: i64 },
}

fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    // STASH_CONFIG only carries the path.
    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("STASH_") && key != "STASH_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: stashd --config /path/to/config.toml\n  \
             2. Environment variables: STASH_SERVER__BIND=0.0.0.0:8080 \
             STASH_STORAGE__LOCAL_ROOT=/var/lib/stash stashd\n\n\
             Set STASH_CONFIG env var to specify a default config file path."
        );
    }

    figment
        .merge(Env::prefixed("STASH_").split("__"))
        .extract()
        .context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args.config)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::DeadLetters { action } => dead_letters(config, action).await,
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    tracing::info!("Stash v{}", env!("CARGO_PKG_VERSION"));

    stash_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let backends = stash_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    backends
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!("Storage backends initialized");

    let metadata = stash_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let bind = config.server.bind.clone();
    let sweep_interval = config.ingest.sweep_interval();
    let migration_enabled = config.migration.enabled;

    let state = AppState::new(config, backends, metadata)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    if migration_enabled {
        let worker = state.migration_worker();
        background.push(tokio::spawn(worker.run(shutdown.child_token())));
        tracing::info!("Migration worker spawned");
    } else {
        tracing::warn!("Migration worker disabled; queued transfers will not drain");
    }

    let sweeper = state.sweeper();
    background.push(tokio::spawn(sweeper.run(sweep_interval, shutdown.child_token())));
    tracing::info!(
        interval_secs = sweep_interval.as_secs(),
        "Sweeper spawned"
    );

    let app = create_router(state);

    let addr: SocketAddr = bind.parse().context("invalid bind address")?;
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind")?;

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = server_shutdown.cancelled() => {}
        }
        tracing::info!("Shutdown signal received");
    })
    .await?;

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }

    Ok(())
}

async fn dead_letters(config: AppConfig, action: DeadLetterAction) -> Result<()> {
    let metadata = stash_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;

    match action {
        DeadLetterAction::List { limit } => {
            let tasks = metadata.list_dead_transfers(limit).await?;
            if tasks.is_empty() {
                println!("No dead-lettered transfers");
            }
            for queued in tasks {
                println!(
                    "{}\t{}\t{} -> {}:{}\tattempts={}\t{}",
                    queued.task_id,
                    queued.task.content_hash,
                    queued.task.source_location,
                    queued.task.dest_backend,
                    queued.task.dest_location,
                    queued.attempts,
                    queued.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
        DeadLetterAction::Requeue { task_id } => {
            if metadata
                .requeue_dead_transfer(task_id, OffsetDateTime::now_utc())
                .await?
            {
                println!("Requeued transfer {task_id}");
            } else {
                anyhow::bail!("no dead-lettered transfer with id {task_id}");
            }
        }
    }

    Ok(())
}
