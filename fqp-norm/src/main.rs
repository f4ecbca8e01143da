//! fqp-norm - Normalization & quality pipeline
//!
//! Batch CLI for the normalization sweeps plus a small review HTTP API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fqp_common::config::{load_config, TomlConfig};
use fqp_norm::db::{failures, status_report, unit_reviews, Phase};
use fqp_norm::services::{HttpOracleClient, Oracle, PlaybookRegistry};
use fqp_norm::workflow::NormalizationOrchestrator;
use fqp_norm::AppState;

/// Command-line arguments for fqp-norm
#[derive(Parser, Debug)]
#[command(name = "fqp-norm")]
#[command(about = "Normalization and quality pipeline for filing facts")]
#[command(version)]
struct Args {
    /// Config file (overrides FQP_CONFIG and the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the normalization sweeps
    Run {
        /// Skip both discovery phases (no oracle calls)
        #[arg(long)]
        no_oracle: bool,

        /// Keep sweeping, pausing this many seconds between sweeps
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Print pipeline status counts as JSON
    Status,
    /// Delete applied unit review rows whose document is unit-approved
    PurgeUnitReviews,
    /// Clear a recorded hard failure so discovery retries the document
    ClearFailure {
        #[arg(long)]
        doc_id: i64,

        /// "unit" or "label"
        #[arg(long)]
        phase: Phase,
    },
    /// Serve the review API
    Serve {
        #[arg(short, long, default_value = "5780", env = "FQP_NORM_PORT")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        built = env!("BUILD_TIMESTAMP"),
        profile = env!("BUILD_PROFILE"),
        "Starting fqp-norm"
    );

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let pool = fqp_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;

    match args.command {
        Command::Run {
            no_oracle,
            interval_secs,
        } => run(pool, &config, no_oracle, interval_secs).await?,
        Command::Status => {
            let report = status_report(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::PurgeUnitReviews => {
            let purged = unit_reviews::purge_applied(&pool).await?;
            info!(purged, "Purged applied unit reviews");
            println!("{} unit review rows purged", purged);
        }
        Command::ClearFailure { doc_id, phase } => {
            if failures::clear(&pool, doc_id, phase).await? {
                info!(doc_id, phase = %phase, "Phase failure cleared");
            } else {
                warn!(doc_id, phase = %phase, "No phase failure recorded");
            }
        }
        Command::Serve { port } => serve(pool, port).await?,
    }

    Ok(())
}

async fn run(
    pool: sqlx::SqlitePool,
    config: &TomlConfig,
    no_oracle: bool,
    interval_secs: Option<u64>,
) -> Result<()> {
    // A missing or unreadable playbook is fatal here, before any sweep
    let registry = Arc::new(PlaybookRegistry::load(config).context("Failed to load taxonomy")?);
    if registry.is_empty() {
        warn!("No taxonomy playbooks configured; label phases will skip every document");
    }

    let client = if no_oracle {
        info!("Oracle disabled, discovery phases will not run");
        None
    } else {
        Some(Arc::new(
            HttpOracleClient::connect(&config.oracle, config.oracle_api_key())
                .context("Failed to create oracle client")?,
        ))
    };
    let oracle = client.clone().map(|c| c as Arc<dyn Oracle>);

    let cancel = CancellationToken::new();
    let orchestrator =
        NormalizationOrchestrator::from_config(pool, config, registry, oracle, cancel.clone());

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };

    loop {
        match orchestrator.run_sweep().await {
            Ok(summary) => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Err(e) => error!(error = %e, "Sweep aborted"),
        }

        let Some(secs) = interval_secs else {
            break;
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            _ = cancel.cancelled() => break,
        }
    }

    watcher.abort();
    if let Some(client) = client {
        client.close().await;
    }
    Ok(())
}

async fn serve(pool: sqlx::SqlitePool, port: u16) -> Result<()> {
    let app = fqp_norm::build_router(AppState::new(pool));
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    info!("Review API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
