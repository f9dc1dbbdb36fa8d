// ABOUTME: CLI entry point for table-replicator
// ABOUTME: Parses commands, wires pools and orchestrator, and runs serve/sync/status

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use table_replicator::postgres::Pools;
use table_replicator::replication::{scheduler, SyncOrchestrator, SyncProgress};
use table_replicator::utils::redact_url;
use table_replicator::SyncConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "table-replicator")]
#[command(about = "Incremental PostgreSQL table replication with orphan reconciliation", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the replication config file
    #[arg(
        long,
        env = "REPLICATOR_CONFIG",
        global = true,
        default_value = "replicator.toml"
    )]
    config: PathBuf,
    /// Source database connection string
    #[arg(long, env = "SOURCE_DATABASE_URL", global = true)]
    source: Option<String>,
    /// Target database connection string
    #[arg(long, env = "TARGET_DATABASE_URL", global = true)]
    target: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the periodic scheduler until interrupted
    Serve {
        /// Address the HTTP API binds to
        #[arg(long, env = "REPLICATOR_BIND", default_value = "0.0.0.0:3000")]
        bind: SocketAddr,
        /// Seconds between scheduled syncs of all tables
        #[arg(long, default_value_t = scheduler::DEFAULT_SYNC_INTERVAL.as_secs())]
        sync_interval: u64,
        /// Only serve the HTTP API; no scheduled syncs
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Sync tables once and exit
    Sync {
        /// Table to sync (repeatable; defaults to every configured table)
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// Show stored sync cursors
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = SyncConfig::load(&cli.config)?;
    tracing::info!(
        "Loaded {} table definitions from {:?}",
        config.tables.len(),
        cli.config
    );

    let source = cli.source.clone().ok_or_else(|| {
        anyhow!("Source database URL not provided. Use `--source` or SOURCE_DATABASE_URL.")
    })?;
    let target = cli.target.clone().ok_or_else(|| {
        anyhow!("Target database URL not provided. Use `--target` or TARGET_DATABASE_URL.")
    })?;
    tracing::info!(
        "Source: {}, target: {}",
        redact_url(&source),
        redact_url(&target)
    );

    let pools = Pools::connect(&source, &target, &config.pool, cli.allow_self_signed_certs)?;

    let shutdown = CancellationToken::new();
    register_shutdown_handlers(shutdown.clone());

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let progress_logger = tokio::spawn(log_progress(progress_rx));

    let orchestrator = Arc::new(
        SyncOrchestrator::new(Arc::new(config), pools.clone())
            .with_cancellation(shutdown.clone())
            .with_progress(progress_tx),
    );

    orchestrator
        .metadata()
        .ensure_metadata_table()
        .await
        .context("Failed to prepare sync metadata table on target")?;

    let result = match cli.command {
        Commands::Serve {
            bind,
            sync_interval,
            no_scheduler,
        } => serve(orchestrator.clone(), bind, sync_interval, no_scheduler, shutdown).await,
        Commands::Sync { tables } => sync_once(orchestrator.clone(), tables).await,
        Commands::Status => status(&orchestrator).await,
    };

    // Dropping the last orchestrator closes the progress channel; drain what is queued
    drop(orchestrator);
    if tokio::time::timeout(Duration::from_secs(5), progress_logger)
        .await
        .is_err()
    {
        tracing::warn!("Progress logger did not finish; some progress lines were not written");
    }

    pools.close();
    result
}

async fn serve(
    orchestrator: Arc<SyncOrchestrator>,
    bind: SocketAddr,
    sync_interval: u64,
    no_scheduler: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if sync_interval == 0 {
        bail!("--sync-interval must be at least 1 second");
    }

    let scheduler = if no_scheduler {
        tracing::info!("Scheduler disabled; syncs run only on request");
        None
    } else {
        Some(tokio::spawn(scheduler::run(
            orchestrator.clone(),
            Duration::from_secs(sync_interval),
            shutdown.clone(),
        )))
    };

    let served = table_replicator::server::serve(bind, orchestrator, shutdown.clone()).await;

    // Stop the scheduler too if the server exited on its own
    shutdown.cancel();
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::warn!("Scheduler task ended abnormally: {}", e);
        }
    }

    served.context("HTTP API failed")
}

async fn sync_once(orchestrator: Arc<SyncOrchestrator>, tables: Vec<String>) -> anyhow::Result<()> {
    let results = if tables.is_empty() {
        orchestrator.sync_all().await
    } else {
        orchestrator.sync_tables(&tables).await
    };

    let failed = results.iter().filter(|(_, result)| result.is_err()).count();

    println!();
    println!("========================================");
    println!("Sync complete");
    println!("========================================");
    for (table, result) in &results {
        match result {
            Ok(report) => println!(
                "  {}: {} upserted, {} deleted, {} batches ({}ms)",
                table, report.rows_upserted, report.rows_deleted, report.batches, report.duration_ms
            ),
            Err(e) => {
                // Log with :? to show full error chain including root cause
                tracing::error!("{:?}", e);
                println!("  {}: FAILED - {}", table, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} tables failed to sync", failed, results.len());
    }
    Ok(())
}

async fn status(orchestrator: &SyncOrchestrator) -> anyhow::Result<()> {
    let cursors = orchestrator
        .metadata()
        .list()
        .await
        .context("Failed to read sync cursors")?;

    if cursors.is_empty() {
        println!("No tables have been synced yet");
        return Ok(());
    }

    println!("{:<40} LAST SYNC", "TABLE");
    for entry in cursors {
        let last = entry
            .last_sync_time
            .map(|t| t.to_string())
            .unwrap_or_else(|| "never".to_string());
        println!("{:<40} {}", entry.table_name, last);
    }
    Ok(())
}

async fn log_progress(mut rx: mpsc::UnboundedReceiver<SyncProgress>) {
    while let Some(progress) = rx.recv().await {
        tracing::info!(
            "Sync progress for {}: {:.2}%",
            progress.table,
            progress.progress_percent
        );
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
fn register_shutdown_handlers(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        }
        token.cancel();
    });
}
