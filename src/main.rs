// ABOUTME: CLI entry point for project-sync
// ABOUTME: Parses commands, layers configuration and routes to the command handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use project_sync::commands::{self, Stores};
use project_sync::sink::RollupDimension;
use project_sync::sync::ReconcileMode;
use project_sync::utils::ShutdownSignal;
use project_sync::SyncConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "project-sync")]
#[command(about = "Keep the ClickHouse project table consistent with PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "PROJECT_SYNC_CONFIG")]
    config: Option<PathBuf>,
    /// PostgreSQL connection URL
    #[arg(long, global = true, env = "POSTGRES_URL", hide_env_values = true)]
    postgres_url: Option<String>,
    /// ClickHouse HTTP interface URL
    #[arg(long, global = true, env = "CLICKHOUSE_URL")]
    clickhouse_url: Option<String>,
    #[arg(long, global = true, env = "CLICKHOUSE_USER")]
    clickhouse_user: Option<String>,
    #[arg(long, global = true, env = "CLICKHOUSE_PASSWORD", hide_env_values = true)]
    clickhouse_password: Option<String>,
    #[arg(long = "clickhouse-db", global = true, env = "CLICKHOUSE_DB")]
    clickhouse_database: Option<String>,
    /// Watermark state file (overrides state_path from the config file)
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every row changed since the watermark
    Sync,
    /// Reload the whole table into ClickHouse
    FullSync,
    /// Compare both stores and report missing, stale and extra rows
    Reconcile {
        /// Repair the drift that was found
        #[arg(long)]
        apply: bool,
        /// Trust rows whose versions agree instead of comparing checksums
        #[arg(long)]
        quick: bool,
    },
    /// Show the watermark, in-progress sync and daemon health
    Status,
    /// Check connectivity to both stores and daemon status
    Health,
    /// Check project rows for inconsistent financial and contract data
    Validate,
    /// Create the analytical table and rollup views
    InitSchema,
    /// Print aggregate totals of live rows
    Rollup {
        /// Grouping: region, terminal, year, status or type
        #[arg(long, default_value = "region", value_parser = parse_dimension)]
        by: RollupDimension,
    },
    /// Run change capture with periodic reconciliation
    Daemon {
        /// Run in the background (Unix only)
        #[arg(long, conflicts_with = "stop")]
        detach: bool,
        /// Stop a running background daemon
        #[arg(long)]
        stop: bool,
    },
}

fn parse_dimension(value: &str) -> Result<RollupDimension, String> {
    RollupDimension::parse(value).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Daemon { stop: true, .. } => {
            if project_sync::daemon::stop_daemon()? {
                println!("Daemon stopped");
            } else {
                println!("Daemon is not running");
            }
            return Ok(());
        }
        Commands::Daemon { detach: true, .. } => {
            config.require_postgres_url()?;
            // Fork before the runtime spawns its worker threads.
            project_sync::daemon::daemonize()?;
            tracing::info!("Daemon process started (PID: {})", std::process::id());
        }
        _ => {}
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(run(cli.command, config))
}

/// Config file first, then CLI flags and environment variables on top.
fn resolve_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    if let Some(url) = &cli.postgres_url {
        config.postgres_url = url.clone();
    }
    if let Some(url) = &cli.clickhouse_url {
        config.clickhouse.url = url.clone();
    }
    if let Some(user) = &cli.clickhouse_user {
        config.clickhouse.user = user.clone();
    }
    if let Some(password) = &cli.clickhouse_password {
        config.clickhouse.password = password.clone();
    }
    if let Some(database) = &cli.clickhouse_database {
        config.clickhouse.database = database.clone();
    }
    if let Some(path) = &cli.state_path {
        config.state_path = path.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(command: Commands, config: SyncConfig) -> anyhow::Result<()> {
    let (trigger, shutdown) = ShutdownSignal::new();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal, finishing current work");
        trigger.trigger();
    });

    match command {
        Commands::Status => commands::status(&config).await,
        Commands::Sync => {
            let stores = Stores::connect(config).await?;
            commands::sync(&stores, shutdown).await.map(|_| ())
        }
        Commands::FullSync => {
            let stores = Stores::connect(config).await?;
            commands::full_sync(&stores, shutdown).await.map(|_| ())
        }
        Commands::Reconcile { apply, quick } => {
            let mode = if quick {
                ReconcileMode::Quick
            } else {
                ReconcileMode::Checksum
            };
            let stores = Stores::connect(config).await?;
            commands::reconcile(&stores, mode, apply, shutdown)
                .await
                .map(|_| ())
        }
        Commands::Health => {
            let stores = Stores::connect(config).await?;
            commands::health(&stores).await
        }
        Commands::Validate => {
            let stores = Stores::connect(config).await?;
            commands::validate(&stores).await.map(|_| ())
        }
        Commands::InitSchema => {
            let stores = Stores::connect(config).await?;
            commands::init_schema(&stores).await
        }
        Commands::Rollup { by } => {
            let stores = Stores::connect(config).await?;
            commands::rollup(&stores, by).await.map(|_| ())
        }
        Commands::Daemon { .. } => {
            tracing::info!("Press Ctrl+C to stop");
            let stores = Stores::connect(config).await?;
            commands::daemon::run(stores, shutdown).await
        }
    }
}

/// Resolve on Ctrl+C, or on SIGTERM from `daemon --stop`.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
