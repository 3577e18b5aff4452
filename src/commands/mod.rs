// ABOUTME: Operator command implementations behind the CLI
// ABOUTME: Exports sync, full-sync, reconcile, status, health, validate, schema and daemon commands

pub mod daemon;
pub mod reconcile;
pub mod schema;
pub mod status;
pub mod sync;
pub mod validate;

pub use reconcile::reconcile;
pub use schema::{init_schema, rollup};
pub use status::{health, status};
pub use sync::{full_sync, sync};
pub use validate::validate;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::sink::{ClickHouseSink, SinkStore};
use crate::source::{PgSource, SourceStore};
use crate::sync::{EngineSettings, SyncCoordinator, SyncResult, WatermarkStore};
use crate::utils::strip_password_from_url;

/// Configured stores and the watermark coordinator, shared by the commands.
pub struct Stores {
    pub config: SyncConfig,
    pub source: Arc<dyn SourceStore>,
    pub sink: Arc<dyn SinkStore>,
    pub coordinator: Arc<SyncCoordinator>,
}

impl Stores {
    /// Open PostgreSQL and ClickHouse clients for the configured table.
    ///
    /// Connections are established lazily on first use.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let postgres_url = config.require_postgres_url()?;
        tracing::debug!(
            "Source: {} (table {})",
            strip_password_from_url(postgres_url),
            config.table
        );
        let source = PgSource::new(postgres_url, &config.table)
            .context("Invalid PostgreSQL configuration")?;

        tracing::debug!(
            "Sink: {} (database {})",
            strip_password_from_url(&config.clickhouse.url),
            config.clickhouse.database
        );
        let sink = ClickHouseSink::new(&config.clickhouse, &config.table, config.write_timeout)
            .context("Invalid ClickHouse configuration")?;

        Self::with_stores(config, Arc::new(source), Arc::new(sink)).await
    }

    /// Wrap already-built stores, opening the coordinator from `state_path`.
    pub async fn with_stores(
        config: SyncConfig,
        source: Arc<dyn SourceStore>,
        sink: Arc<dyn SinkStore>,
    ) -> Result<Self> {
        let coordinator = SyncCoordinator::open(
            WatermarkStore::new(&config.state_path),
            config.track_entity_versions,
        )
        .await
        .context("Failed to open watermark state")?;
        Ok(Self {
            config,
            source,
            sink,
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings::from(&self.config)
    }
}

/// Print a sync result with every failing id and its reason.
pub fn print_result(title: &str, result: &SyncResult) {
    println!();
    println!("========================================");
    println!("{}", title);
    println!("========================================");
    println!("  Applied:    {}", result.applied);
    println!("  Tombstoned: {}", result.tombstoned);
    println!("  Skipped:    {}", result.skipped);
    println!("  Failed:     {}", result.failed.len());
    for failed in &result.failed {
        println!("    - {} [{}]: {}", failed.entity_id, failed.kind, failed.reason);
    }
}

/// Turn a result with failed entities into an error for the exit status.
pub(crate) fn ensure_success(result: &SyncResult) -> Result<()> {
    if !result.is_success() {
        anyhow::bail!(
            "{} entities failed to sync; they are retried on the next pass",
            result.failed.len()
        );
    }
    Ok(())
}
