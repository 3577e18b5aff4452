// ABOUTME: sync and full-sync commands
// ABOUTME: Catch-up pull from the watermark, or a complete reload of the source table

use anyhow::{Context, Result};
use std::sync::Arc;

use super::{ensure_success, print_result, Stores};
use crate::sync::{FullSyncEngine, IncrementalSyncEngine, SyncResult};
use crate::utils::ShutdownSignal;

/// Pull every row changed since the watermark and sync it now.
pub async fn sync(stores: &Stores, shutdown: ShutdownSignal) -> Result<SyncResult> {
    stores
        .sink
        .ensure_schema()
        .await
        .context("Failed to ensure analytical schema")?;

    let engine = IncrementalSyncEngine::new(
        Arc::clone(&stores.source),
        Arc::clone(&stores.sink),
        Arc::clone(&stores.coordinator),
        stores.settings(),
    )
    .with_shutdown(shutdown);

    let before = stores.coordinator.watermark().await?;
    tracing::info!("Syncing changes since {}", before);
    let result = engine.catch_up().await?;
    let after = stores.coordinator.watermark().await?;

    print_result("Incremental sync complete", &result);
    println!("  Watermark:  {} -> {}", before, after);
    ensure_success(&result)?;
    Ok(result)
}

/// Reload the whole source table into the sink.
pub async fn full_sync(stores: &Stores, shutdown: ShutdownSignal) -> Result<SyncResult> {
    stores
        .sink
        .ensure_schema()
        .await
        .context("Failed to ensure analytical schema")?;

    let engine = FullSyncEngine::new(
        Arc::clone(&stores.source),
        Arc::clone(&stores.sink),
        Arc::clone(&stores.coordinator),
        stores.settings(),
    )
    .with_shutdown(shutdown);

    tracing::info!("Starting full sync of {}", stores.config.table);
    let result = engine.full_sync().await?;

    print_result("Full sync complete", &result);
    println!("  Watermark:  {}", stores.coordinator.watermark().await?);
    ensure_success(&result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::model::SourceRow;
    use crate::sink::MemorySink;
    use crate::source::MemorySource;
    use chrono::{TimeZone, Utc};

    async fn stores(dir: &tempfile::TempDir, source: Arc<MemorySource>) -> (Stores, Arc<MemorySink>) {
        let config = SyncConfig {
            state_path: dir.path().join("watermark.json"),
            ..SyncConfig::default()
        };
        let sink = Arc::new(MemorySink::new());
        let stores = Stores::with_stores(config, source, sink.clone()).await.unwrap();
        (stores, sink)
    }

    #[tokio::test]
    async fn test_full_sync_then_sync_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let source = Arc::new(MemorySource::with_rows([
            SourceRow::new("A", t0),
            SourceRow::new("B", t0),
        ]));
        source.set_now(Some(t0 + chrono::Duration::minutes(1)));
        let (stores, sink) = stores(&dir, source.clone()).await;

        let result = full_sync(&stores, ShutdownSignal::never()).await.unwrap();
        assert_eq!(result.applied, 2);
        assert_eq!(sink.live_count(), 2);

        source.put(SourceRow::new("C", t0 + chrono::Duration::minutes(5)));
        source.set_now(Some(t0 + chrono::Duration::minutes(10)));
        let result = sync(&stores, ShutdownSignal::never()).await.unwrap();
        assert_eq!(result.applied, 1);
        assert!(sink.get("C").is_some());
    }

    #[tokio::test]
    async fn test_sync_reports_failures_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let source = Arc::new(MemorySource::with_rows([SourceRow::new("A", t0)]));
        let (stores, sink) = stores(&dir, source).await;
        sink.fail_writes_for("A");

        let err = sync(&stores, ShutdownSignal::never()).await.unwrap_err();
        assert!(err.to_string().contains("1 entities failed"));
    }
}
