// ABOUTME: FullSyncEngine - reload the analytical table from the source in key-ordered pages
// ABOUTME: Owns the watermark for the whole run and resets it to the run's start time

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::coordinator::SyncCoordinator;
use super::{tick, with_timeout, EngineSettings, FailedEntity, SyncResult};
use crate::error::SyncError;
use crate::model::{transform, Version};
use crate::sink::SinkStore;
use crate::source::SourceStore;
use crate::utils::{retry_with_backoff, ShutdownSignal};

const PAGE_WRITE_RETRIES: u32 = 2;
const PAGE_WRITE_DELAY: Duration = Duration::from_millis(500);

enum RunEnd {
    Completed {
        result: SyncResult,
        watermark: DateTime<Utc>,
        versions: BTreeMap<String, Version>,
        failures: BTreeMap<String, DateTime<Utc>>,
    },
    Cancelled(SyncResult),
}

pub struct FullSyncEngine {
    source: Arc<dyn SourceStore>,
    sink: Arc<dyn SinkStore>,
    coordinator: Arc<SyncCoordinator>,
    settings: EngineSettings,
    shutdown: ShutdownSignal,
}

impl FullSyncEngine {
    pub fn new(
        source: Arc<dyn SourceStore>,
        sink: Arc<dyn SinkStore>,
        coordinator: Arc<SyncCoordinator>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            sink,
            coordinator,
            settings,
            shutdown: ShutdownSignal::never(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Reload every source row.
    ///
    /// Pages are re-applied through the versioned upsert, so a run that
    /// restarts from page 0 after a crash is safe. On completion the
    /// watermark is set to the source clock at the start of the run (or just
    /// below the earliest row that failed to transform), and incremental
    /// batches deferred meanwhile resume.
    pub async fn full_sync(&self) -> Result<SyncResult> {
        self.coordinator.begin_full().await?;

        match self.run().await {
            Ok(RunEnd::Completed {
                result,
                watermark,
                versions,
                failures,
            }) => {
                self.coordinator
                    .finish_full(watermark, versions, failures)
                    .await
                    .context("Full sync finished but the watermark could not be saved")?;
                tracing::info!("Full sync complete: {}. Watermark set to {}", result, watermark);
                Ok(result)
            }
            Ok(RunEnd::Cancelled(result)) => {
                self.coordinator.suspend_full();
                tracing::warn!(
                    "Full sync cancelled after {}; it restarts from the first page next time",
                    result
                );
                Err(SyncError::TransientIo("full sync cancelled".into()).into())
            }
            Err(e) => {
                if let Err(release) = self.coordinator.abort_full().await {
                    tracing::error!("Failed to release full sync ownership: {:#}", release);
                }
                Err(e.context("Full sync failed"))
            }
        }
    }

    async fn run(&self) -> Result<RunEnd> {
        let started_at = with_timeout(self.settings.fetch_timeout, self.source.now()).await?;
        let page_size = self.settings.page_size.max(1);

        tracing::info!("Starting full sync (snapshot time {})", started_at);

        let mut result = SyncResult::default();
        let mut versions = BTreeMap::new();
        let mut failures = BTreeMap::new();
        let mut after: Option<String> = None;
        let mut pages = 0usize;

        loop {
            if self.shutdown.is_triggered() {
                return Ok(RunEnd::Cancelled(result));
            }

            let rows = with_timeout(
                self.settings.fetch_timeout,
                self.source.scan_page(after.as_deref(), page_size),
            )
            .await
            .with_context(|| format!("Failed to read page {}", pages + 1))?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.entity_id.clone());

            let mut records = Vec::with_capacity(rows.len());
            for row in &rows {
                match transform(row) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!("Failed to transform {}: {}", row.entity_id, e);
                        result.failed.push(FailedEntity::new(row.entity_id.clone(), &e));
                        failures.insert(row.entity_id.clone(), row.updated_at);
                    }
                }
            }

            if !records.is_empty() {
                let page = &records;
                let sink = &self.sink;
                let write_timeout = self.settings.write_timeout;
                let outcome = retry_with_backoff(
                    move || async move {
                        with_timeout(write_timeout, sink.upsert(page))
                            .await
                            .map_err(anyhow::Error::from)
                    },
                    PAGE_WRITE_RETRIES,
                    PAGE_WRITE_DELAY,
                )
                .await
                .with_context(|| format!("Failed to write page {}", pages + 1))?;

                result.applied += outcome.applied.len();
                result.skipped += outcome.skipped.len();
                versions.extend(
                    records
                        .iter()
                        .map(|record| (record.entity_id.clone(), record.version())),
                );
            }

            pages += 1;
            tracing::info!(
                "Full sync page {}: {} rows (through {})",
                pages,
                rows.len(),
                after.as_deref().unwrap_or_default()
            );

            if rows.len() < page_size {
                break;
            }
        }

        if self.settings.optimize_after_sync && result.applied > 0 {
            if let Err(e) = with_timeout(self.settings.write_timeout, self.sink.optimize()).await {
                tracing::warn!("Post-sync optimize failed: {}", e);
            }
        }

        let watermark = match failures.values().min() {
            Some(failed) => started_at.min(*failed - tick()),
            None => started_at,
        };
        Ok(RunEnd::Completed {
            result,
            watermark,
            versions,
            failures,
        })
    }
}
