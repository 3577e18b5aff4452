// ABOUTME: IncrementalSyncEngine - fetch, transform and versioned upsert per entity
// ABOUTME: Also the catch-up pull that replays every row changed after the watermark

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::coordinator::{BatchLedger, SyncCoordinator};
use super::{tick, with_timeout, EngineSettings, FailedEntity, SyncResult};
use crate::error::SyncError;
use crate::model::{transform, ChangeOperation, Version};
use crate::sink::SinkStore;
use crate::source::{ChangeCursor, SourceStore};
use crate::utils::ShutdownSignal;

/// An entity to synchronize, with the time its change was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub entity_id: String,
    /// When the change happened, if known. Bounds how far the watermark may
    /// advance when this entity fails.
    pub hint: Option<DateTime<Utc>>,
    /// The operation the change feed reported, if any. Only informative:
    /// the fetch decides between upsert and tombstone.
    pub operation: Option<ChangeOperation>,
}

impl SyncTarget {
    pub fn new(entity_id: impl Into<String>, hint: Option<DateTime<Utc>>) -> Self {
        Self {
            entity_id: entity_id.into(),
            hint,
            operation: None,
        }
    }

    pub fn with_operation(mut self, operation: ChangeOperation) -> Self {
        self.operation = Some(operation);
        self
    }
}

#[derive(Debug)]
enum Outcome {
    Applied(Version),
    Tombstoned,
    Skipped,
    Failed(SyncError),
}

#[derive(Debug)]
struct EntityReport {
    entity_id: String,
    /// The hint, else the `updated_at` of the fetched row
    time: Option<DateTime<Utc>>,
    outcome: Outcome,
}

/// Per-batch accounting plus what the coordinator needs to record.
#[derive(Default)]
struct Tally {
    result: SyncResult,
    ledger: BatchLedger,
    skipped_ids: Vec<String>,
}

impl Tally {
    fn add(&mut self, reports: &[EntityReport]) {
        for report in reports {
            let id = report.entity_id.clone();
            match &report.outcome {
                Outcome::Applied(version) => {
                    self.result.applied += 1;
                    self.ledger.applied.push((id.clone(), *version));
                    self.ledger.synced.push(id);
                }
                Outcome::Tombstoned => {
                    self.result.applied += 1;
                    self.result.tombstoned += 1;
                    self.ledger.removed.push(id.clone());
                    self.ledger.synced.push(id);
                }
                Outcome::Skipped => {
                    self.result.skipped += 1;
                    self.skipped_ids.push(id.clone());
                    self.ledger.synced.push(id);
                }
                Outcome::Failed(e) => {
                    tracing::warn!("Failed to sync entity {}: {}", report.entity_id, e);
                    self.result.failed.push(FailedEntity::new(id.clone(), e));
                    self.ledger.failed.push((id, report.time));
                }
            }
        }
    }
}

/// Result of a repair batch, with the ids whose stored version was already current.
#[derive(Debug, Default)]
pub struct ResyncOutcome {
    pub result: SyncResult,
    pub skipped: Vec<String>,
}

/// Where the watermark may move after a batch of independent entities: the
/// earliest change time among entities that succeeded, kept strictly below
/// every failed one. A failure with no known time pins the watermark.
fn watermark_target(reports: &[EntityReport]) -> Option<DateTime<Utc>> {
    let mut succeeded: Option<DateTime<Utc>> = None;
    let mut failed: Option<DateTime<Utc>> = None;
    for report in reports {
        match (&report.outcome, report.time) {
            (Outcome::Failed(_), None) => return None,
            (Outcome::Failed(_), Some(t)) => failed = Some(failed.map_or(t, |f| f.min(t))),
            (_, Some(t)) => succeeded = Some(succeeded.map_or(t, |s| s.min(t))),
            (_, None) => {}
        }
    }
    let succeeded = succeeded?;
    Some(match failed {
        Some(f) => succeeded.min(f - tick()),
        None => succeeded,
    })
}

/// Syncs individual entities from the transactional store to the sink.
pub struct IncrementalSyncEngine {
    source: Arc<dyn SourceStore>,
    sink: Arc<dyn SinkStore>,
    coordinator: Arc<SyncCoordinator>,
    settings: EngineSettings,
    shutdown: ShutdownSignal,
}

impl IncrementalSyncEngine {
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

    /// Stop picking up new entities once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Sync a set of entities whose change times are unknown.
    pub async fn sync(&self, entity_ids: &BTreeSet<String>) -> Result<SyncResult> {
        self.sync_targets(
            entity_ids
                .iter()
                .map(|id| SyncTarget::new(id.clone(), None))
                .collect(),
        )
        .await
    }

    /// Sync a batch of entities, then advance the watermark past what succeeded.
    ///
    /// Fails with [`SyncError::ModeConflict`] while a full sync owns the
    /// watermark; the caller keeps the batch and retries later.
    pub async fn sync_targets(&self, targets: Vec<SyncTarget>) -> Result<SyncResult> {
        self.run_batch(targets, true).await.map(|tally| tally.result)
    }

    /// Sync a batch of change events without moving the watermark. Used
    /// while a catch-up pull is still owed: advancing to these events' times
    /// would skip the rows changed before them that no event announced.
    pub async fn sync_targets_held(&self, targets: Vec<SyncTarget>) -> Result<SyncResult> {
        self.run_batch(targets, false).await.map(|tally| tally.result)
    }

    /// Sync entities picked by something other than the change feed, such as
    /// a drift repair. The watermark stays where it is: these ids say nothing
    /// about rows changed between the watermark and their timestamps.
    pub async fn resync(&self, entity_ids: &BTreeSet<String>) -> Result<ResyncOutcome> {
        let targets = entity_ids
            .iter()
            .map(|id| SyncTarget::new(id.clone(), None))
            .collect();
        let tally = self.run_batch(targets, false).await?;
        Ok(ResyncOutcome {
            result: tally.result,
            skipped: tally.skipped_ids,
        })
    }

    async fn run_batch(&self, targets: Vec<SyncTarget>, advance: bool) -> Result<Tally> {
        let targets = dedupe(targets);
        if targets.is_empty() {
            return Ok(Tally::default());
        }

        let ticket = self.coordinator.begin_incremental().await?;
        let reports = self.apply(targets).await;

        let mut tally = Tally::default();
        tally.add(&reports);
        let target = if advance {
            watermark_target(&reports)
        } else {
            None
        };
        if let Some(watermark) = ticket.finish(target, &tally.ledger).await? {
            tracing::debug!("Watermark advanced to {}", watermark);
        }

        self.after_batch(&tally.result).await;
        tracing::info!("Incremental batch: {}", tally.result);
        Ok(tally)
    }

    /// Pull every row changed after the watermark and sync it.
    ///
    /// Entities that failed in earlier batches are retried first, since a
    /// deleted row never shows up in the pull. Rows are then read in
    /// `(updated_at, id_root)` order, so the watermark can follow the pull
    /// page by page. It never passes a failed row, the last timestamp of a
    /// page that may continue, or the source clock minus the snapshot lag.
    pub async fn catch_up(&self) -> Result<SyncResult> {
        let ticket = self.coordinator.begin_incremental().await?;
        let start = self.coordinator.watermark().await?;
        let lag = chrono::Duration::from_std(self.settings.snapshot_lag)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let bound = with_timeout(self.settings.fetch_timeout, self.source.now()).await? - lag;

        tracing::info!("Catching up on changes after {}", start);

        let mut cursor = ChangeCursor::after(start);
        let mut tally = Tally::default();
        let mut ceiling: Option<DateTime<Utc>> = None;
        let mut target: Option<DateTime<Utc>> = None;
        let mut pages = 0usize;

        let unresolved = ticket.unresolved().await?;
        let retried: BTreeSet<String> = unresolved.keys().cloned().collect();
        if !unresolved.is_empty() {
            tracing::info!("Retrying {} entities that failed earlier", unresolved.len());
            let targets = unresolved
                .into_iter()
                .map(|(id, time)| SyncTarget::new(id, Some(time)))
                .collect();
            let reports = self.apply(targets).await;
            tally.add(&reports);
            ceiling = failure_ceiling(ceiling, &reports);
        }

        loop {
            if self.shutdown.is_triggered() {
                tracing::info!("Catch-up cancelled after {} pages", pages);
                break;
            }

            let rows = with_timeout(
                self.settings.fetch_timeout,
                self.source.changed_since(&cursor, self.settings.page_size),
            )
            .await?;
            let Some(last) = rows.last() else {
                break;
            };
            let full_page = rows.len() >= self.settings.page_size;
            let next_cursor = ChangeCursor::at(last);
            pages += 1;

            let targets = rows
                .iter()
                .filter(|row| !retried.contains(&row.entity_id))
                .map(|row| SyncTarget::new(row.entity_id.clone(), Some(row.updated_at)))
                .collect();
            let reports = self.apply(targets).await;
            tally.add(&reports);
            ceiling = failure_ceiling(ceiling, &reports);

            // More rows may share the last timestamp on a full page.
            let mut page_target = if full_page {
                next_cursor.updated_at - tick()
            } else {
                next_cursor.updated_at
            };
            if let Some(ceiling) = ceiling {
                page_target = page_target.min(ceiling);
            }
            target = Some(page_target.min(bound));

            cursor = next_cursor;
            if !full_page {
                break;
            }
        }

        if let Some(watermark) = ticket.finish(target, &tally.ledger).await? {
            tracing::info!("Watermark advanced to {}", watermark);
        }
        self.after_batch(&tally.result).await;
        tracing::info!("Catch-up over {} pages: {}", pages, tally.result);
        Ok(tally.result)
    }

    async fn apply(&self, targets: Vec<SyncTarget>) -> Vec<EntityReport> {
        let workers = self.settings.worker_count.max(1);
        let reports = stream::iter(targets)
            .map(|target| self.sync_one(target))
            .buffer_unordered(workers)
            .collect::<Vec<_>>()
            .await;
        self.coordinator.prune_locks();
        reports
    }

    async fn sync_one(&self, target: SyncTarget) -> EntityReport {
        let _guard = self.coordinator.lock_entity(&target.entity_id).await;
        let mut time = target.hint;

        if self.shutdown.is_triggered() {
            return EntityReport {
                entity_id: target.entity_id,
                time,
                outcome: Outcome::Failed(SyncError::TransientIo("cancelled".into())),
            };
        }

        let outcome = match self.fetch_and_write(&target, &mut time).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e),
        };
        EntityReport {
            entity_id: target.entity_id,
            time,
            outcome,
        }
    }

    async fn fetch_and_write(
        &self,
        target: &SyncTarget,
        time: &mut Option<DateTime<Utc>>,
    ) -> Result<Outcome, SyncError> {
        let id = target.entity_id.as_str();
        let row = match with_timeout(self.settings.fetch_timeout, self.source.fetch(id)).await {
            Ok(row) => row,
            Err(SyncError::NotFound(_)) => return self.tombstone(id, target.hint).await,
            Err(e) => return Err(e),
        };
        if target.operation == Some(ChangeOperation::Delete) {
            tracing::debug!("{} was reported deleted but exists again; syncing the current row", id);
        }
        if time.is_none() {
            *time = Some(row.updated_at);
        }

        let record = transform(&row)?;
        let version = record.version();
        let outcome = with_timeout(
            self.settings.write_timeout,
            self.sink.upsert(std::slice::from_ref(&record)),
        )
        .await?;

        if outcome.applied.iter().any(|applied| applied == id) {
            tracing::debug!("Applied {} at version {}", id, version);
            Ok(Outcome::Applied(version))
        } else {
            tracing::debug!("Skipped {}: stored version is current", id);
            Ok(Outcome::Skipped)
        }
    }

    /// The entity is gone from the source: write a tombstone newer than
    /// whatever the sink holds.
    async fn tombstone(
        &self,
        entity_id: &str,
        hint: Option<DateTime<Utc>>,
    ) -> Result<Outcome, SyncError> {
        let ids = [entity_id.to_string()];
        let stored = with_timeout(
            self.settings.write_timeout,
            self.sink.current_versions(&ids),
        )
        .await?
        .remove(entity_id);

        if stored.map_or(false, |s| s.deleted) {
            return Ok(Outcome::Skipped);
        }

        let version = [
            stored.map(|s| s.version.next()),
            hint.map(Version::from_timestamp),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or_else(|| Version::from_timestamp(Utc::now()));

        let written = with_timeout(
            self.settings.write_timeout,
            self.sink.tombstone(entity_id, version),
        )
        .await?;
        if written {
            tracing::info!("Tombstoned {} at version {}", entity_id, version);
            Ok(Outcome::Tombstoned)
        } else {
            Ok(Outcome::Skipped)
        }
    }

    async fn after_batch(&self, result: &SyncResult) {
        if !self.settings.optimize_after_sync || result.applied == 0 {
            return;
        }
        if let Err(e) = with_timeout(self.settings.write_timeout, self.sink.optimize()).await {
            tracing::warn!("Post-sync optimize failed: {}", e);
        }
    }
}

/// Lower the failure ceiling below every failed report with a known time.
fn failure_ceiling(
    ceiling: Option<DateTime<Utc>>,
    reports: &[EntityReport],
) -> Option<DateTime<Utc>> {
    reports
        .iter()
        .filter_map(|report| match (&report.outcome, report.time) {
            (Outcome::Failed(_), Some(t)) => Some(t - tick()),
            _ => None,
        })
        .fold(ceiling, |c, below| Some(c.map_or(below, |c| c.min(below))))
}

/// Collapse duplicate entity ids, keeping the earliest known hint and the
/// most severe operation.
fn dedupe(targets: Vec<SyncTarget>) -> Vec<SyncTarget> {
    let mut merged: BTreeMap<String, SyncTarget> = BTreeMap::new();
    for target in targets {
        match merged.get_mut(&target.entity_id) {
            Some(existing) => {
                existing.hint = match (existing.hint, target.hint) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                existing.operation = match (existing.operation, target.operation) {
                    (Some(a), Some(b)) => Some(a.merge(b)),
                    (a, b) => a.or(b),
                };
            }
            None => {
                merged.insert(target.entity_id.clone(), target);
            }
        }
    }
    merged.into_values().collect()
}
