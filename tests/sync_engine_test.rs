// ABOUTME: Integration tests for the incremental and full sync engines over in-memory stores
// ABOUTME: Covers last-write-wins, watermark rules, catch-up after gaps, tombstones and mode exclusion

use chrono::{DateTime, TimeZone, Utc};
use project_sync::model::{EntityRecord, SourceRow, Version};
use project_sync::sink::{MemorySink, RollupDimension, SinkRecord, SinkStore};
use project_sync::source::MemorySource;
use project_sync::sync::{
    EngineSettings, FullSyncEngine, IncrementalSyncEngine, SyncCoordinator, SyncTarget,
    WatermarkStore,
};
use project_sync::SyncError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 10, minute, 0).unwrap()
}

fn row(id: &str, minute: u32, region: &str) -> SourceRow {
    let mut row = SourceRow::new(id, ts(minute));
    row.region = Some(region.to_string());
    row
}

struct Setup {
    _dir: TempDir,
    source: Arc<MemorySource>,
    sink: Arc<MemorySink>,
    coordinator: Arc<SyncCoordinator>,
    engine: IncrementalSyncEngine,
}

async fn setup(rows: Vec<SourceRow>) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(
        SyncCoordinator::open(WatermarkStore::new(dir.path().join("watermark.json")), true)
            .await
            .unwrap(),
    );
    let source = Arc::new(MemorySource::with_rows(rows));
    source.set_now(Some(ts(59)));
    let sink = Arc::new(MemorySink::new());
    let engine = IncrementalSyncEngine::new(
        source.clone(),
        sink.clone(),
        coordinator.clone(),
        EngineSettings::default(),
    );
    Setup {
        _dir: dir,
        source,
        sink,
        coordinator,
        engine,
    }
}

#[tokio::test]
async fn test_older_source_row_never_overwrites_newer_sink_row() {
    let s = setup(vec![row("A", 3, "Regional 1")]).await;
    let newer = EntityRecord::bare("A", ts(5));
    s.sink.force(SinkRecord {
        version: newer.version(),
        record: newer,
        deleted: false,
    });

    let result = s
        .engine
        .sync_targets(vec![SyncTarget::new("A", Some(ts(3)))])
        .await
        .unwrap();

    assert_eq!(result.applied, 0);
    assert_eq!(result.skipped, 1);
    assert!(result.is_success());
    assert_eq!(s.sink.get("A").unwrap().version, Version::from_timestamp(ts(5)));
}

#[tokio::test]
async fn test_late_batch_applies_but_never_moves_watermark_back() {
    let s = setup(vec![row("A", 3, "Regional 1"), row("B", 5, "Regional 1")]).await;

    s.engine
        .sync_targets(vec![SyncTarget::new("B", Some(ts(5)))])
        .await
        .unwrap();
    assert_eq!(s.coordinator.watermark().await.unwrap(), ts(5));

    // A's event arrives after B's batch already committed.
    let result = s
        .engine
        .sync_targets(vec![SyncTarget::new("A", Some(ts(3)))])
        .await
        .unwrap();
    assert_eq!(result.applied, 1);
    assert!(s.sink.get("A").is_some());
    assert_eq!(s.coordinator.watermark().await.unwrap(), ts(5));
}

#[tokio::test]
async fn test_catch_up_recovers_changes_missed_while_disconnected() {
    let s = setup(vec![row("A", 1, "Regional 1")]).await;
    s.engine
        .sync_targets(vec![SyncTarget::new("A", Some(ts(1)))])
        .await
        .unwrap();
    assert_eq!(s.coordinator.watermark().await.unwrap(), ts(1));

    // Written while no listener was subscribed: no events for these.
    s.source.put(row("B", 2, "Regional 2"));
    s.source.put(row("C", 4, "Regional 2"));

    let result = s.engine.catch_up().await.unwrap();
    assert_eq!(result.applied, 2);
    assert!(s.sink.get("B").is_some());
    assert!(s.sink.get("C").is_some());
    assert_eq!(s.coordinator.watermark().await.unwrap(), ts(4));
}

#[tokio::test]
async fn test_partial_failure_reports_ids_and_holds_watermark() {
    let s = setup(vec![
        row("A", 1, "Regional 1"),
        row("B", 2, "Regional 1"),
        row("C", 3, "Regional 1"),
    ])
    .await;
    s.sink.fail_writes_for("B");

    let result = s
        .engine
        .sync_targets(vec![
            SyncTarget::new("A", Some(ts(1))),
            SyncTarget::new("B", Some(ts(2))),
            SyncTarget::new("C", Some(ts(3))),
        ])
        .await
        .unwrap();

    assert_eq!(result.applied, 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].entity_id, "B");
    assert_eq!(result.failed[0].kind, "transient_io");
    assert!(result.failed[0].reason.contains("injected write failure"));
    assert!(s.coordinator.watermark().await.unwrap() < ts(2));
    assert!(s.sink.get("C").is_some());
}

#[tokio::test]
async fn test_deleted_entity_leaves_rollups() {
    let s = setup(vec![row("A", 1, "Regional 1"), row("B", 2, "Regional 1")]).await;
    s.engine
        .sync(&["A".to_string(), "B".to_string()].into())
        .await
        .unwrap();
    let before = s.sink.rollup(RollupDimension::Region).await.unwrap();
    assert_eq!(before[0].entities, 2);

    s.source.remove("B");
    let result = s
        .engine
        .sync_targets(vec![SyncTarget::new("B", Some(ts(6)))])
        .await
        .unwrap();
    assert_eq!(result.tombstoned, 1);

    let after = s.sink.rollup(RollupDimension::Region).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].entities, 1);
    assert!(s.sink.get("B").unwrap().deleted);
}

#[tokio::test]
async fn test_incremental_batches_defer_while_full_sync_owns_watermark() {
    let s = setup(vec![row("A", 1, "Regional 1")]).await;
    s.coordinator.begin_full().await.unwrap();

    let err = s
        .engine
        .sync_targets(vec![SyncTarget::new("A", Some(ts(1)))])
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::ModeConflict(_))
    ));
    assert!(s.sink.get("A").is_none());

    s.coordinator.finish_full(ts(0), BTreeMap::new(), BTreeMap::new()).await.unwrap();
    let result = s
        .engine
        .sync_targets(vec![SyncTarget::new("A", Some(ts(1)))])
        .await
        .unwrap();
    assert_eq!(result.applied, 1);
}

#[tokio::test]
async fn test_full_sync_is_repeatable_and_hands_over_to_catch_up() {
    let s = setup(vec![row("A", 1, "Regional 1"), row("B", 2, "Regional 2")]).await;
    s.source.set_now(Some(ts(10)));
    let full = FullSyncEngine::new(
        s.source.clone(),
        s.sink.clone(),
        s.coordinator.clone(),
        EngineSettings::default(),
    );

    let first = full.full_sync().await.unwrap();
    assert_eq!(first.applied, 2);
    assert_eq!(s.coordinator.watermark().await.unwrap(), ts(10));

    let second = full.full_sync().await.unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.skipped, 2);

    s.source.put(row("C", 12, "Regional 2"));
    s.source.set_now(Some(ts(20)));
    let result = s.engine.catch_up().await.unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(s.sink.live_count(), 3);
}

#[tokio::test]
async fn test_unmappable_row_fails_alone_and_holds_watermark() {
    let mut bad = row("C", 3, "Regional 2");
    bad.investment_type = Some("Hibah".to_string());
    let s = setup(vec![
        row("A", 1, "Regional 1"),
        row("B", 2, "Regional 1"),
        bad,
        row("D", 4, "Regional 2"),
    ])
    .await;

    let result = s
        .engine
        .sync_targets(vec![
            SyncTarget::new("A", Some(ts(1))),
            SyncTarget::new("B", Some(ts(2))),
            SyncTarget::new("C", Some(ts(3))),
            SyncTarget::new("D", Some(ts(4))),
        ])
        .await
        .unwrap();

    assert_eq!(result.applied, 3);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].entity_id, "C");
    assert_eq!(result.failed[0].kind, "unmappable_value");
    assert!(result.failed[0].reason.contains("Hibah"));
    assert!(s.sink.get("C").is_none());
    assert!(s.sink.get("D").is_some());
    assert!(s.coordinator.watermark().await.unwrap() < ts(3));
}

#[tokio::test]
async fn test_failed_entity_holds_watermark_across_later_batches() {
    let mut bad = row("A", 2, "Regional 1");
    bad.investment_type = Some("Hibah".to_string());
    let s = setup(vec![bad, row("B", 10, "Regional 1")]).await;

    let first = s
        .engine
        .sync_targets(vec![SyncTarget::new("A", Some(ts(2)))])
        .await
        .unwrap();
    assert_eq!(first.failed.len(), 1);

    // A later batch succeeds on its own, yet A is still owed.
    let second = s
        .engine
        .sync_targets(vec![SyncTarget::new("B", Some(ts(10)))])
        .await
        .unwrap();
    assert!(second.is_success());
    assert!(s.coordinator.watermark().await.unwrap() < ts(2));

    let retried = s.engine.catch_up().await.unwrap();
    assert_eq!(retried.failed.len(), 1);
    assert_eq!(retried.failed[0].entity_id, "A");
    assert!(s.coordinator.watermark().await.unwrap() < ts(2));

    s.source.put(row("A", 3, "Regional 1"));
    let healed = s.engine.catch_up().await.unwrap();
    assert!(healed.is_success());
    assert!(s.sink.get("A").is_some());
    assert_eq!(s.coordinator.watermark().await.unwrap(), ts(10));
    assert!(s.coordinator.snapshot().await.unwrap().unresolved.is_empty());
}
