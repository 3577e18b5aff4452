// ABOUTME: Integration tests for drift detection and repair between source and sink
// ABOUTME: Missing, stale and extra rows are classified, repaired, and a second pass is clean

use chrono::{DateTime, TimeZone, Utc};
use project_sync::model::{transform, SourceRow};
use project_sync::sink::{MemorySink, SinkRecord, SinkStore};
use project_sync::source::MemorySource;
use project_sync::sync::{
    EngineSettings, IncrementalSyncEngine, ReconcileMode, ReconciliationEngine, SyncCoordinator,
    WatermarkStore,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 6, 9, minute, 0).unwrap()
}

fn row(id: &str, minute: u32, status: &str) -> SourceRow {
    let mut row = SourceRow::new(id, ts(minute));
    row.investment_status = Some(status.to_string());
    row
}

fn ids(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

async fn reconciler(
    dir: &TempDir,
    source: Arc<MemorySource>,
    sink: Arc<MemorySink>,
) -> (ReconciliationEngine, Arc<SyncCoordinator>) {
    let coordinator = Arc::new(
        SyncCoordinator::open(WatermarkStore::new(dir.path().join("watermark.json")), true)
            .await
            .unwrap(),
    );
    let settings = EngineSettings {
        page_size: 3,
        ..EngineSettings::default()
    };
    let incremental = Arc::new(IncrementalSyncEngine::new(
        source.clone(),
        sink.clone(),
        coordinator.clone(),
        settings.clone(),
    ));
    (
        ReconciliationEngine::new(source, sink, incremental, settings),
        coordinator,
    )
}

/// Source: A (newer than sink), B (absent in sink), C (in sync), D (sink row tombstoned).
/// Sink additionally holds X, which the source never had.
async fn drifted() -> (Arc<MemorySource>, Arc<MemorySink>) {
    let source = Arc::new(MemorySource::with_rows([
        row("A", 3, "Konstruksi"),
        row("B", 4, "Lelang"),
        row("C", 5, "Selesai"),
        row("D", 6, "Lelang"),
    ]));
    source.set_now(Some(ts(30)));

    let sink = Arc::new(MemorySink::new());
    sink.upsert(&[
        transform(&row("A", 1, "Perencanaan")).unwrap(),
        transform(&row("C", 5, "Selesai")).unwrap(),
        transform(&row("X", 2, "Lelang")).unwrap(),
    ])
    .await
    .unwrap();
    let d = transform(&row("D", 1, "Lelang")).unwrap();
    sink.force(SinkRecord {
        version: d.version(),
        record: d,
        deleted: true,
    });
    (source, sink)
}

#[tokio::test]
async fn test_classifies_each_kind_of_drift() {
    let dir = tempfile::tempdir().unwrap();
    let (source, sink) = drifted().await;
    let (engine, _) = reconciler(&dir, source, sink).await;

    let report = engine.reconcile(ReconcileMode::Checksum).await.unwrap();

    assert_eq!(report.source_count, 4);
    assert_eq!(report.sink_count, 3);
    assert_eq!(report.missing_in_sink, ids(&["B", "D"]));
    assert_eq!(report.stale_in_sink, ids(&["A"]));
    assert_eq!(report.extra_in_sink, ids(&["X"]));
    assert_eq!(report.drift_count(), 4);
    assert_eq!(report.snapshot_bound, ts(30) - chrono::Duration::seconds(5));
}

#[tokio::test]
async fn test_repair_converges() {
    let dir = tempfile::tempdir().unwrap();
    let (source, sink) = drifted().await;
    let (engine, coordinator) = reconciler(&dir, source, sink.clone()).await;
    let watermark_before = coordinator.watermark().await.unwrap();

    let report = engine.reconcile(ReconcileMode::Checksum).await.unwrap();
    let result = engine.repair(&report).await.unwrap();
    assert!(result.is_success(), "{}", result);
    assert_eq!(result.tombstoned, 1);

    assert!(sink.get("X").unwrap().deleted);
    assert!(!sink.get("D").unwrap().deleted);
    assert_eq!(
        sink.get("A").unwrap().record.investment_status.as_deref(),
        Some("Konstruksi")
    );
    // Repair works on ids, not on a time range.
    assert_eq!(coordinator.watermark().await.unwrap(), watermark_before);

    for mode in [ReconcileMode::Checksum, ReconcileMode::Quick] {
        let again = engine.reconcile(mode).await.unwrap();
        assert!(!again.has_drift(), "{:?}: {}", mode, again);
        assert_eq!(again.sink_count, 4);
    }
}

#[tokio::test]
async fn test_unreachable_source_fails_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    let (source, sink) = drifted().await;
    let (engine, _) = reconciler(&dir, source.clone(), sink).await;
    source.set_unavailable(true);

    assert!(engine.reconcile(ReconcileMode::Checksum).await.is_err());
}
