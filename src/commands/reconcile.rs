// ABOUTME: reconcile command - reports drift between PostgreSQL and ClickHouse
// ABOUTME: Fails when drift exists unless --apply repairs it

use anyhow::{bail, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{ensure_success, print_result, Stores};
use crate::sync::{IncrementalSyncEngine, ReconcileMode, ReconciliationEngine, ReconciliationReport};
use crate::utils::ShutdownSignal;

/// Ids printed per drift category before the list is elided.
const MAX_LISTED_IDS: usize = 50;

pub async fn reconcile(
    stores: &Stores,
    mode: ReconcileMode,
    apply: bool,
    shutdown: ShutdownSignal,
) -> Result<ReconciliationReport> {
    let incremental = IncrementalSyncEngine::new(
        Arc::clone(&stores.source),
        Arc::clone(&stores.sink),
        Arc::clone(&stores.coordinator),
        stores.settings(),
    )
    .with_shutdown(shutdown);
    let engine = ReconciliationEngine::new(
        Arc::clone(&stores.source),
        Arc::clone(&stores.sink),
        Arc::new(incremental),
        stores.settings(),
    );

    let report = engine.reconcile(mode).await?;
    print_report(&report);

    if !report.has_drift() {
        println!();
        println!("No drift found.");
        return Ok(report);
    }

    if !apply {
        bail!(
            "Drift detected in {} entities. Rerun with --apply to repair.",
            report.drift_count()
        );
    }

    let result = engine.repair(&report).await?;
    print_result("Repair complete", &result);
    ensure_success(&result)?;
    Ok(report)
}

fn print_report(report: &ReconciliationReport) {
    println!();
    println!("========================================");
    println!("Reconciliation report");
    println!("========================================");
    println!("  Snapshot bound: {}", report.snapshot_bound);
    println!("  Source rows:    {}", report.source_count);
    println!("  Sink rows:      {}", report.sink_count);
    print_ids("Missing in sink", &report.missing_in_sink);
    print_ids("Stale in sink", &report.stale_in_sink);
    print_ids("Extra in sink", &report.extra_in_sink);
}

fn print_ids(label: &str, ids: &BTreeSet<String>) {
    println!("  {}: {}", label, ids.len());
    for id in ids.iter().take(MAX_LISTED_IDS) {
        println!("    - {}", id);
    }
    if ids.len() > MAX_LISTED_IDS {
        println!("    ... and {} more", ids.len() - MAX_LISTED_IDS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::model::SourceRow;
    use crate::sink::MemorySink;
    use crate::source::MemorySource;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_reconcile_fails_on_drift_until_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            state_path: dir.path().join("watermark.json"),
            ..SyncConfig::default()
        };
        let t0 = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let source = Arc::new(MemorySource::with_rows([SourceRow::new("A", t0)]));
        let sink = Arc::new(MemorySink::new());
        let stores = Stores::with_stores(config, source, sink.clone()).await.unwrap();

        let err = reconcile(&stores, ReconcileMode::Checksum, false, ShutdownSignal::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Drift detected in 1 entities"));
        assert!(sink.get("A").is_none());

        let report = reconcile(&stores, ReconcileMode::Checksum, true, ShutdownSignal::never())
            .await
            .unwrap();
        assert!(report.missing_in_sink.contains("A"));
        assert!(sink.get("A").is_some());

        let report = reconcile(&stores, ReconcileMode::Quick, false, ShutdownSignal::never())
            .await
            .unwrap();
        assert!(!report.has_drift());
    }
}
