// ABOUTME: Sync engines and their shared bookkeeping
// ABOUTME: Watermark, coordinator, incremental/full/reconcile engines, dispatcher and daemon loop

pub mod coordinator;
pub mod daemon;
pub mod dispatcher;
pub mod full;
pub mod health;
pub mod incremental;
pub mod reconciler;
pub mod state;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::{StoreResult, SyncError};

pub use coordinator::{BatchLedger, SyncCoordinator};
pub use daemon::SyncDaemon;
pub use dispatcher::EventDispatcher;
pub use full::FullSyncEngine;
pub use health::{DaemonHealth, HealthState};
pub use incremental::{IncrementalSyncEngine, SyncTarget};
pub use reconciler::{ReconcileMode, ReconciliationEngine, ReconciliationReport};
pub use state::{SyncMode, WatermarkState, WatermarkStore};

/// An entity that could not be synchronized, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntity {
    pub entity_id: String,
    /// Error class, e.g. `transient_io` or `unmappable_value`
    pub kind: String,
    pub reason: String,
}

impl FailedEntity {
    pub fn new(entity_id: impl Into<String>, error: &SyncError) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Accounting for one sync run: what was written, what was already current,
/// and what failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Entities written to the sink, tombstones included
    pub applied: usize,
    /// Of `applied`, how many were tombstones
    pub tombstoned: usize,
    /// Entities whose stored version was already current
    pub skipped: usize,
    pub failed: Vec<FailedEntity>,
}

impl SyncResult {
    pub fn merge(&mut self, other: SyncResult) {
        self.applied += other.applied;
        self.tombstoned += other.tombstoned;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.failed.len()
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied ({} tombstoned), {} skipped, {} failed",
            self.applied,
            self.tombstoned,
            self.skipped,
            self.failed.len()
        )
    }
}

/// Knobs shared by the sync engines.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub worker_count: usize,
    pub page_size: usize,
    pub fetch_timeout: Duration,
    pub write_timeout: Duration,
    /// Rows changed within this lag of the source clock are treated as in flight
    pub snapshot_lag: Duration,
    pub optimize_after_sync: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for EngineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            page_size: config.page_size,
            fetch_timeout: config.fetch_timeout,
            write_timeout: config.write_timeout,
            snapshot_lag: config.snapshot_lag,
            optimize_after_sync: config.optimize_after_sync,
        }
    }
}

/// Bound a store call. Elapsing counts as a transient failure.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::time::timeout(limit, call).await?
}

/// One microsecond, the resolution of version tokens.
pub(crate) fn tick() -> chrono::Duration {
    chrono::Duration::microseconds(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_result_merge_and_display() {
        let mut total = SyncResult {
            applied: 2,
            tombstoned: 1,
            skipped: 1,
            failed: vec![],
        };
        total.merge(SyncResult {
            applied: 1,
            tombstoned: 0,
            skipped: 0,
            failed: vec![FailedEntity::new(
                "X",
                &SyncError::unmappable("type_investasi", "Hibah"),
            )],
        });
        assert_eq!(total.applied, 3);
        assert_eq!(total.total(), 5);
        assert!(!total.is_success());
        assert_eq!(total.failed[0].kind, "unmappable_value");
        assert_eq!(
            total.to_string(),
            "3 applied (1 tombstoned), 1 skipped, 1 failed"
        );
    }
}
