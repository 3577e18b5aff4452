// ABOUTME: DaemonHealth - persisted snapshot of the running daemon's condition
// ABOUTME: Written periodically by the daemon, read by the status and health commands

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::reconciler::ReconciliationReport;
use super::SyncResult;
use crate::source::ListenerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Still running, but the change feed or the sync path keeps failing
    Degraded,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
        }
    }
}

/// Outcome of the daemon's last reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub at: DateTime<Utc>,
    pub missing: usize,
    pub stale: usize,
    pub extra: usize,
    pub repaired: Option<SyncResult>,
}

impl ReconcileSummary {
    pub fn new(report: &ReconciliationReport, repaired: Option<SyncResult>) -> Self {
        Self {
            at: Utc::now(),
            missing: report.missing_in_sink.len(),
            stale: report.stale_in_sink.len(),
            extra: report.extra_in_sink.len(),
            repaired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub state: HealthState,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub listener: ListenerStatus,
    pub watermark: Option<DateTime<Utc>>,
    pub last_batch: Option<SyncResult>,
    pub last_reconcile: Option<ReconcileSummary>,
    /// Last batch-level failure; cleared by the next successful batch
    pub last_error: Option<String>,
}

impl DaemonHealth {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            state: HealthState::Healthy,
            pid: std::process::id(),
            started_at: now,
            updated_at: now,
            listener: ListenerStatus::default(),
            watermark: None,
            last_batch: None,
            last_reconcile: None,
            last_error: None,
        }
    }

    /// Health file kept next to the watermark state.
    pub fn path_for(state_path: &Path) -> PathBuf {
        state_path.with_file_name("health.json")
    }

    /// Recompute `state` from the recorded facts.
    pub fn evaluate(&mut self) {
        self.state = if self.listener.degraded || self.last_error.is_some() {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        self.updated_at = Utc::now();
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read daemon health from {:?}", path))
            }
        };
        let health = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse daemon health from {:?}", path))?;
        Ok(Some(health))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize daemon health")?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("Failed to move daemon health into {:?}", path))?;
        Ok(())
    }
}

impl Default for DaemonHealth {
    fn default() -> Self {
        Self::new()
    }
}
