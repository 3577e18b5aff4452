// ABOUTME: WatermarkState and its durable JSON store
// ABOUTME: Records the last synchronized updated_at, the active sync mode and per-entity versions

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::tick;
use crate::error::SyncError;
use crate::model::Version;

/// Which sync path currently owns the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Full,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        }
    }
}

/// Persisted sync progress for the single synchronized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkState {
    /// Every source row with `updated_at` at or before this instant is in the sink
    pub last_synced_at: DateTime<Utc>,
    /// Set while a sync path owns the watermark; `Full` survives a crash
    pub in_progress_mode: Option<SyncMode>,
    /// Process that set `in_progress_mode`
    #[serde(default)]
    pub owner_pid: Option<u32>,
    /// Last version applied per entity. Only reconciliation reads this.
    #[serde(default)]
    pub entity_versions: BTreeMap<String, Version>,
    /// Entities whose last sync failed, keyed to the change time the
    /// watermark has to stay below until they sync
    #[serde(default)]
    pub unresolved: BTreeMap<String, DateTime<Utc>>,
    /// Version of the state format for future migrations
    pub format_version: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for WatermarkState {
    fn default() -> Self {
        Self {
            last_synced_at: DateTime::<Utc>::UNIX_EPOCH,
            in_progress_mode: None,
            owner_pid: None,
            entity_versions: BTreeMap::new(),
            unresolved: BTreeMap::new(),
            format_version: 1,
            updated_at: Utc::now(),
        }
    }
}

impl WatermarkState {
    /// Move the watermark forward, but not past an unresolved failure.
    /// Never moves it backwards.
    pub fn advance_to(&mut self, target: DateTime<Utc>) -> bool {
        let target = match self.failure_floor() {
            Some(floor) => target.min(floor - tick()),
            None => target,
        };
        if target > self.last_synced_at {
            self.last_synced_at = target;
            true
        } else {
            false
        }
    }

    /// Earliest change time among entities that have not synced yet.
    pub fn failure_floor(&self) -> Option<DateTime<Utc>> {
        self.unresolved.values().min().copied()
    }

    /// Remember a failed entity. A failure with no known change time holds
    /// the watermark where it is now.
    pub fn record_failure(&mut self, entity_id: &str, time: Option<DateTime<Utc>>) {
        let time = time.unwrap_or(self.last_synced_at + tick());
        self.unresolved
            .entry(entity_id.to_string())
            .and_modify(|t| *t = (*t).min(time))
            .or_insert(time);
    }

    /// Forget a failure once the entity synced. Returns whether one was recorded.
    pub fn resolve(&mut self, entity_id: &str) -> bool {
        self.unresolved.remove(entity_id).is_some()
    }
}

/// File-backed store for [`WatermarkState`].
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state.
    ///
    /// Fails with [`SyncError::NotInitialized`] when nothing was ever saved;
    /// callers then start from the epoch.
    pub async fn load(&self) -> Result<WatermarkState> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::NotInitialized.into());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read watermark state from {:?}", self.path))
            }
        };
        let state: WatermarkState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermark state from {:?}", self.path))?;
        Ok(state)
    }

    /// Load the saved state, or a fresh epoch state when none exists.
    ///
    /// The boolean is false when the store was not initialized.
    pub async fn load_or_default(&self) -> Result<(WatermarkState, bool)> {
        match self.load().await {
            Ok(state) => Ok((state, true)),
            Err(e) if is_not_initialized(&e) => Ok((WatermarkState::default(), false)),
            Err(e) => Err(e),
        }
    }

    /// Durably replace the saved state.
    ///
    /// Writes a sibling temp file, fsyncs it and renames it over the target,
    /// so a crash leaves either the old or the new state on disk.
    pub async fn save(&self, state: &WatermarkState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(state).context("Failed to serialize watermark state")?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create {:?}", tmp_path))?;
        file.write_all(contents.as_bytes())
            .await
            .with_context(|| format!("Failed to write watermark state to {:?}", tmp_path))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to fsync {:?}", tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to move watermark state into {:?}", self.path))?;
        Ok(())
    }
}

/// Whether an error chain bottoms out in [`SyncError::NotInitialized`].
pub fn is_not_initialized(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SyncError>(), Some(SyncError::NotInitialized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_load_missing_state_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(dir.path().join("watermark.json"));

        let err = store.load().await.unwrap_err();
        assert!(is_not_initialized(&err));

        let (state, initialized) = store.load_or_default().await.unwrap();
        assert!(!initialized);
        assert_eq!(state.last_synced_at, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(dir.path().join("nested/watermark.json"));

        let mut state = WatermarkState::default();
        state.advance_to(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        state.in_progress_mode = Some(SyncMode::Full);
        state.entity_versions.insert("A".into(), Version(42));
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
        assert!(!dir.path().join("nested/watermark.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watermark.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = WatermarkStore::new(&path).load().await.unwrap_err();
        assert!(!is_not_initialized(&err));
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let mut state = WatermarkState::default();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(state.advance_to(t1));
        assert!(!state.advance_to(t0));
        assert_eq!(state.last_synced_at, t1);
    }

    #[test]
    fn test_unresolved_failure_holds_watermark_until_resolved() {
        let mut state = WatermarkState::default();
        let failed_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 2).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 10).unwrap();

        state.record_failure("A", Some(failed_at));
        state.record_failure("A", Some(later));
        assert_eq!(state.failure_floor(), Some(failed_at));

        assert!(state.advance_to(later));
        assert_eq!(state.last_synced_at, failed_at - tick());

        assert!(state.resolve("A"));
        assert!(!state.resolve("A"));
        assert!(state.advance_to(later));
        assert_eq!(state.last_synced_at, later);
    }

    #[test]
    fn test_failure_without_time_pins_current_watermark() {
        let mut state = WatermarkState::default();
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        state.advance_to(t);
        state.record_failure("B", None);

        assert!(!state.advance_to(t + chrono::Duration::hours(1)));
        assert_eq!(state.last_synced_at, t);
    }

    #[test]
    fn test_state_without_unresolved_field_still_loads() {
        let json = r#"{
            "last_synced_at": "2025-01-01T00:00:00Z",
            "in_progress_mode": null,
            "format_version": 1,
            "updated_at": "2025-01-01T00:00:00Z"
        }"#;
        let state: WatermarkState = serde_json::from_str(json).unwrap();
        assert!(state.unresolved.is_empty());
    }
}
