// ABOUTME: SyncCoordinator - single owner of the watermark and the sync mode gate
// ABOUTME: Serializes per-entity work and defers incremental batches while a full sync runs

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::state::{is_not_initialized, SyncMode, WatermarkState, WatermarkStore};
use crate::daemon::is_process_running;
use crate::error::SyncError;
use crate::model::Version;

/// Shared context between the full and incremental sync paths.
///
/// Only the path that owns synchronization writes the watermark. A full sync
/// takes ownership with [`begin_full`](Self::begin_full); incremental batches
/// ask for a ticket and are refused with [`SyncError::ModeConflict`] while a
/// full sync is active, in this process or in another live one.
pub struct SyncCoordinator {
    store: WatermarkStore,
    state: Mutex<WatermarkState>,
    initialized: AtomicBool,
    full_active: AtomicBool,
    incremental_in_flight: AtomicUsize,
    track_versions: bool,
    entity_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncCoordinator {
    pub async fn open(store: WatermarkStore, track_versions: bool) -> Result<Self> {
        let (state, initialized) = store.load_or_default().await?;
        if initialized {
            tracing::debug!(
                "Loaded watermark {} from {:?}",
                state.last_synced_at,
                store.path()
            );
        } else {
            tracing::info!(
                "No watermark at {:?}; starting from the epoch",
                store.path()
            );
        }
        Ok(Self {
            store,
            state: Mutex::new(state),
            initialized: AtomicBool::new(initialized),
            full_active: AtomicBool::new(false),
            incremental_in_flight: AtomicUsize::new(0),
            track_versions,
            entity_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &WatermarkStore {
        &self.store
    }

    /// Whether a watermark has ever been saved.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Current state, refreshed from disk so that progress made by other
    /// processes is visible. `in_progress_mode` reports `Incremental` while
    /// batches of this process are in flight.
    pub async fn snapshot(&self) -> Result<WatermarkState> {
        let mut guard = self.state.lock().await;
        match self.store.load().await {
            Ok(state) => {
                self.initialized.store(true, Ordering::SeqCst);
                *guard = state;
            }
            Err(e) if is_not_initialized(&e) => {}
            Err(e) => return Err(e),
        }
        let mut state = guard.clone();
        if state.in_progress_mode.is_none()
            && self.incremental_in_flight.load(Ordering::SeqCst) > 0
        {
            state.in_progress_mode = Some(SyncMode::Incremental);
        }
        Ok(state)
    }

    pub async fn watermark(&self) -> Result<DateTime<Utc>> {
        Ok(self.snapshot().await?.last_synced_at)
    }

    /// Last version applied per entity, as recorded by previous runs.
    pub async fn entity_versions(&self) -> Result<BTreeMap<String, Version>> {
        Ok(self.snapshot().await?.entity_versions)
    }

    /// Whether a full sync currently owns the watermark.
    pub async fn full_sync_active(&self) -> Result<bool> {
        if self.full_active.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let state = self.snapshot().await?;
        Ok(full_owned_elsewhere(&state))
    }

    /// Whether a previous full sync stopped before completing.
    pub async fn interrupted_full_sync(&self) -> Result<bool> {
        if self.full_active.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let state = self.snapshot().await?;
        Ok(state.in_progress_mode == Some(SyncMode::Full) && !full_owned_elsewhere(&state))
    }

    /// Take ownership of the watermark for a full sync.
    pub async fn begin_full(&self) -> Result<()> {
        if self
            .full_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::ModeConflict("a full sync is already running".into()).into());
        }

        let pid = std::process::id();
        let mut conflict = None;
        let result = self
            .mutate(|state| {
                if full_owned_elsewhere(state) {
                    conflict = state.owner_pid;
                    return false;
                }
                state.in_progress_mode = Some(SyncMode::Full);
                state.owner_pid = Some(pid);
                true
            })
            .await;

        match (result, conflict) {
            (Ok(_), None) => Ok(()),
            (Ok(_), Some(owner)) => {
                self.full_active.store(false, Ordering::SeqCst);
                Err(SyncError::ModeConflict(format!(
                    "a full sync is already running in process {}",
                    owner
                ))
                .into())
            }
            (Err(e), _) => {
                self.full_active.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Complete a full sync: set the watermark, release ownership and
    /// replace the per-entity version cache and the unresolved failures
    /// with what this run saw.
    ///
    /// Unlike incremental advancement this may move the watermark backwards,
    /// because everything after `watermark` is re-pulled by the next catch-up.
    pub async fn finish_full(
        &self,
        watermark: DateTime<Utc>,
        versions: BTreeMap<String, Version>,
        failures: BTreeMap<String, DateTime<Utc>>,
    ) -> Result<()> {
        let track = self.track_versions;
        let result = self
            .mutate(|state| {
                state.last_synced_at = watermark;
                state.unresolved = failures;
                state.in_progress_mode = None;
                state.owner_pid = None;
                if track {
                    state.entity_versions = versions;
                }
                true
            })
            .await;
        self.full_active.store(false, Ordering::SeqCst);
        result.map(|_| ())
    }

    /// Release ownership after a failed full sync without touching the watermark.
    pub async fn abort_full(&self) -> Result<()> {
        let result = self
            .mutate(|state| {
                state.in_progress_mode = None;
                state.owner_pid = None;
                true
            })
            .await;
        self.full_active.store(false, Ordering::SeqCst);
        result.map(|_| ())
    }

    /// Release in-process ownership but leave the persisted `Full` mode in
    /// place, so the next start re-runs the full sync from page 0.
    pub fn suspend_full(&self) {
        self.full_active.store(false, Ordering::SeqCst);
    }

    /// Register an incremental batch. Refused while a full sync is active.
    pub async fn begin_incremental(&self) -> Result<IncrementalTicket<'_>> {
        if self.full_sync_active().await? {
            return Err(SyncError::ModeConflict(
                "full sync in progress; incremental batch deferred".into(),
            )
            .into());
        }
        self.incremental_in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(IncrementalTicket { coordinator: self })
    }

    /// Serialize work on one entity. Held across fetch and upsert.
    pub async fn lock_entity(&self, entity_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .entity_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locks.entry(entity_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on.
    pub fn prune_locks(&self) {
        self.entity_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Reload, modify and durably save the state. When `f` returns false the
    /// state is left unsaved.
    async fn mutate<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut WatermarkState) -> bool,
    {
        let mut guard = self.state.lock().await;
        let mut state = match self.store.load().await {
            Ok(state) => state,
            Err(e) if is_not_initialized(&e) => guard.clone(),
            Err(e) => return Err(e),
        };
        if !f(&mut state) {
            *guard = state;
            return Ok(false);
        }
        state.updated_at = Utc::now();
        self.store.save(&state).await?;
        self.initialized.store(true, Ordering::SeqCst);
        *guard = state;
        Ok(true)
    }
}

/// What a batch did to each entity, for the coordinator to record.
#[derive(Debug, Default)]
pub struct BatchLedger {
    /// Entities written, with their new version
    pub applied: Vec<(String, Version)>,
    /// Entities tombstoned
    pub removed: Vec<String>,
    /// Entities the sink now agrees on, whether written or already current
    pub synced: Vec<String>,
    /// Entities that failed, with the change time when known
    pub failed: Vec<(String, Option<DateTime<Utc>>)>,
}

impl BatchLedger {
    fn is_empty(&self) -> bool {
        self.applied.is_empty()
            && self.removed.is_empty()
            && self.synced.is_empty()
            && self.failed.is_empty()
    }
}

/// Permission for one incremental batch to write the watermark.
///
/// Dropping the ticket without calling [`finish`](Self::finish) leaves the
/// watermark where it was.
pub struct IncrementalTicket<'a> {
    coordinator: &'a SyncCoordinator,
}

impl IncrementalTicket<'_> {
    /// Record the batch outcome. Failures are remembered across batches and
    /// cleared once the entity syncs; the watermark advances to `target`
    /// but stays below every remembered failure, and does not move while a
    /// full sync took ownership meanwhile. Returns the new watermark when it moved.
    pub async fn finish(
        self,
        target: Option<DateTime<Utc>>,
        ledger: &BatchLedger,
    ) -> Result<Option<DateTime<Utc>>> {
        let coordinator = self.coordinator;
        if target.is_none() && ledger.is_empty() {
            return Ok(None);
        }
        let track = coordinator.track_versions;

        let full_here = coordinator.full_active.load(Ordering::SeqCst);
        let mut advanced = None;
        coordinator
            .mutate(|state| {
                let mut changed = false;
                for id in &ledger.synced {
                    changed |= state.resolve(id);
                }
                for (id, time) in &ledger.failed {
                    state.record_failure(id, *time);
                    changed = true;
                }
                if let Some(target) = target {
                    if full_here || full_owned_elsewhere(state) {
                        tracing::debug!("Full sync owns the watermark; not advancing");
                    } else if state.advance_to(target) {
                        advanced = Some(state.last_synced_at);
                        changed = true;
                    }
                }
                if track {
                    for (id, version) in &ledger.applied {
                        let entry = state.entity_versions.entry(id.clone()).or_insert(*version);
                        if *version > *entry {
                            *entry = *version;
                        }
                        changed = true;
                    }
                    for id in &ledger.removed {
                        changed |= state.entity_versions.remove(id).is_some();
                    }
                }
                changed
            })
            .await?;
        Ok(advanced)
    }

    /// Entities whose last sync failed and that no later batch resolved.
    pub async fn unresolved(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        Ok(self.coordinator.snapshot().await?.unresolved)
    }
}

impl Drop for IncrementalTicket<'_> {
    fn drop(&mut self) {
        self.coordinator
            .incremental_in_flight
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// A persisted full-sync claim held by another process that is still alive.
fn full_owned_elsewhere(state: &WatermarkState) -> bool {
    state.in_progress_mode == Some(SyncMode::Full)
        && state
            .owner_pid
            .map_or(false, |pid| {
                pid != std::process::id() && is_process_running(pid as i32)
            })
}
