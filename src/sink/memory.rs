// ABOUTME: In-memory analytical store with last-write-wins semantics and fault injection
// ABOUTME: Mirrors what the ClickHouse table exposes after FINAL collapsing

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{
    rollup_records, RollupDimension, RollupRow, SinkRecord, SinkStore, SinkVersion, UpsertOutcome,
};
use crate::error::{StoreResult, SyncError};
use crate::model::{EntityRecord, Version};

#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<BTreeMap<String, SinkRecord>>,
    failing: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
    optimizes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> Option<SinkRecord> {
        self.lock_rows().get(entity_id).cloned()
    }

    /// Every stored row, tombstones included.
    pub fn snapshot(&self) -> BTreeMap<String, SinkRecord> {
        self.lock_rows().clone()
    }

    /// Overwrite a stored row regardless of version, to stage drift in tests.
    pub fn force(&self, stored: SinkRecord) {
        self.lock_rows()
            .insert(stored.record.entity_id.clone(), stored);
    }

    pub fn remove(&self, entity_id: &str) -> Option<SinkRecord> {
        self.lock_rows().remove(entity_id)
    }

    /// Number of rows not tombstoned.
    pub fn live_count(&self) -> usize {
        self.lock_rows().values().filter(|r| !r.deleted).count()
    }

    /// Make writes touching this entity fail with a transient error.
    pub fn fail_writes_for(&self, entity_id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity_id.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of upsert/tombstone calls that reached the store.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn optimize_count(&self) -> usize {
        self.optimizes.load(Ordering::SeqCst)
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SinkRecord>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::TransientIo("sink unavailable".into()));
        }
        Ok(())
    }

    fn check_writable(&self, entity_id: &str) -> StoreResult<()> {
        self.check_available()?;
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(entity_id)
        {
            return Err(SyncError::TransientIo(format!(
                "injected write failure for {}",
                entity_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SinkStore for MemorySink {
    async fn ensure_schema(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn upsert(&self, records: &[EntityRecord]) -> StoreResult<UpsertOutcome> {
        for record in records {
            self.check_writable(&record.entity_id)?;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut rows = self.lock_rows();
        let mut outcome = UpsertOutcome::default();
        for record in records {
            let version = record.version();
            let newer = rows
                .get(&record.entity_id)
                .map_or(true, |stored| version > stored.version);
            if newer {
                rows.insert(
                    record.entity_id.clone(),
                    SinkRecord {
                        record: record.clone(),
                        version,
                        deleted: false,
                    },
                );
                outcome.applied.push(record.entity_id.clone());
            } else {
                outcome.skipped.push(record.entity_id.clone());
            }
        }
        Ok(outcome)
    }

    async fn tombstone(&self, entity_id: &str, version: Version) -> StoreResult<bool> {
        self.check_writable(entity_id)?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut rows = self.lock_rows();
        match rows.get_mut(entity_id) {
            Some(stored) if stored.version >= version => Ok(false),
            Some(stored) => {
                stored.version = version;
                stored.deleted = true;
                Ok(true)
            }
            None => {
                let record = EntityRecord::bare(entity_id, version.to_timestamp());
                rows.insert(
                    entity_id.to_string(),
                    SinkRecord {
                        record,
                        version,
                        deleted: true,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn current_versions(&self, ids: &[String]) -> StoreResult<HashMap<String, SinkVersion>> {
        self.check_available()?;
        let rows = self.lock_rows();
        Ok(ids
            .iter()
            .filter_map(|id| {
                rows.get(id).map(|r| {
                    (
                        id.clone(),
                        SinkVersion {
                            version: r.version,
                            deleted: r.deleted,
                        },
                    )
                })
            })
            .collect())
    }

    async fn versions(&self) -> StoreResult<BTreeMap<String, SinkVersion>> {
        self.check_available()?;
        Ok(self
            .lock_rows()
            .iter()
            .map(|(id, r)| {
                (
                    id.clone(),
                    SinkVersion {
                        version: r.version,
                        deleted: r.deleted,
                    },
                )
            })
            .collect())
    }

    async fn scan_page(&self, after: Option<&str>, limit: usize) -> StoreResult<Vec<SinkRecord>> {
        self.check_available()?;
        let rows = self.lock_rows();
        Ok(rows
            .values()
            .filter(|r| after.map_or(true, |a| r.record.entity_id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch(&self, ids: &[String]) -> StoreResult<Vec<SinkRecord>> {
        self.check_available()?;
        let rows = self.lock_rows();
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn rollup(&self, dimension: RollupDimension) -> StoreResult<Vec<RollupRow>> {
        self.check_available()?;
        let rows = self.lock_rows();
        Ok(rollup_records(rows.values(), dimension))
    }

    async fn optimize(&self) -> StoreResult<()> {
        self.check_available()?;
        self.optimizes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
