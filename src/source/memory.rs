// ABOUTME: In-memory transactional store with fault injection
// ABOUTME: Backs the engine tests and dry runs without a database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{ChangeCursor, SourceStore};
use crate::error::{StoreResult, SyncError};
use crate::model::{SourceRow, Version};

/// A source table held in a `BTreeMap` keyed by `id_root`.
#[derive(Default)]
pub struct MemorySource {
    rows: Mutex<BTreeMap<String, SourceRow>>,
    clock: Mutex<Option<DateTime<Utc>>>,
    failing: Mutex<HashSet<String>>,
    fetch_delay: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = SourceRow>) -> Self {
        let source = Self::new();
        for row in rows {
            source.put(row);
        }
        source
    }

    /// Insert or replace a row.
    pub fn put(&self, row: SourceRow) {
        self.lock_rows().insert(row.entity_id.clone(), row);
    }

    pub fn remove(&self, entity_id: &str) -> Option<SourceRow> {
        self.lock_rows().remove(entity_id)
    }

    pub fn get(&self, entity_id: &str) -> Option<SourceRow> {
        self.lock_rows().get(entity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pin the value returned by `now()`. None follows the wall clock.
    pub fn set_now(&self, now: Option<DateTime<Utc>>) {
        *self.clock.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Make `fetch` fail with a transient error for one entity.
    pub fn fail_fetch(&self, entity_id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity_id.to_string());
    }

    pub fn heal_fetch(&self, entity_id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity_id);
    }

    /// Delay every `fetch` by the given duration.
    pub fn delay_fetch(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Make every call fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `fetch` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SourceRow>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::TransientIo("source unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn fetch(&self, entity_id: &str) -> StoreResult<SourceRow> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(entity_id);
        if failing {
            return Err(SyncError::TransientIo(format!(
                "injected fetch failure for {}",
                entity_id
            )));
        }
        self.get(entity_id)
            .ok_or_else(|| SyncError::NotFound(entity_id.to_string()))
    }

    async fn scan_page(&self, after: Option<&str>, limit: usize) -> StoreResult<Vec<SourceRow>> {
        self.check_available()?;
        let rows = self.lock_rows();
        Ok(rows
            .values()
            .filter(|row| after.map_or(true, |a| row.entity_id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn changed_since(
        &self,
        cursor: &ChangeCursor,
        limit: usize,
    ) -> StoreResult<Vec<SourceRow>> {
        self.check_available()?;
        let mut rows: Vec<SourceRow> = self
            .lock_rows()
            .values()
            .filter(|row| cursor.precedes(row.updated_at, &row.entity_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn versions(&self) -> StoreResult<BTreeMap<String, Version>> {
        self.check_available()?;
        Ok(self
            .lock_rows()
            .values()
            .map(|row| (row.entity_id.clone(), Version::from_timestamp(row.updated_at)))
            .collect())
    }

    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        self.check_available()?;
        let pinned = *self.clock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(pinned.unwrap_or_else(Utc::now))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(id: &str, minute: u32) -> SourceRow {
        SourceRow::new(id, Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap())
    }

    #[tokio::test]
    async fn test_scan_pages_by_key() {
        let source = MemorySource::with_rows([row("C", 1), row("A", 2), row("B", 3)]);
        let first = source.scan_page(None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);

        let rest = source.scan_page(Some("B"), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].entity_id, "C");
    }

    #[tokio::test]
    async fn test_changed_since_orders_by_timestamp_then_id() {
        let source = MemorySource::with_rows([row("B", 5), row("A", 5), row("C", 1)]);
        let cursor = ChangeCursor::after(Utc.with_ymd_and_hms(2025, 1, 1, 0, 2, 0).unwrap());
        let rows = source.changed_since(&cursor, 10).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);

        let next = source
            .changed_since(&ChangeCursor::at(&rows[0]), 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].entity_id, "B");
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let source = MemorySource::with_rows([row("A", 1)]);
        source.fail_fetch("A");
        assert!(source.fetch("A").await.unwrap_err().is_transient());
        source.heal_fetch("A");
        assert!(source.fetch("A").await.is_ok());
        assert!(matches!(
            source.fetch("Z").await,
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(source.fetch_count(), 3);
    }
}
