// ABOUTME: Transactional store contract - keyed fetch, key-ordered scan, change pull
// ABOUTME: Implemented by PostgreSQL and by an in-memory store for tests

pub mod listener;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::StoreResult;
use crate::model::{SourceRow, Version};

pub use listener::{ChangeListener, ListenerSignal, ListenerStatus};
pub use memory::MemorySource;
pub use postgres::PgSource;

/// Position in the `(updated_at, id_root)` ordering used by change pulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCursor {
    pub updated_at: DateTime<Utc>,
    /// Last id returned at `updated_at`. None means "strictly after `updated_at`".
    pub entity_id: Option<String>,
}

impl ChangeCursor {
    /// Start strictly after a watermark.
    pub fn after(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            entity_id: None,
        }
    }

    /// Whether a row at `(updated_at, entity_id)` lies after this cursor.
    pub fn precedes(&self, updated_at: DateTime<Utc>, entity_id: &str) -> bool {
        match &self.entity_id {
            _ if updated_at > self.updated_at => true,
            Some(last) => updated_at == self.updated_at && entity_id > last.as_str(),
            None => false,
        }
    }

    /// Cursor positioned on the given row.
    pub fn at(row: &SourceRow) -> Self {
        Self {
            updated_at: row.updated_at,
            entity_id: Some(row.entity_id.clone()),
        }
    }
}

/// Read access to the transactional store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetch the current row for an entity. Fails with `NotFound` when it is gone.
    async fn fetch(&self, entity_id: &str) -> StoreResult<SourceRow>;

    /// Page of rows ordered by `id_root`, strictly after `after`.
    async fn scan_page(&self, after: Option<&str>, limit: usize) -> StoreResult<Vec<SourceRow>>;

    /// Page of rows after `cursor` in `(updated_at, id_root)` order.
    async fn changed_since(&self, cursor: &ChangeCursor, limit: usize)
        -> StoreResult<Vec<SourceRow>>;

    /// Version of every entity currently in the table.
    async fn versions(&self) -> StoreResult<BTreeMap<String, Version>>;

    /// The store's own clock.
    async fn now(&self) -> StoreResult<DateTime<Utc>>;

    /// Connectivity check.
    async fn ping(&self) -> StoreResult<()>;
}
