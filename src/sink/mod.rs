// ABOUTME: Analytical store contract - versioned upsert, tombstones, scans and rollups
// ABOUTME: Implemented over the ClickHouse HTTP interface and in memory for tests

pub mod clickhouse;
pub mod memory;
pub mod schema;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::{StoreResult, SyncError};
use crate::model::{EntityRecord, SeriesKind, Version};

pub use clickhouse::ClickHouseSink;
pub use memory::MemorySink;

/// A row as the analytical store holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub record: EntityRecord,
    pub version: Version,
    pub deleted: bool,
}

/// Version bookkeeping of one stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkVersion {
    pub version: Version,
    pub deleted: bool,
}

/// Which records of an upsert call were written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub applied: Vec<String>,
    /// Records whose version was not newer than the stored one
    pub skipped: Vec<String>,
}

/// Grouping keys for aggregate rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollupDimension {
    Region,
    Terminal,
    BudgetYear,
    IssueStatus,
    InvestmentType,
}

impl RollupDimension {
    pub const ALL: [RollupDimension; 5] = [
        RollupDimension::Region,
        RollupDimension::Terminal,
        RollupDimension::BudgetYear,
        RollupDimension::IssueStatus,
        RollupDimension::InvestmentType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RollupDimension::Region => "region",
            RollupDimension::Terminal => "terminal",
            RollupDimension::BudgetYear => "year",
            RollupDimension::IssueStatus => "status",
            RollupDimension::InvestmentType => "type",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SyncError> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == value)
            .ok_or_else(|| SyncError::unmappable("rollup dimension", value))
    }

    /// Grouping key of a record under this dimension.
    pub fn key(&self, record: &EntityRecord) -> Option<String> {
        match self {
            RollupDimension::Region => record.region.clone(),
            RollupDimension::Terminal => record.terminal.clone(),
            RollupDimension::BudgetYear => record.budget_year.map(|y| y.to_string()),
            RollupDimension::IssueStatus => record.issue_status.map(|s| s.label().to_string()),
            RollupDimension::InvestmentType => {
                record.investment_type.map(|t| t.label().to_string())
            }
        }
    }
}

/// One group of an aggregate rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupRow {
    pub key: Option<String>,
    pub entities: u64,
    pub planned: Decimal,
    pub actual: Decimal,
    pub forecast: Decimal,
}

/// Aggregate live records by a dimension. Tombstoned rows never count.
pub fn rollup_records<'a>(
    records: impl IntoIterator<Item = &'a SinkRecord>,
    dimension: RollupDimension,
) -> Vec<RollupRow> {
    let mut groups: BTreeMap<Option<String>, RollupRow> = BTreeMap::new();
    for stored in records.into_iter().filter(|r| !r.deleted) {
        let key = dimension.key(&stored.record);
        let row = groups.entry(key.clone()).or_insert_with(|| RollupRow {
            key,
            entities: 0,
            planned: Decimal::ZERO,
            actual: Decimal::ZERO,
            forecast: Decimal::ZERO,
        });
        row.entities += 1;
        row.planned += stored.record.series(SeriesKind::Planned).total();
        row.actual += stored.record.series(SeriesKind::Actual).total();
        row.forecast += stored.record.series(SeriesKind::Forecast).total();
    }
    groups.into_values().collect()
}

/// Write access to the analytical store.
///
/// Every write is last-write-wins by version: a write whose version is not
/// newer than the stored one leaves the stored row untouched.
#[async_trait]
pub trait SinkStore: Send + Sync {
    /// Create the table and views if they do not exist.
    async fn ensure_schema(&self) -> StoreResult<()>;

    /// Versioned upsert keyed by `entity_id`, version taken from `updated_at`.
    async fn upsert(&self, records: &[EntityRecord]) -> StoreResult<UpsertOutcome>;

    /// Mark an entity deleted at `version`. Returns false when the stored
    /// version is already at or beyond it.
    async fn tombstone(&self, entity_id: &str, version: Version) -> StoreResult<bool>;

    async fn current_versions(&self, ids: &[String]) -> StoreResult<HashMap<String, SinkVersion>>;

    /// Version of every stored entity, tombstones included.
    async fn versions(&self) -> StoreResult<BTreeMap<String, SinkVersion>>;

    /// Page of stored rows ordered by `entity_id`, tombstones included.
    async fn scan_page(&self, after: Option<&str>, limit: usize) -> StoreResult<Vec<SinkRecord>>;

    async fn fetch(&self, ids: &[String]) -> StoreResult<Vec<SinkRecord>>;

    async fn rollup(&self, dimension: RollupDimension) -> StoreResult<Vec<RollupRow>>;

    /// Collapse superseded versions eagerly.
    async fn optimize(&self) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;
}
