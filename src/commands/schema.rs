// ABOUTME: init-schema and rollup commands against the analytical store
// ABOUTME: Creates the ClickHouse table and views, prints aggregate rollups of live rows

use anyhow::{Context, Result};

use super::Stores;
use crate::sink::{RollupDimension, RollupRow};

pub async fn init_schema(stores: &Stores) -> Result<()> {
    stores
        .sink
        .ensure_schema()
        .await
        .context("Failed to create analytical schema")?;
    println!(
        "Analytical schema for {} is in place (database {})",
        stores.config.table, stores.config.clickhouse.database
    );
    Ok(())
}

/// Print entity counts and financial totals grouped by `dimension`.
pub async fn rollup(stores: &Stores, dimension: RollupDimension) -> Result<Vec<RollupRow>> {
    let rows = stores
        .sink
        .rollup(dimension)
        .await
        .with_context(|| format!("Failed to compute rollup by {}", dimension.as_str()))?;

    println!(
        "{:<30} {:>8} {:>20} {:>20} {:>20}",
        dimension.as_str(),
        "entities",
        "planned",
        "actual",
        "forecast"
    );
    for row in &rows {
        println!(
            "{:<30} {:>8} {:>20} {:>20} {:>20}",
            row.key.as_deref().unwrap_or("(none)"),
            row.entities,
            row.planned,
            row.actual,
            row.forecast
        );
    }
    Ok(rows)
}
