// ABOUTME: validate command - scans the source table for inconsistent project data
// ABOUTME: Reports financial and contract-date issues; fails when any row has errors

use anyhow::{bail, Context, Result};

use super::Stores;
use crate::model::{transform, ValidationReport};
use crate::sync::with_timeout;

/// Issues printed before the list is elided.
const MAX_LISTED_ISSUES: usize = 200;

pub async fn validate(stores: &Stores) -> Result<ValidationReport> {
    let page_size = stores.config.page_size.max(1);
    let mut report = ValidationReport::default();
    let mut after: Option<String> = None;

    tracing::info!("Validating rows of {}", stores.config.table);
    loop {
        let rows = with_timeout(
            stores.config.fetch_timeout,
            stores.source.scan_page(after.as_deref(), page_size),
        )
        .await
        .context("Failed to scan source table")?;

        for row in &rows {
            match transform(row) {
                Ok(record) => report.add(&record),
                Err(e) => report.add_unmappable(&row.entity_id, e.to_string()),
            }
        }

        match rows.last() {
            Some(last) if rows.len() >= page_size => after = Some(last.entity_id.clone()),
            _ => break,
        }
    }

    println!("Validated {} rows", report.checked);
    for issue in report.issues.iter().take(MAX_LISTED_ISSUES) {
        println!("  {}", issue);
    }
    if report.issues.len() > MAX_LISTED_ISSUES {
        println!("  ... and {} more", report.issues.len() - MAX_LISTED_ISSUES);
    }
    println!(
        "{} issues, {} rows with errors",
        report.issues.len(),
        report.with_errors
    );

    if !report.is_valid() {
        bail!("{} rows failed validation", report.with_errors);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::model::SourceRow;
    use crate::sink::MemorySink;
    use crate::source::MemorySource;
    use chrono::{NaiveDate, Utc};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_validate_pages_and_flags_bad_contract_dates() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            state_path: dir.path().join("watermark.json"),
            page_size: 2,
            ..SyncConfig::default()
        };
        let mut bad = SourceRow::new("C", Utc::now());
        bad.starts_on = NaiveDate::from_ymd_opt(2025, 6, 1);
        bad.ends_on = NaiveDate::from_ymd_opt(2025, 1, 1);
        let source = Arc::new(MemorySource::with_rows([
            SourceRow::new("A", Utc::now()),
            SourceRow::new("B", Utc::now()),
            bad,
        ]));
        let stores = Stores::with_stores(config, source.clone(), Arc::new(MemorySink::new()))
            .await
            .unwrap();

        let err = validate(&stores).await.unwrap_err();
        assert!(err.to_string().contains("1 rows failed validation"));

        source.remove("C");
        let report = validate(&stores).await.unwrap();
        assert_eq!(report.checked, 2);
        assert!(report.is_valid());
    }
}
