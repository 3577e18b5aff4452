// ABOUTME: ClickHouse DDL for the analytical table and its views
// ABOUTME: ReplacingMergeTree versioned by _version; views hide tombstones

use super::RollupDimension;
use crate::model::{col, SeriesKind};
use crate::utils::quote_ch_ident;

const MONEY: &str = "Decimal(20, 2)";
const TEXT: &str = "Nullable(String)";
const YEAR: &str = "Nullable(Int32)";
const DATE: &str = "Nullable(Date32)";
const COORDINATE: &str = "Nullable(Float64)";

/// Stored columns of the analytical table with their ClickHouse types, in
/// insert order. Materialized totals are not part of this list.
pub fn columns() -> Vec<(String, String)> {
    let mut columns: Vec<(String, String)> = vec![
        (col::ID.into(), "String".into()),
        (col::REGION.into(), TEXT.into()),
        (col::TERMINAL.into(), TEXT.into()),
        (col::INVESTMENT_ID.into(), TEXT.into()),
        (col::PROJECT_DEFINITION.into(), TEXT.into()),
        (col::ASSET_CATEGORY.into(), TEXT.into()),
        (
            col::INVESTMENT_TYPE.into(),
            "Nullable(Enum8('Murni' = 1, 'Multi Year' = 2, 'Carry Forward' = 3))".into(),
        ),
        (col::PROPOSAL_YEAR.into(), YEAR.into()),
        (col::BUDGET_YEAR.into(), YEAR.into()),
        (col::INVESTMENT_STATUS.into(), TEXT.into()),
        (col::PROGRESS_DESCRIPTION.into(), TEXT.into()),
        (col::ISSUE_CATEGORY.into(), TEXT.into()),
        (col::ISSUE_DESCRIPTION.into(), TEXT.into()),
        (col::ACTION_TARGET.into(), TEXT.into()),
        (col::HEAD_OFFICE_SUPPORT.into(), TEXT.into()),
        (col::PIC.into(), TEXT.into()),
        (
            col::ISSUE_STATUS.into(),
            "Nullable(Enum8('Open' = 1, 'Closed' = 2))".into(),
        ),
        (col::FUNDING_NEED.into(), MONEY.into()),
        (col::PLANNED_TOTAL.into(), MONEY.into()),
    ];
    for kind in SeriesKind::ALL {
        columns.extend(kind.columns().into_iter().map(|c| (c, MONEY.to_string())));
    }
    columns.extend([
        (col::CONTRACT_TITLE.into(), TEXT.into()),
        (col::CONTRACT_VALUE.into(), MONEY.into()),
        (col::ABSORBED_PRIOR_YEARS.into(), MONEY.into()),
        (col::VENDOR.into(), TEXT.into()),
        (col::CONTRACT_NUMBER.into(), TEXT.into()),
        (col::SIGNED_ON.into(), DATE.into()),
        (col::STARTS_ON.into(), DATE.into()),
        (col::DURATION.into(), YEAR.into()),
        (col::DURATION_UNIT.into(), TEXT.into()),
        (col::ENDS_ON.into(), DATE.into()),
        (col::LATITUDE.into(), COORDINATE.into()),
        (col::LONGITUDE.into(), COORDINATE.into()),
        (col::METADATA.into(), "String".into()),
        (
            col::CREATED_AT.into(),
            "Nullable(DateTime64(6, 'UTC'))".into(),
        ),
        (col::UPDATED_AT.into(), "DateTime64(6, 'UTC')".into()),
        (col::VERSION.into(), "Int64".into()),
        (col::DELETED.into(), "UInt8".into()),
    ]);
    columns
}

/// Fully qualified, quoted table reference.
pub fn qualified(database: &str, table: &str) -> String {
    format!("{}.{}", quote_ch_ident(database), quote_ch_ident(table))
}

pub fn create_table(database: &str, table: &str) -> String {
    let mut definitions: Vec<String> = columns()
        .iter()
        .map(|(name, ty)| format!("    {} {}", quote_ch_ident(name), ty))
        .collect();
    for kind in SeriesKind::ALL {
        let sum = kind
            .columns()
            .iter()
            .map(|c| quote_ch_ident(c))
            .collect::<Vec<_>>()
            .join(" + ");
        definitions.push(format!(
            "    {} Decimal(38, 2) MATERIALIZED toDecimal128({}, 2)",
            quote_ch_ident(kind.total_column()),
            sum
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {}\n(\n{}\n)\nENGINE = ReplacingMergeTree({})\nORDER BY {}",
        qualified(database, table),
        definitions.join(",\n"),
        quote_ch_ident(col::VERSION),
        quote_ch_ident(col::ID)
    )
}

/// Grouping expression of a rollup dimension.
pub fn dimension_expr(dimension: RollupDimension) -> String {
    match dimension {
        RollupDimension::Region => quote_ch_ident(col::REGION),
        RollupDimension::Terminal => quote_ch_ident(col::TERMINAL),
        RollupDimension::BudgetYear => format!("toString({})", quote_ch_ident(col::BUDGET_YEAR)),
        RollupDimension::IssueStatus => format!("toString({})", quote_ch_ident(col::ISSUE_STATUS)),
        RollupDimension::InvestmentType => {
            format!("toString({})", quote_ch_ident(col::INVESTMENT_TYPE))
        }
    }
}

/// Aggregate over live rows grouped by a dimension.
pub fn rollup_select(database: &str, table: &str, dimension: RollupDimension) -> String {
    format!(
        "SELECT {} AS key, count() AS entities, \
         sum({}) AS planned, sum({}) AS actual, sum({}) AS forecast \
         FROM {} FINAL WHERE {} = 0 GROUP BY key ORDER BY key",
        dimension_expr(dimension),
        quote_ch_ident(SeriesKind::Planned.total_column()),
        quote_ch_ident(SeriesKind::Actual.total_column()),
        quote_ch_ident(SeriesKind::Forecast.total_column()),
        qualified(database, table),
        quote_ch_ident(col::DELETED)
    )
}

pub fn current_view_name(table: &str) -> String {
    format!("{}_current", table)
}

pub fn rollup_view_name(table: &str, dimension: RollupDimension) -> String {
    format!("{}_by_{}", table, dimension.as_str())
}

/// DDL statements, in execution order, for the table and every view.
pub fn statements(database: &str, table: &str) -> Vec<String> {
    let mut statements = vec![
        format!("CREATE DATABASE IF NOT EXISTS {}", quote_ch_ident(database)),
        create_table(database, table),
        format!(
            "CREATE VIEW IF NOT EXISTS {} AS SELECT * FROM {} FINAL WHERE {} = 0",
            qualified(database, &current_view_name(table)),
            qualified(database, table),
            quote_ch_ident(col::DELETED)
        ),
    ];
    for dimension in RollupDimension::ALL {
        statements.push(format!(
            "CREATE VIEW IF NOT EXISTS {} AS {}",
            qualified(database, &rollup_view_name(table, dimension)),
            rollup_select(database, table, dimension)
        ));
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_is_versioned_and_materializes_totals() {
        let ddl = create_table("analytics", "project_investasi");
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS `analytics`.`project_investasi`"));
        assert!(ddl.contains("ENGINE = ReplacingMergeTree(`_version`)"));
        assert!(ddl.contains("ORDER BY `id_root`"));
        assert!(ddl.contains(
            "`total_rkap_bulanan` Decimal(38, 2) MATERIALIZED toDecimal128(`rkap_januari` + "
        ));
        assert!(ddl.contains("`prognosa_sd_desember`, 2)"));
        assert!(ddl.contains("`_deleted` UInt8"));
    }

    #[test]
    fn test_views_filter_tombstones() {
        let statements = statements("analytics", "project_investasi");
        assert_eq!(statements.len(), 3 + RollupDimension::ALL.len());
        for view in &statements[2..] {
            assert!(view.contains("FINAL WHERE `_deleted` = 0"), "{}", view);
        }
        assert!(statements
            .iter()
            .any(|s| s.contains("`analytics`.`project_investasi_by_region`")));
    }

    #[test]
    fn test_column_list_matches_source_shape() {
        let names: Vec<String> = columns().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.first().map(String::as_str), Some("id_root"));
        assert_eq!(names.len(), 19 + 36 + 15 + 2);
    }
}
