// ABOUTME: Transform from the transactional row to the analytical record
// ABOUTME: Strict coercions (no float money, closed enums) and a content checksum

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use super::record::{
    col, Contract, EntityRecord, InvestmentType, IssueStatus, MonthlySeries, SeriesKind, MONEY_SCALE,
    MONTHS,
};
use crate::error::SyncError;

/// A row exactly as the transactional store returns it, before any coercion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceRow {
    pub entity_id: String,
    pub region: Option<String>,
    pub terminal: Option<String>,
    pub investment_id: Option<String>,
    pub project_definition: Option<String>,
    pub asset_category: Option<String>,
    pub investment_type: Option<String>,
    pub proposal_year: Option<i32>,
    pub budget_year: Option<i32>,
    pub investment_status: Option<String>,
    pub progress_description: Option<String>,
    pub issue_category: Option<String>,
    pub issue_description: Option<String>,
    pub action_target: Option<String>,
    pub head_office_support: Option<String>,
    pub pic: Option<String>,
    pub issue_status: Option<String>,
    pub funding_need: Option<Decimal>,
    pub planned_total: Option<Decimal>,
    pub planned: [Option<Decimal>; MONTHS],
    pub actual: [Option<Decimal>; MONTHS],
    pub forecast: [Option<Decimal>; MONTHS],
    pub contract_title: Option<String>,
    pub contract_value: Option<Decimal>,
    pub absorbed_prior_years: Option<Decimal>,
    pub vendor: Option<String>,
    pub contract_number: Option<String>,
    pub signed_on: Option<NaiveDate>,
    pub starts_on: Option<NaiveDate>,
    pub duration: Option<i32>,
    pub duration_unit: Option<String>,
    pub ends_on: Option<NaiveDate>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SourceRow {
    pub fn new(entity_id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            updated_at,
            ..Default::default()
        }
    }

    pub fn series(&self, kind: SeriesKind) -> &[Option<Decimal>; MONTHS] {
        match kind {
            SeriesKind::Planned => &self.planned,
            SeriesKind::Actual => &self.actual,
            SeriesKind::Forecast => &self.forecast,
        }
    }

    pub fn series_mut(&mut self, kind: SeriesKind) -> &mut [Option<Decimal>; MONTHS] {
        match kind {
            SeriesKind::Planned => &mut self.planned,
            SeriesKind::Actual => &mut self.actual,
            SeriesKind::Forecast => &mut self.forecast,
        }
    }
}

/// Map a source row onto the analytical record shape.
///
/// Monetary values keep their exact decimal value; a value that needs more
/// than [`MONEY_SCALE`] fractional digits is rejected instead of rounded.
/// A NULL amount is zero, which is how the source schema defaults it.
/// Enumerated text must name a member of the closed enumeration; NULL or
/// blank stays absent. Geo-coordinates stay NULL when NULL.
pub fn transform(row: &SourceRow) -> Result<EntityRecord, SyncError> {
    if row.entity_id.trim().is_empty() {
        return Err(SyncError::unmappable(col::ID, "<empty>"));
    }

    let investment_type = enum_text(&row.investment_type)
        .map(InvestmentType::from_label)
        .transpose()?;
    let issue_status = enum_text(&row.issue_status)
        .map(IssueStatus::from_label)
        .transpose()?;

    let mut record = EntityRecord {
        entity_id: row.entity_id.clone(),
        region: row.region.clone(),
        terminal: row.terminal.clone(),
        investment_id: row.investment_id.clone(),
        project_definition: row.project_definition.clone(),
        asset_category: row.asset_category.clone(),
        investment_type,
        proposal_year: row.proposal_year,
        budget_year: row.budget_year,
        investment_status: row.investment_status.clone(),
        progress_description: row.progress_description.clone(),
        issue_category: row.issue_category.clone(),
        issue_description: row.issue_description.clone(),
        action_target: row.action_target.clone(),
        head_office_support: row.head_office_support.clone(),
        pic: row.pic.clone(),
        issue_status,
        funding_need: money(col::FUNDING_NEED, row.funding_need)?,
        planned_total: money(col::PLANNED_TOTAL, row.planned_total)?,
        planned: MonthlySeries::default(),
        actual: MonthlySeries::default(),
        forecast: MonthlySeries::default(),
        contract: Contract {
            title: row.contract_title.clone(),
            value: money(col::CONTRACT_VALUE, row.contract_value)?,
            absorbed_prior_years: money(col::ABSORBED_PRIOR_YEARS, row.absorbed_prior_years)?,
            vendor: row.vendor.clone(),
            number: row.contract_number.clone(),
            signed_on: row.signed_on,
            starts_on: row.starts_on,
            duration: row.duration,
            duration_unit: row.duration_unit.clone(),
            ends_on: row.ends_on,
        },
        latitude: coordinate(col::LATITUDE, row.latitude, 90.0)?,
        longitude: coordinate(col::LONGITUDE, row.longitude, 180.0)?,
        metadata: row.metadata.clone().unwrap_or(serde_json::Value::Null),
        created_at: row.created_at,
        updated_at: row.updated_at,
    };

    for kind in SeriesKind::ALL {
        let raw = row.series(kind);
        let series = record.series_mut(kind);
        for (month, value) in raw.iter().enumerate() {
            series.set(month, money(&kind.column(month), *value)?);
        }
    }

    Ok(record)
}

fn enum_text(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn money(field: &str, value: Option<Decimal>) -> Result<Decimal, SyncError> {
    let Some(value) = value else {
        return Ok(Decimal::ZERO);
    };
    if value.normalize().scale() > MONEY_SCALE {
        return Err(SyncError::unmappable(field, value));
    }
    Ok(value)
}

fn coordinate(field: &str, value: Option<f64>, bound: f64) -> Result<Option<f64>, SyncError> {
    match value {
        None => Ok(None),
        Some(v) if v.is_finite() && v.abs() <= bound => Ok(Some(v)),
        Some(v) => Err(SyncError::unmappable(field, v)),
    }
}

/// Content checksum over every business field of the record.
///
/// The free-form metadata blob and the bookkeeping timestamps are excluded,
/// so two stores holding the same business content agree even when their
/// audit columns differ. Decimals are normalized (`10.5 == 10.50`).
pub fn checksum(record: &EntityRecord) -> String {
    let mut hasher = Sha256::new();
    let mut field = |name: &str, value: Option<String>| {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        match value {
            Some(v) => {
                hasher.update([1]);
                hasher.update(v.as_bytes());
            }
            None => hasher.update([0]),
        }
        hasher.update([0x1e]);
    };

    let text = |v: &Option<String>| v.clone();
    let amount = |v: Decimal| Some(v.normalize().to_string());
    let date = |v: Option<NaiveDate>| v.map(|d| d.format("%Y-%m-%d").to_string());
    let float = |v: Option<f64>| v.map(|f| format!("{:.7}", f));

    field(col::ID, Some(record.entity_id.clone()));
    field(col::REGION, text(&record.region));
    field(col::TERMINAL, text(&record.terminal));
    field(col::INVESTMENT_ID, text(&record.investment_id));
    field(col::PROJECT_DEFINITION, text(&record.project_definition));
    field(col::ASSET_CATEGORY, text(&record.asset_category));
    field(
        col::INVESTMENT_TYPE,
        record.investment_type.map(|t| t.label().to_string()),
    );
    field(col::PROPOSAL_YEAR, record.proposal_year.map(|y| y.to_string()));
    field(col::BUDGET_YEAR, record.budget_year.map(|y| y.to_string()));
    field(col::INVESTMENT_STATUS, text(&record.investment_status));
    field(col::PROGRESS_DESCRIPTION, text(&record.progress_description));
    field(col::ISSUE_CATEGORY, text(&record.issue_category));
    field(col::ISSUE_DESCRIPTION, text(&record.issue_description));
    field(col::ACTION_TARGET, text(&record.action_target));
    field(col::HEAD_OFFICE_SUPPORT, text(&record.head_office_support));
    field(col::PIC, text(&record.pic));
    field(
        col::ISSUE_STATUS,
        record.issue_status.map(|s| s.label().to_string()),
    );
    field(col::FUNDING_NEED, amount(record.funding_need));
    field(col::PLANNED_TOTAL, amount(record.planned_total));
    for kind in SeriesKind::ALL {
        for (month, value) in record.series(kind).values().iter().enumerate() {
            field(&kind.column(month), amount(*value));
        }
    }
    let contract = &record.contract;
    field(col::CONTRACT_TITLE, text(&contract.title));
    field(col::CONTRACT_VALUE, amount(contract.value));
    field(col::ABSORBED_PRIOR_YEARS, amount(contract.absorbed_prior_years));
    field(col::VENDOR, text(&contract.vendor));
    field(col::CONTRACT_NUMBER, text(&contract.number));
    field(col::SIGNED_ON, date(contract.signed_on));
    field(col::STARTS_ON, date(contract.starts_on));
    field(col::DURATION, contract.duration.map(|d| d.to_string()));
    field(col::DURATION_UNIT, text(&contract.duration_unit));
    field(col::ENDS_ON, date(contract.ends_on));
    field(col::LATITUDE, float(record.latitude));
    field(col::LONGITUDE, float(record.longitude));

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn sample_row() -> SourceRow {
        let mut row = SourceRow::new("PRJ-7", Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap());
        row.region = Some("Regional 2".into());
        row.investment_type = Some("Multi Year".into());
        row.issue_status = Some("Open".into());
        row.planned_total = Some(dec("1200.00"));
        row.planned[0] = Some(dec("100.25"));
        row.actual[11] = Some(dec("99999999999999.99"));
        row.latitude = Some(-6.1);
        row
    }

    #[test]
    fn test_transform_keeps_exact_money() {
        let record = transform(&sample_row()).unwrap();
        assert_eq!(record.planned.get(0), dec("100.25"));
        assert_eq!(record.actual.get(11), dec("99999999999999.99"));
        assert_eq!(record.actual.get(0), Decimal::ZERO);
        assert_eq!(record.investment_type, Some(InvestmentType::MultiYear));
        assert_eq!(record.longitude, None);
    }

    #[test]
    fn test_transform_rejects_unknown_enum_instead_of_defaulting() {
        let mut row = sample_row();
        row.investment_type = Some("Hibah".into());
        let err = transform(&row).unwrap_err();
        match err {
            SyncError::UnmappableValue { field, value } => {
                assert_eq!(field, col::INVESTMENT_TYPE);
                assert_eq!(value, "Hibah");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_transform_blank_enum_stays_absent() {
        let mut row = sample_row();
        row.issue_status = Some("  ".into());
        assert_eq!(transform(&row).unwrap().issue_status, None);
    }

    #[test]
    fn test_transform_rejects_excess_precision() {
        let mut row = sample_row();
        row.forecast[3] = Some(dec("1.005"));
        assert!(matches!(
            transform(&row),
            Err(SyncError::UnmappableValue { ref field, .. }) if field == "prognosa_april"
        ));

        // Trailing zeros are not extra precision.
        row.forecast[3] = Some(dec("1.0000"));
        assert!(transform(&row).is_ok());
    }

    #[test]
    fn test_transform_rejects_out_of_range_coordinates() {
        let mut row = sample_row();
        row.longitude = Some(200.0);
        assert!(transform(&row).is_err());
    }

    #[test]
    fn test_checksum_ignores_metadata_and_scale() {
        let a = transform(&sample_row()).unwrap();
        let mut b = a.clone();
        b.metadata = serde_json::json!({"note": "ignored"});
        b.planned_total = dec("1200");
        b.updated_at = Utc::now();
        assert_eq!(checksum(&a), checksum(&b));

        b.pic = Some("someone".into());
        assert_ne!(checksum(&a), checksum(&b));
    }

    #[test]
    fn test_checksum_distinguishes_null_from_empty() {
        let a = transform(&sample_row()).unwrap();
        let mut b = a.clone();
        b.terminal = Some(String::new());
        assert_ne!(checksum(&a), checksum(&b));
    }
}
