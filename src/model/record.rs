// ABOUTME: EntityRecord - the analytical shape of one project row
// ABOUTME: Monthly money is modelled as three named 12-slot fixed-point series

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SyncError;

pub const MONTHS: usize = 12;

/// Scale of every monetary column in the analytical table (`Decimal(20, 2)`).
pub const MONEY_SCALE: u32 = 2;

/// Month suffixes used by the shared column naming scheme.
pub const MONTH_NAMES: [&str; MONTHS] = [
    "januari",
    "februari",
    "maret",
    "april",
    "mei",
    "juni",
    "juli",
    "agustus",
    "september",
    "oktober",
    "november",
    "desember",
];

/// Column names shared by the source table and the analytical table.
pub mod col {
    pub const ID: &str = "id_root";
    pub const REGION: &str = "klaster_regional";
    pub const TERMINAL: &str = "entitas_terminal";
    pub const INVESTMENT_ID: &str = "id_investasi";
    pub const PROJECT_DEFINITION: &str = "project_definition";
    pub const ASSET_CATEGORY: &str = "asset_categories";
    pub const INVESTMENT_TYPE: &str = "type_investasi";
    pub const PROPOSAL_YEAR: &str = "tahun_usulan";
    pub const BUDGET_YEAR: &str = "tahun_rkap";
    pub const INVESTMENT_STATUS: &str = "status_investasi";
    pub const PROGRESS_DESCRIPTION: &str = "progres_description";
    pub const ISSUE_CATEGORY: &str = "issue_categories";
    pub const ISSUE_DESCRIPTION: &str = "issue_description";
    pub const ACTION_TARGET: &str = "action_target";
    pub const HEAD_OFFICE_SUPPORT: &str = "head_office_support_desc";
    pub const PIC: &str = "pic";
    pub const ISSUE_STATUS: &str = "status_issue";
    pub const FUNDING_NEED: &str = "kebutuhan_dana";
    pub const PLANNED_TOTAL: &str = "rkap";
    pub const CONTRACT_TITLE: &str = "judul_kontrak";
    pub const CONTRACT_VALUE: &str = "nilai_kontrak";
    pub const ABSORBED_PRIOR_YEARS: &str = "penyerapan_sd_tahun_lalu";
    pub const VENDOR: &str = "penyedia_jasa";
    pub const CONTRACT_NUMBER: &str = "no_kontrak";
    pub const SIGNED_ON: &str = "tanggal_kontrak";
    pub const STARTS_ON: &str = "tgl_mulai_kontrak";
    pub const DURATION: &str = "jangka_waktu";
    pub const DURATION_UNIT: &str = "satuan_hari";
    pub const ENDS_ON: &str = "tanggal_selesai";
    pub const LATITUDE: &str = "latitude";
    pub const LONGITUDE: &str = "longitude";
    pub const METADATA: &str = "metadata";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    /// Analytical-only: version token (microseconds of `updated_at`).
    pub const VERSION: &str = "_version";
    /// Analytical-only: tombstone flag.
    pub const DELETED: &str = "_deleted";
}

/// Version token carried by every analytical row: `updated_at` in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub i64);

impl Version {
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Version(ts.timestamp_micros())
    }

    pub fn to_timestamp(self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.0).unwrap_or_default()
    }

    /// The smallest version strictly newer than this one.
    pub fn next(self) -> Self {
        Version(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three monthly monetary series of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeriesKind {
    /// Planned budget (RKAP).
    Planned,
    /// Actual spend (realisasi).
    Actual,
    /// Forecast (prognosa).
    Forecast,
}

impl SeriesKind {
    pub const ALL: [SeriesKind; 3] = [SeriesKind::Planned, SeriesKind::Actual, SeriesKind::Forecast];

    pub fn prefix(&self) -> &'static str {
        match self {
            SeriesKind::Planned => "rkap",
            SeriesKind::Actual => "realisasi",
            SeriesKind::Forecast => "prognosa",
        }
    }

    /// Column holding month `month` (0-based) of this series.
    pub fn column(&self, month: usize) -> String {
        match (self, month) {
            // The forecast's last slot is a year-to-December figure.
            (SeriesKind::Forecast, 11) => "prognosa_sd_desember".to_string(),
            _ => format!("{}_{}", self.prefix(), MONTH_NAMES[month]),
        }
    }

    pub fn columns(&self) -> Vec<String> {
        (0..MONTHS).map(|m| self.column(m)).collect()
    }

    /// Materialized sum column in the analytical table.
    pub fn total_column(&self) -> &'static str {
        match self {
            SeriesKind::Planned => "total_rkap_bulanan",
            SeriesKind::Actual => "total_realisasi",
            SeriesKind::Forecast => "total_prognosa",
        }
    }
}

/// A fixed-length ordered sequence of fixed-point monthly amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonthlySeries(pub [Decimal; MONTHS]);

impl MonthlySeries {
    pub fn new(values: [Decimal; MONTHS]) -> Self {
        Self(values)
    }

    pub fn get(&self, month: usize) -> Decimal {
        self.0[month]
    }

    pub fn set(&mut self, month: usize, value: Decimal) {
        self.0[month] = value;
    }

    pub fn values(&self) -> &[Decimal; MONTHS] {
        &self.0
    }

    pub fn total(&self) -> Decimal {
        self.0.iter().copied().sum()
    }
}

/// Closed enumeration of investment types accepted by the analytical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InvestmentType {
    Murni,
    MultiYear,
    CarryForward,
}

impl InvestmentType {
    pub const ALL: [InvestmentType; 3] = [
        InvestmentType::Murni,
        InvestmentType::MultiYear,
        InvestmentType::CarryForward,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            InvestmentType::Murni => "Murni",
            InvestmentType::MultiYear => "Multi Year",
            InvestmentType::CarryForward => "Carry Forward",
        }
    }

    pub fn from_label(value: &str) -> Result<Self, SyncError> {
        Self::ALL
            .into_iter()
            .find(|t| t.label() == value)
            .ok_or_else(|| SyncError::unmappable(col::INVESTMENT_TYPE, value))
    }
}

/// Closed enumeration of issue states accepted by the analytical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IssueStatus {
    Open,
    Closed,
}

impl IssueStatus {
    pub fn label(&self) -> &'static str {
        match self {
            IssueStatus::Open => "Open",
            IssueStatus::Closed => "Closed",
        }
    }

    pub fn from_label(value: &str) -> Result<Self, SyncError> {
        match value {
            "Open" => Ok(IssueStatus::Open),
            "Closed" => Ok(IssueStatus::Closed),
            other => Err(SyncError::unmappable(col::ISSUE_STATUS, other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Contract {
    pub title: Option<String>,
    pub value: Decimal,
    pub absorbed_prior_years: Decimal,
    pub vendor: Option<String>,
    pub number: Option<String>,
    pub signed_on: Option<NaiveDate>,
    pub starts_on: Option<NaiveDate>,
    pub duration: Option<i32>,
    pub duration_unit: Option<String>,
    pub ends_on: Option<NaiveDate>,
}

/// One project in the analytical shape, keyed by `entity_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub entity_id: String,
    pub region: Option<String>,
    pub terminal: Option<String>,
    pub investment_id: Option<String>,
    pub project_definition: Option<String>,
    pub asset_category: Option<String>,
    pub investment_type: Option<InvestmentType>,
    pub proposal_year: Option<i32>,
    pub budget_year: Option<i32>,
    pub investment_status: Option<String>,
    pub progress_description: Option<String>,
    pub issue_category: Option<String>,
    pub issue_description: Option<String>,
    pub action_target: Option<String>,
    pub head_office_support: Option<String>,
    pub pic: Option<String>,
    pub issue_status: Option<IssueStatus>,
    pub funding_need: Decimal,
    pub planned_total: Decimal,
    pub planned: MonthlySeries,
    pub actual: MonthlySeries,
    pub forecast: MonthlySeries,
    pub contract: Contract,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub metadata: serde_json::Value,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    /// A record carrying nothing but its identity, used as a tombstone body
    /// when the analytical store never held the entity.
    pub fn bare(entity_id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            region: None,
            terminal: None,
            investment_id: None,
            project_definition: None,
            asset_category: None,
            investment_type: None,
            proposal_year: None,
            budget_year: None,
            investment_status: None,
            progress_description: None,
            issue_category: None,
            issue_description: None,
            action_target: None,
            head_office_support: None,
            pic: None,
            issue_status: None,
            funding_need: Decimal::ZERO,
            planned_total: Decimal::ZERO,
            planned: MonthlySeries::default(),
            actual: MonthlySeries::default(),
            forecast: MonthlySeries::default(),
            contract: Contract::default(),
            latitude: None,
            longitude: None,
            metadata: serde_json::Value::Null,
            created_at: None,
            updated_at,
        }
    }

    pub fn version(&self) -> Version {
        Version::from_timestamp(self.updated_at)
    }

    pub fn series(&self, kind: SeriesKind) -> &MonthlySeries {
        match kind {
            SeriesKind::Planned => &self.planned,
            SeriesKind::Actual => &self.actual,
            SeriesKind::Forecast => &self.forecast,
        }
    }

    pub fn series_mut(&mut self, kind: SeriesKind) -> &mut MonthlySeries {
        match kind {
            SeriesKind::Planned => &mut self.planned,
            SeriesKind::Actual => &mut self.actual,
            SeriesKind::Forecast => &mut self.forecast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn test_series_column_names() {
        assert_eq!(SeriesKind::Planned.column(0), "rkap_januari");
        assert_eq!(SeriesKind::Actual.column(4), "realisasi_mei");
        assert_eq!(SeriesKind::Forecast.column(10), "prognosa_november");
        assert_eq!(SeriesKind::Forecast.column(11), "prognosa_sd_desember");
        assert_eq!(SeriesKind::Planned.columns().len(), MONTHS);
    }

    #[test]
    fn test_series_total_is_exact() {
        let mut series = MonthlySeries::default();
        for m in 0..MONTHS {
            series.set(m, dec("0.10"));
        }
        assert_eq!(series.total(), dec("1.20"));
    }

    #[test]
    fn test_enum_labels_round_trip_and_reject_unknown() {
        for t in InvestmentType::ALL {
            assert_eq!(InvestmentType::from_label(t.label()).unwrap(), t);
        }
        assert!(matches!(
            InvestmentType::from_label("murni"),
            Err(SyncError::UnmappableValue { .. })
        ));
        assert_eq!(IssueStatus::from_label("Closed").unwrap(), IssueStatus::Closed);
        assert!(IssueStatus::from_label("Pending").is_err());
    }

    #[test]
    fn test_version_ordering_and_next() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let v = Version::from_timestamp(ts);
        assert!(v.next() > v);
        assert_eq!(v.to_timestamp(), ts);
    }
}
