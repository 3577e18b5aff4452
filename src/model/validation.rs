// ABOUTME: Consistency checks over project records (financial totals, contract dates)
// ABOUTME: Reports issues; never blocks synchronization

use rust_decimal::Decimal;
use std::fmt;

use super::record::EntityRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub entity_id: String,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        write!(f, "[{}] {}: {}", tag, self.entity_id, self.message)
    }
}

/// Tolerance when comparing the planned total against its monthly breakdown.
const PLANNED_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Contract value may exceed the planned total by at most this factor.
const CONTRACT_HEADROOM: Decimal = Decimal::from_parts(11, 0, 0, false, 1);

/// Run every check against one record.
pub fn validate_record(record: &EntityRecord) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut push = |severity: Severity, message: String| {
        issues.push(ValidationIssue {
            entity_id: record.entity_id.clone(),
            severity,
            message,
        })
    };

    if record.entity_id.trim().is_empty() {
        push(Severity::Error, "required field 'id_root' is missing".into());
    }

    let planned_total = record.planned_total;
    let monthly_planned = record.planned.total();
    if planned_total > Decimal::ZERO && monthly_planned > Decimal::ZERO {
        let diff = (planned_total - monthly_planned).abs();
        if diff > PLANNED_TOLERANCE {
            push(
                Severity::Warning,
                format!(
                    "planned total ({}) does not match sum of monthly planned ({}), diff {}",
                    planned_total, monthly_planned, diff
                ),
            );
        }
    }

    let actual = record.actual.total();
    if planned_total > Decimal::ZERO && actual > planned_total {
        push(
            Severity::Warning,
            format!("actual spend ({}) exceeds planned total ({})", actual, planned_total),
        );
    }

    let contract_value = record.contract.value;
    if contract_value > Decimal::ZERO
        && planned_total > Decimal::ZERO
        && contract_value > planned_total * CONTRACT_HEADROOM
    {
        push(
            Severity::Warning,
            format!(
                "contract value ({}) is significantly higher than planned total ({})",
                contract_value, planned_total
            ),
        );
    }

    let contract = &record.contract;
    if let (Some(start), Some(end)) = (contract.starts_on, contract.ends_on) {
        if end < start {
            push(Severity::Error, "contract end date is before start date".into());
        }
    }
    if let (Some(signed), Some(start)) = (contract.signed_on, contract.starts_on) {
        if start < signed {
            push(
                Severity::Warning,
                "contract start date is before contract signing date".into(),
            );
        }
    }

    issues
}

/// Summary of a validation run over many records.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub checked: usize,
    pub with_errors: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn add(&mut self, record: &EntityRecord) {
        let issues = validate_record(record);
        self.checked += 1;
        if issues.iter().any(|i| i.severity == Severity::Error) {
            self.with_errors += 1;
        }
        self.issues.extend(issues);
    }

    /// Record a row that could not even be transformed.
    pub fn add_unmappable(&mut self, entity_id: &str, reason: String) {
        self.checked += 1;
        self.with_errors += 1;
        self.issues.push(ValidationIssue {
            entity_id: entity_id.to_string(),
            severity: Severity::Error,
            message: reason,
        });
    }

    pub fn is_valid(&self) -> bool {
        self.with_errors == 0
    }
}
