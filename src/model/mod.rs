// ABOUTME: Data model for the sync engine
// ABOUTME: Change events, analytical records, transform/checksum and validation

pub mod event;
pub mod record;
pub mod transform;
pub mod validation;

pub use event::{decode_notification, ChangeEvent, ChangeOperation};
pub use record::{
    col, Contract, EntityRecord, InvestmentType, IssueStatus, MonthlySeries, SeriesKind, Version,
    MONTHS,
};
pub use transform::{checksum, transform, SourceRow};
pub use validation::{validate_record, Severity, ValidationIssue, ValidationReport};
