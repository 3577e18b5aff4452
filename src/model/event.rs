// ABOUTME: ChangeEvent types and the change-notification payload decoder
// ABOUTME: Events are latency hints; durability comes from the watermark

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::error::SyncError;

/// Row-level operation reported by the source trigger.
///
/// Variants are declared in ascending severity so that `Ord` gives
/// `Insert < Update < Delete`; the dispatcher keeps the most severe one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SyncError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeOperation::Insert),
            "UPDATE" => Ok(ChangeOperation::Update),
            "DELETE" => Ok(ChangeOperation::Delete),
            other => Err(SyncError::MalformedEvent(format!(
                "unknown operation '{}'",
                other
            ))),
        }
    }

    /// Keep whichever of the two operations is more severe.
    pub fn merge(self, other: ChangeOperation) -> ChangeOperation {
        self.max(other)
    }
}

/// A decoded change notification. Immutable and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub entity_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(operation: ChangeOperation, entity_id: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            operation,
            entity_id: entity_id.into(),
            occurred_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    operation: String,
    id_root: Option<String>,
    timestamp: String,
}

/// Decode a `{"operation", "id_root", "timestamp"}` notification payload.
pub fn decode_notification(payload: &str) -> Result<ChangeEvent, SyncError> {
    let raw: NotificationPayload = serde_json::from_str(payload)
        .map_err(|e| SyncError::MalformedEvent(format!("invalid JSON: {}", e)))?;

    let entity_id = raw
        .id_root
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SyncError::MalformedEvent("missing id_root".to_string()))?;

    let operation = ChangeOperation::parse(&raw.operation)?;
    let occurred_at = parse_timestamp(&raw.timestamp)?;

    Ok(ChangeEvent {
        operation,
        entity_id,
        occurred_at,
    })
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, SyncError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    // PostgreSQL's row_to_json renders timestamptz as "2025-03-01T10:00:00.5+07:00"
    // and plain timestamp without any offset.
    if let Ok(ts) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%#z") {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(SyncError::MalformedEvent(format!(
        "unparseable timestamp '{}'",
        value
    )))
}
