// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Classifies failures into transient, per-entity and benign outcomes

use thiserror::Error;

/// Errors produced by the store contracts and sync engines.
///
/// Orchestration code (CLI, daemon, state files) uses `anyhow`; this enum is
/// for failures the engines must classify, because the classification decides
/// whether an entity is retried, reinterpreted or silently ignored.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection drop, timeout, or unreachable store. Retried with backoff.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// A change notification payload that could not be decoded.
    #[error("malformed change event: {0}")]
    MalformedEvent(String),

    /// A source value with no valid representation in the analytical schema.
    #[error("unmappable value for {field}: {value}")]
    UnmappableValue { field: String, value: String },

    /// The entity no longer exists in the transactional store.
    #[error("entity {0} not found in source")]
    NotFound(String),

    /// An upsert older than the stored version. Expected under reordering.
    #[error("version conflict for {entity_id}: incoming {incoming} <= stored {stored}")]
    VersionConflict {
        entity_id: String,
        incoming: i64,
        stored: i64,
    },

    /// No watermark has ever been saved.
    #[error("watermark store has not been initialized")]
    NotInitialized,

    /// Another sync path currently owns the watermark.
    #[error("sync mode conflict: {0}")]
    ModeConflict(String),

    /// Non-transient store failure (bad query, schema mismatch).
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn unmappable(field: &str, value: impl ToString) -> Self {
        SyncError::UnmappableValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    /// Whether the failure is worth retrying without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientIo(_))
    }

    /// Short machine-friendly label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::TransientIo(_) => "transient_io",
            SyncError::MalformedEvent(_) => "malformed_event",
            SyncError::UnmappableValue { .. } => "unmappable_value",
            SyncError::NotFound(_) => "not_found",
            SyncError::VersionConflict { .. } => "version_conflict",
            SyncError::NotInitialized => "not_initialized",
            SyncError::ModeConflict(_) => "mode_conflict",
            SyncError::Storage(_) => "storage",
        }
    }
}

impl From<tokio_postgres::Error> for SyncError {
    fn from(err: tokio_postgres::Error) -> Self {
        // A closed connection or I/O failure surfaces without a SQLSTATE.
        if err.is_closed() || err.code().is_none() {
            SyncError::TransientIo(err.to_string())
        } else {
            SyncError::Storage(err.to_string())
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            SyncError::TransientIo(err.to_string())
        } else {
            SyncError::Storage(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        SyncError::TransientIo(format!("timed out: {}", err))
    }
}

pub type StoreResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::TransientIo("reset".into()).is_transient());
        assert!(!SyncError::NotFound("A".into()).is_transient());
        assert!(!SyncError::unmappable("type_investasi", "Bogus").is_transient());
    }

    #[test]
    fn test_unmappable_message() {
        let err = SyncError::unmappable("status_issue", "Pending");
        assert_eq!(err.to_string(), "unmappable value for status_issue: Pending");
        assert_eq!(err.kind(), "unmappable_value");
    }
}
