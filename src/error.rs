//! Error types for the indexing pipeline
//!
//! Every handler, store helper and aggregation step returns `Result<T>`.
//! The block processor decides what to do with a failure based on its kind:
//!
//! - `InvalidEventData` / `NotImplemented` are recovered locally: the offending
//!   event is logged, written to the `errors` table and skipped.
//! - Everything else aborts the block. The transaction rolls back and the block
//!   stays queued for retry.

use crate::events::EventTag;
use rusqlite::ErrorCode;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Debug)]
pub enum IndexerError {
    /// Payload does not match the shape bound to its tag
    InvalidEventData { tag: EventTag, reason: String },
    /// A row a handler depends on is missing
    NotFound { entity: &'static str, id: String },
    /// An `ON CONFLICT` upsert raised instead of resolving the conflict
    ConflictingUpdate {
        table: &'static str,
        source: rusqlite::Error,
    },
    /// Busy/locked database or an expired block deadline
    TransientStorage(String),
    InvariantViolation(String),
    NotImplemented(String),
    /// The ingestion task is gone; nothing more can be submitted
    ChannelClosed,
    Storage(rusqlite::Error),
    Serialization(serde_json::Error),
    Io(std::io::Error),
}

impl IndexerError {
    pub fn invalid_data(tag: EventTag, reason: impl Into<String>) -> Self {
        IndexerError::InvalidEventData {
            tag,
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        IndexerError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True when the failure only affects the event being handled
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IndexerError::InvalidEventData { .. } | IndexerError::NotImplemented(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::TransientStorage(_))
    }

    /// Error mapper for upsert statements on `table`
    pub(crate) fn upsert(table: &'static str) -> impl FnOnce(rusqlite::Error) -> IndexerError {
        move |err| {
            if is_constraint(&err) {
                IndexerError::ConflictingUpdate { table, source: err }
            } else {
                IndexerError::from(err)
            }
        }
    }
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    is_constraint(err)
}

impl From<rusqlite::Error> for IndexerError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::OperationInterrupted
                ) =>
            {
                IndexerError::TransientStorage(err.to_string())
            }
            _ => IndexerError::Storage(err),
        }
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        IndexerError::Serialization(err)
    }
}

impl From<std::io::Error> for IndexerError {
    fn from(err: std::io::Error) -> Self {
        IndexerError::Io(err)
    }
}

impl std::fmt::Display for IndexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexerError::InvalidEventData { tag, reason } => {
                write!(f, "invalid event data for {}: {}", tag.as_str(), reason)
            }
            IndexerError::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            IndexerError::ConflictingUpdate { table, source } => {
                write!(f, "conflicting update on {}: {}", table, source)
            }
            IndexerError::TransientStorage(msg) => write!(f, "transient storage error: {}", msg),
            IndexerError::InvariantViolation(msg) => write!(f, "invariant violated: {}", msg),
            IndexerError::NotImplemented(what) => write!(f, "not implemented: {}", what),
            IndexerError::ChannelClosed => write!(f, "pipeline channel closed"),
            IndexerError::Storage(e) => write!(f, "storage error: {}", e),
            IndexerError::Serialization(e) => write!(f, "serialization error: {}", e),
            IndexerError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for IndexerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IndexerError::ConflictingUpdate { source, .. } => Some(source),
            IndexerError::Storage(e) => Some(e),
            IndexerError::Serialization(e) => Some(e),
            IndexerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_transient() {
        // Test: SQLITE_BUSY is classified as transient storage failure
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let mapped = IndexerError::from(err);
        assert!(mapped.is_transient());
        assert!(!mapped.is_recoverable());
    }

    #[test]
    fn test_constraint_on_upsert_is_conflict() {
        // Test: constraint failures inside upserts surface as ConflictingUpdate
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        let mapped = IndexerError::upsert("blobbers")(err);
        assert!(matches!(
            mapped,
            IndexerError::ConflictingUpdate { table: "blobbers", .. }
        ));
    }

    #[test]
    fn test_recoverable_kinds() {
        // Test: only decode and coverage failures are skippable
        assert!(IndexerError::invalid_data(EventTag::AddBlobber, "bad").is_recoverable());
        assert!(IndexerError::NotImplemented("x".into()).is_recoverable());
        assert!(!IndexerError::not_found("allocation", "a1").is_recoverable());
        assert!(!IndexerError::InvariantViolation("x".into()).is_recoverable());
    }
}
