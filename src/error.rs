//! Error types for media-allocator

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid transition for allocation {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: String,
        to: String,
    },

    #[error("Pickup link rejected: {0}")]
    Link(#[from] LinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AllocatorError {
    /// Whether the failed unit of work may be retried as a whole.
    ///
    /// Advisory only: nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocatorError::Busy(_) | AllocatorError::Constraint(_))
    }

    /// The link class if this error came out of pickup authorization
    pub fn link_class(&self) -> Option<LinkError> {
        match self {
            AllocatorError::Link(class) => Some(*class),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for AllocatorError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => AllocatorError::Constraint(err.to_string()),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                AllocatorError::Busy(err.to_string())
            }
            _ => AllocatorError::Database(err.to_string()),
        }
    }
}

/// Stable failure classes for pickup authorization.
///
/// Callers only ever see the class, never which individual check failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The link itself is past its lifetime; a fresh link may still work
    #[error("link expired")]
    Expired,

    #[error("forbidden")]
    Forbidden,

    /// The allocation can no longer be picked up
    #[error("gone")]
    Gone,
}

impl LinkError {
    /// "Try again" as opposed to "permanently gone"
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkError::Expired => "expired",
            LinkError::Forbidden => "forbidden",
            LinkError::Gone => "gone",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_unique_violation_maps_to_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        let err: AllocatorError = conn.execute("INSERT INTO t VALUES (1)", []).unwrap_err().into();
        assert!(matches!(err, AllocatorError::Constraint(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_link_classes() {
        assert!(LinkError::Expired.is_retryable());
        assert!(!LinkError::Forbidden.is_retryable());
        assert!(!LinkError::Gone.is_retryable());

        let err = AllocatorError::from(LinkError::Gone);
        assert_eq!(err.link_class(), Some(LinkError::Gone));
        assert_eq!(AllocatorError::Internal("x".into()).link_class(), None);
    }
}
