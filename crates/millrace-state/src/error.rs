//! Storage error types.

/// Errors produced by [`MetaStore`](crate::MetaStore) and
/// [`ObjectStore`](crate::ObjectStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded (e.g. the `inputs` JSON column).
    #[error("malformed row: {0}")]
    Encoding(#[from] serde_json::Error),

    /// No blob stored under this hash.
    #[error("object {hash} not found")]
    ObjectMissing { hash: String },

    /// Referenced step id does not exist.
    #[error("no step with id {0}")]
    UnknownStep(i64),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("metadata store lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_missing_names_hash() {
        let err = StateError::ObjectMissing {
            hash: "ab12".into(),
        };
        assert_eq!(err.to_string(), "object ab12 not found");
    }

    #[test]
    fn io_error_wraps() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StateError::Io(inner);
        assert!(err.to_string().contains("i/o"));
    }

    #[test]
    fn unknown_step_displays_id() {
        assert_eq!(StateError::UnknownStep(12).to_string(), "no step with id 12");
    }
}
