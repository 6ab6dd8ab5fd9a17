//! State store error types.

/// Errors produced by [`StateStore`](crate::StateStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure with the failing operation named.
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state store lock poisoned")]
    LockPoisoned,

    /// `add_batch` was called with an id that is already tracked.
    #[error("batch `{0}` already tracked")]
    BatchExists(String),

    /// `add_batch` was called with a key that is already in flight.
    #[error("record `{0}` is already in flight")]
    RecordInflight(String),

    /// `finalize_batch` was called on a batch that is not active.
    #[error("batch `{0}` is not active")]
    BatchNotActive(String),
}

impl StateError {
    /// Wrap a `SQLite` error with the name of the failing operation.
    pub fn backend_context(context: &'static str, source: rusqlite::Error) -> Self {
        Self::Backend { context, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_context_names_operation() {
        let inner = rusqlite::Error::QueryReturnedNoRows;
        let err = StateError::backend_context("add_batch: insert membership", inner);
        assert!(err.to_string().contains("add_batch"));
    }

    #[test]
    fn conflict_variants_display() {
        assert_eq!(
            StateError::BatchExists("b1".into()).to_string(),
            "batch `b1` already tracked"
        );
        assert_eq!(
            StateError::RecordInflight("AL:H:1849:1".into()).to_string(),
            "record `AL:H:1849:1` is already in flight"
        );
        assert_eq!(
            StateError::BatchNotActive("b2".into()).to_string(),
            "batch `b2` is not active"
        );
    }

    #[test]
    fn lock_poisoned_displays() {
        assert_eq!(
            StateError::LockPoisoned.to_string(),
            "state store lock poisoned"
        );
    }
}
