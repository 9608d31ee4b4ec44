use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("core error: {0}")]
    Core(#[from] studyplan_core::CoreError),
}

impl StorageError {
    /// Busy/locked store errors. Safe to retry for idempotent operations only.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Map a unique/primary-key failure to `ConstraintViolation`, keep everything else.
pub(crate) fn classify(e: rusqlite::Error, what: impl FnOnce() -> String) -> StorageError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StorageError::ConstraintViolation(what())
        }
        other => StorageError::Sqlite(other),
    }
}
