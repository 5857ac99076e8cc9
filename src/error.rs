use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl CoreError {
    /// Whether a caller should retry with backoff instead of surfacing the error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Maps storage-level errors to the public taxonomy. Callers outside this
    /// crate never see raw sqlite error codes.
    pub fn into_public(self) -> Self {
        match self {
            Self::Sqlite(rusqlite::Error::QueryReturnedNoRows) => {
                Self::NotFound("record not found".to_string())
            }
            Self::Sqlite(err) => Self::Unavailable(err.to_string()),
            other => other,
        }
    }
}
