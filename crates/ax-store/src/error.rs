use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No row matched within the caller's organization.
    #[error("not found")]
    NotFound,
    /// A unique key collided (slug, email, env-var key).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows) => {
                StoreError::NotFound
            }
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.unwrap_or_else(|| "unique constraint".into()))
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::from(tokio_rusqlite::Error::Rusqlite(err))
    }
}
