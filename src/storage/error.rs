//! Storage-adapter-local error type. Narrower than [`crate::error::ErrorKind`]
//! — components map this onto the broader taxonomy at their boundary so SQL
//! and KV-backend details never leak past the adapter.

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("permanent storage error: {0}")]
    Permanent(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::NotFound(err.to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StorageError::Conflict(db_err.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StorageError::Transient(err.to_string())
            }
            _ => StorageError::Permanent(err.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
