use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Upload offset mismatch: expected {expected}, got {got}")]
    OffsetConflict { expected: i64, got: i64 },

    #[error("Storage exhausted: {0}")]
    StorageExhausted(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify a failed write to the media store. A full device is a
    /// capacity condition that TUS reports as 413, not an internal
    /// fault.
    #[must_use]
    pub fn storage_write(err: std::io::Error) -> Self {
        // ENOSPC / EDQUOT
        let out_of_space = err.kind() == std::io::ErrorKind::StorageFull
            || matches!(err.raw_os_error(), Some(28 | 122));
        if out_of_space {
            Self::StorageExhausted(format!("Device storage full: {err}"))
        } else {
            Self::Io(err)
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            // Map "no rows" to NotFound
            sqlx::Error::RowNotFound => Self::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().unwrap_or_default();
                match code.as_ref() {
                    // SQLite SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
                    "2067" | "1555" => {
                        Self::AlreadyExists("Resource already exists".to_string())
                    }
                    // SQLITE_FULL
                    "13" => Self::StorageExhausted("Database storage full".to_string()),
                    _ => Self::Database(err),
                }
            }
            _ => Self::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn storage_full_write_errors_classify_as_exhaustion() {
        let err = Error::storage_write(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        assert!(matches!(err, Error::StorageExhausted(_)));

        let err = Error::storage_write(io::Error::from_raw_os_error(28));
        assert!(matches!(err, Error::StorageExhausted(_)));
    }

    #[test]
    fn other_write_errors_stay_io() {
        let err = Error::storage_write(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, Error::Io(_)));
    }
}
