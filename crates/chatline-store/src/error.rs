//! Store Error Types
//!
//! All store operations return `Result<T>`, aliased to `Result<T, StoreError>`.
//!
//! Callers above the store (the batch writers) need to know whether an error is
//! worth retrying. Two helpers answer that without exposing driver details:
//!
//! - [`StoreError::is_transient`]: the database could not be reached or was
//!   momentarily busy (I/O, pool timeout, closed pool, protocol error, lock
//!   contention, serialization failure). The same batch may succeed later.
//! - [`StoreError::is_integrity_violation`]: the database rejected the data
//!   itself (unique, foreign key, not-null or check constraint). Retrying the
//!   same rows can never succeed.
//!
//! Anything else is neither; writers treat it as unknown.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationError(e.to_string())
    }
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::DatabaseError(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db.code().map(|c| is_transient_code(&c)).unwrap_or(false),
                _ => false,
            },
            _ => false,
        }
    }

    pub fn is_integrity_violation(&self) -> bool {
        use sqlx::error::ErrorKind;

        match self {
            StoreError::DatabaseError(sqlx::Error::Database(db)) => matches!(
                db.kind(),
                ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation
            ),
            _ => false,
        }
    }
}

/// Driver codes that mean "try again later"
///
/// PostgreSQL reports SQLSTATE strings, SQLite reports (extended) result codes
/// as decimal strings.
fn is_transient_code(code: &str) -> bool {
    // 08xxx connection exception, 40001 serialization failure, 40P01 deadlock,
    // 53300 too many connections, 57P01..57P03 server shutting down
    if code.starts_with("08") || code.starts_with("57P") {
        return true;
    }
    if matches!(code, "40001" | "40P01" | "53300") {
        return true;
    }
    // Every SQLSTATE has five characters, SQLite result codes stay below 10000
    if code.len() == 5 {
        return false;
    }
    // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended variants
    match code.parse::<i32>() {
        Ok(n) => matches!(n & 0xff, 5 | 6),
        Err(_) => false,
    }
}
