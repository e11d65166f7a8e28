//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for testmesh_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => testmesh_core::Error::NotFound(msg),
            other => testmesh_core::Error::Store(other.to_string()),
        }
    }
}
