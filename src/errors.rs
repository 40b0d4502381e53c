use std::io;

use thiserror::Error;

/// Errors surfaced at the engine boundary.
///
/// Capacity failures (`NoSpace`, `BufferPoolFull`) are always propagated;
/// not-found conditions are returned to the caller without logging.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("no space left in the database file")]
    NoSpace,
    #[error("all buffer pool frames are pinned")]
    BufferPoolFull,
    #[error("object already exists")]
    AlreadyExist,
    #[error("object does not exist")]
    NotExist,
    #[error("table already exists")]
    TableAlreadyExist,
    #[error("table does not exist")]
    TableNotExist,
    #[error("index already exists")]
    IndexAlreadyExist,
    #[error("index not found")]
    IndexNotFound,
    #[error("column name does not exist")]
    ColumnNameNotExist,
    #[error("key not found")]
    KeyNotFound,
    #[error("quit")]
    Quit,
    #[error("operation failed")]
    Failed,
}

pub type DbResult<T> = Result<T, DbError>;
