//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the storage engine.
#[derive(Error, Debug)]
pub enum LsmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key not found")]
    NotFound,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transaction aborted")]
    Aborted,

    #[error("operation attempted after close")]
    Closed,

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, LsmError>;
