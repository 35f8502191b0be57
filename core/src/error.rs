use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    /// Non-transient failure reported by sqlite.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A transient failure that outlived the retry budget.
    #[error("store unavailable after {attempts} attempt(s): {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },
    #[error("row not found: {table} id={id}")]
    RowNotFound { table: &'static str, id: i64 },
    #[error("unknown field '{field}' on {table}")]
    UnknownField { table: &'static str, field: String },
    #[error("invalid value in {table}.{field}: {message}")]
    InvalidValue {
        table: &'static str,
        field: &'static str,
        message: String,
    },
    #[error("row from {table} has {got} columns, expected {expected}")]
    RowShape {
        table: &'static str,
        expected: usize,
        got: usize,
    },
}

// ---------------------------------------------------------------------------
// Scheduler errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// State the scheduler cannot repair on its own.
    #[error("scheduler invariant violated: {0}")]
    Invariant(String),
    #[error("failed to launch worker: {0}")]
    Launch(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("another scheduler holds the lock at {}", .0.display())]
    AlreadyRunning(PathBuf),
    #[error("daemon is no longer running")]
    DaemonStopped,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
