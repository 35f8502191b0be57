//! Sqlite connection with transparent retry.
//!
//! Busy and locked databases are expected when the frontend writes at the
//! same time; I/O failures usually mean the file handle went stale. Both are
//! retried under the configured [`RetryPolicy`] so nothing above this layer
//! ever sees them unless the budget runs out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use tracing::warn;

use crate::error::StoreError;
use crate::store::retry::RetryPolicy;


#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}


pub struct Connector {
    location: Location,
    conn: Connection,
    retry: RetryPolicy,
}


impl Connector {
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Connector, StoreError> {
        let conn = open_file(path)?;
        Ok(Connector {
            location: Location::File(path.to_path_buf()),
            conn,
            retry,
        })
    }

    pub fn open_in_memory() -> Result<Connector, StoreError> {
        Ok(Connector {
            location: Location::Memory,
            conn: Connection::open_in_memory()?,
            retry: RetryPolicy::none(),
        })
    }

    /// Run `op`, retrying transient failures with backoff.
    fn with_retry<T>(
        &mut self,
        sql: &str,
        mut op: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            let err = match op(&self.conn) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let kind = classify(&err);
            if kind == Failure::Permanent {
                return Err(StoreError::Sqlite(err));
            }
            if !self.retry.should_retry(attempt) {
                return Err(StoreError::Unavailable {
                    attempts: attempt + 1,
                    source: err,
                });
            }
            let delay = self.retry.delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, sql, "transient store failure, retrying");
            std::thread::sleep(delay);
            if kind == Failure::Connection {
                self.reconnect()?;
            }
            attempt += 1;
        }
    }

    fn reconnect(&mut self) -> Result<(), StoreError> {
        if let Location::File(path) = &self.location {
            self.conn = open_file(path)?;
        }
        Ok(())
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<(), StoreError> {
        self.with_retry(sql, |conn| conn.execute_batch(sql))
    }

    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, StoreError> {
        self.with_retry(sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            stmt.execute(params_from_iter(params.iter()))
        })
    }

    /// Insert and return the new rowid.
    pub fn insert(&mut self, sql: &str, params: &[Value]) -> Result<i64, StoreError> {
        self.with_retry(sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            stmt.insert(params_from_iter(params.iter()))
        })
    }

    /// Run a query and return every row as raw values.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>, StoreError> {
        self.with_retry(sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let width = stmt.column_count();
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                (0..width)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })?;
            rows.collect()
        })
    }
}


/// Sqlite's own busy handler is disabled so the retry policy alone decides
/// how long to wait.
fn open_file(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::ZERO)?;
    Ok(conn)
}


#[derive(Debug, PartialEq, Eq)]
enum Failure {
    /// Another writer holds the database; wait and try again.
    Contention,
    /// The handle went bad; reopen before trying again.
    Connection,
    Permanent,
}


fn classify(err: &rusqlite::Error) -> Failure {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Failure::Contention,
            ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => Failure::Connection,
            _ => Failure::Permanent,
        },
        _ => Failure::Permanent,
    }
}
