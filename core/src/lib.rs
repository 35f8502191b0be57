//! Fleet scheduler core.
//!
//! Assigns queued jobs to a fleet of test machines, launches detached worker
//! processes to run them, supervises those workers through a pidfile
//! handshake that survives scheduler restarts, and escalates host failures
//! through verify, repair and reboot chains.
//!
//! Everything runs on one thread. [`dispatcher::Dispatcher::tick`] is the
//! whole control loop; parallelism lives in the worker processes.

pub mod agent;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod process;
pub mod runtime;
pub mod store;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SchedulerError, StoreError};
