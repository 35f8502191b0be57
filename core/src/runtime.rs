//! Everything a task, agent or model method needs to act on the world.
//!
//! One `Runtime` is threaded by `&mut` through the whole tick. It owns the
//! store, the outgoing mail queue and the external seams (clock, launcher,
//! process table, results parser), so tests swap in mocks at construction.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::notify::{LogMailer, NotificationSink};
use crate::process::{LocalProcessTable, ProcessTable};
use crate::store::Store;
use crate::worker::{parser, ProcessLauncher, ResultsParser, WorkerLauncher, WorkerMode};


/// Countdown for an atomic group job waiting for more hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyDelay {
    pub end_time: DateTime<Utc>,
    pub cancelled: bool,
}


pub struct Runtime {
    pub store: Store,
    pub mail: NotificationSink,
    pub config: SchedulerConfig,
    pub clock: Box<dyn Clock>,
    pub launcher: Box<dyn WorkerLauncher>,
    pub processes: Box<dyn ProcessTable>,
    pub parser: Box<dyn ResultsParser>,
    /// Keyed by job id.
    pub ready_delays: HashMap<i64, ReadyDelay>,
    run_counter: u64,
}

impl Runtime {
    pub fn new(
        store: Store,
        config: SchedulerConfig,
        mail: NotificationSink,
        clock: Box<dyn Clock>,
        launcher: Box<dyn WorkerLauncher>,
        processes: Box<dyn ProcessTable>,
        parser: Box<dyn ResultsParser>,
    ) -> Runtime {
        Runtime {
            store,
            mail,
            config,
            clock,
            launcher,
            processes,
            parser,
            ready_delays: HashMap::new(),
            run_counter: 0,
        }
    }

    /// Production wiring: the configured database, real processes, mail
    /// written to the log.
    pub fn from_config(config: SchedulerConfig) -> Result<Runtime> {
        let store = Store::open(&config.database, config.store_retry.clone())?;
        let mail = NotificationSink::new(Box::new(LogMailer), config.admin_emails.clone());
        let launcher = ProcessLauncher::new(config.worker_path.clone(), config.worker_nice_level);
        let parser = parser::from_command(&config.parser_command);
        Ok(Runtime::new(
            store,
            config,
            mail,
            Box::new(SystemClock),
            Box::new(launcher),
            Box::new(LocalProcessTable::new()),
            parser,
        ))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// A fresh directory for a host-level run:
    /// `<results>/hosts/<hostname>/<n>-<mode>`.
    pub fn host_results_dir(&mut self, hostname: &str, mode: WorkerMode) -> PathBuf {
        let base = self.config.results_dir.join("hosts").join(hostname);
        loop {
            let candidate = base.join(format!("{}-{}", self.run_counter, mode));
            self.run_counter += 1;
            if !candidate.exists() {
                return candidate;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use crate::testing::Fixture;
    use crate::worker::WorkerMode;

    #[test]
    fn host_results_dirs_are_unique() {
        let mut fx = Fixture::new();
        let first = fx.rt.host_results_dir("h1", WorkerMode::Verify);
        std::fs::create_dir_all(&first).unwrap();
        let second = fx.rt.host_results_dir("h1", WorkerMode::Repair);
        assert_ne!(first, second);
        assert!(first.ends_with("hosts/h1/0-verify"));
        assert!(second.ends_with("hosts/h1/1-repair"));
    }
}
