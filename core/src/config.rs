//! Scheduler configuration loaded from YAML.
//!
//! Every key is optional; missing keys take the defaults below. A minimal
//! config file only names the database and the results root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::models::entry::EntryStatus;
use crate::store::retry::RetryPolicy;


/// Top-level scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Path of the sqlite database shared with the frontend.
    pub database: PathBuf,

    /// Root under which every worker invocation gets its own directory.
    pub results_dir: PathBuf,

    /// Worker executable handed the invocation arguments.
    pub worker_path: PathBuf,

    /// Run workers under `nice -n <level>`. `None` disables.
    pub worker_nice_level: Option<i32>,

    /// Results parser command; the results directory is appended. Empty
    /// disables parsing.
    pub parser_command: Vec<String>,

    /// Sleep between ticks.
    pub tick_pause_secs: u64,

    /// Interval between periodic maintenance passes.
    pub clean_interval_minutes: u64,

    /// Steady-state ceiling on started agents that own worker processes.
    pub max_running_agents: usize,

    /// Burst ceiling on agents started within one tick.
    pub max_agents_started_per_tick: usize,

    /// Abort requests handled per tick.
    pub max_aborts_per_tick: usize,

    /// How long a launched worker may take to write its pid.
    pub pidfile_timeout_minutes: u64,

    /// How long an atomic group job waits for more hosts to become ready.
    pub secs_to_wait_for_atomic_group_hosts: u64,

    /// Failure escalations an agent may perform before giving up.
    pub max_recovery_attempts: u32,

    /// Entry statuses that trigger an email to the job's email list.
    /// `all` matches every status.
    pub notify_email_statuses: Vec<String>,

    /// Recipients of operator notifications.
    pub admin_emails: Vec<String>,

    /// Re-verify hosts left in Repair Failed when the scheduler starts.
    pub recover_hosts: bool,

    /// Retry behaviour for busy/locked database errors.
    pub store_retry: RetryPolicy,

    /// Single-instance lock file. Defaults to `<database>.lock`.
    pub lock_file: Option<PathBuf>,
}


impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            database: PathBuf::from("fleetsched.db"),
            results_dir: PathBuf::from("results"),
            worker_path: PathBuf::from("fleet-worker"),
            worker_nice_level: Some(10),
            parser_command: Vec::new(),
            tick_pause_secs: 5,
            clean_interval_minutes: 60,
            max_running_agents: 100,
            max_agents_started_per_tick: 10,
            max_aborts_per_tick: 50,
            pidfile_timeout_minutes: 5,
            secs_to_wait_for_atomic_group_hosts: 600,
            max_recovery_attempts: 2,
            notify_email_statuses: Vec::new(),
            admin_emails: Vec::new(),
            recover_hosts: false,
            store_retry: RetryPolicy::default(),
            lock_file: None,
        }
    }
}


impl SchedulerConfig {
    /// Load a config from a YAML file.
    pub fn load(path: &Path) -> Result<SchedulerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        SchedulerConfig::parse(&content)
    }

    /// Parse config from a YAML string.
    pub fn parse(content: &str) -> Result<SchedulerConfig> {
        let config: SchedulerConfig = serde_yaml::from_str(content)
            .map_err(|e| SchedulerError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_agents_started_per_tick == 0 {
            return Err(SchedulerError::Config(
                "max_agents_started_per_tick must be at least 1".into(),
            ));
        }
        if self.max_running_agents == 0 {
            return Err(SchedulerError::Config(
                "max_running_agents must be at least 1".into(),
            ));
        }
        for status in &self.notify_email_statuses {
            if status != "all" && status.parse::<EntryStatus>().is_err() {
                return Err(SchedulerError::Config(format!(
                    "unknown status '{}' in notify_email_statuses",
                    status
                )));
            }
        }
        Ok(())
    }

    pub fn pidfile_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.pidfile_timeout_minutes as i64)
    }

    pub fn clean_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.clean_interval_minutes as i64)
    }

    pub fn atomic_group_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.secs_to_wait_for_atomic_group_hosts as i64)
    }

    pub fn tick_pause(&self) -> Duration {
        Duration::from_secs(self.tick_pause_secs)
    }

    pub fn lock_path(&self) -> PathBuf {
        match &self.lock_file {
            Some(path) => path.clone(),
            None => {
                let mut name = self.database.as_os_str().to_owned();
                name.push(".lock");
                PathBuf::from(name)
            }
        }
    }

    /// Whether moving an entry into `status` should email the job's list.
    pub fn notifies_on(&self, status: EntryStatus) -> bool {
        self.notify_email_statuses
            .iter()
            .any(|s| s == "all" || s.eq_ignore_ascii_case(status.as_str()))
    }
}
