//! Worker invocations and the launchers that start them.
//!
//! `WorkerLauncher` is the seam tasks use to start a worker. `ProcessLauncher`
//! spawns real detached processes; `MockLauncher` writes the pidfile itself
//! so tests control every outcome.

pub mod launcher;
pub mod mock;
pub mod parser;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::host::Protection;
use crate::models::job::Job;

pub use launcher::ProcessLauncher;
pub use mock::MockLauncher;
pub use parser::{CommandParser, NoopParser, ResultsParser};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerMode {
    Verify,
    Repair,
    Reboot,
    Run,
}

impl WorkerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerMode::Verify => "verify",
            WorkerMode::Repair => "repair",
            WorkerMode::Reboot => "reboot",
            WorkerMode::Run => "run",
        }
    }

    fn flag(self) -> &'static str {
        match self {
            WorkerMode::Verify => "--verify",
            WorkerMode::Repair => "--repair",
            WorkerMode::Reboot => "--reboot",
            WorkerMode::Run => "--run",
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInvocation {
    pub mode: WorkerMode,
    pub results_dir: PathBuf,
    pub hosts: Vec<String>,
    pub owner: Option<String>,
    pub job_name: Option<String>,
    pub control_file: Option<PathBuf>,
    pub protection: Option<Protection>,
}

impl WorkerInvocation {
    pub fn new(mode: WorkerMode, results_dir: &Path) -> Self {
        WorkerInvocation {
            mode,
            results_dir: results_dir.to_path_buf(),
            hosts: Vec::new(),
            owner: None,
            job_name: None,
            control_file: None,
            protection: None,
        }
    }

    pub fn host(mut self, hostname: &str) -> Self {
        self.hosts.push(hostname.to_string());
        self
    }

    pub fn hosts(mut self, hostnames: Vec<String>) -> Self {
        self.hosts = hostnames;
        self
    }

    pub fn job(mut self, job: &Job) -> Self {
        self.owner = Some(job.owner.clone());
        self.job_name = Some(job.name.clone());
        self
    }

    pub fn control_file(mut self, path: PathBuf) -> Self {
        self.control_file = Some(path);
        self
    }

    pub fn protection(mut self, protection: Protection) -> Self {
        self.protection = Some(protection);
        self
    }

    /// Worker argv after the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.mode.flag().to_string(),
            "-r".to_string(),
            self.results_dir.display().to_string(),
        ];
        if !self.hosts.is_empty() {
            args.push("-m".into());
            args.push(self.hosts.join(","));
        }
        if let Some(owner) = &self.owner {
            args.push("-u".into());
            args.push(owner.clone());
        }
        if let Some(name) = &self.job_name {
            args.push("-l".into());
            args.push(name.clone());
        }
        if let Some(protection) = self.protection {
            args.push(format!("--host-protection={}", protection.worker_arg()));
        }
        if let Some(control) = &self.control_file {
            args.push(control.display().to_string());
        }
        args
    }
}


pub trait WorkerLauncher {
    /// Start the worker. The worker reports its pid through the pidfile,
    /// not through this call.
    fn launch(&mut self, invocation: &WorkerInvocation) -> Result<()>;

    /// Collect exited children so they do not linger as zombies.
    fn reap(&mut self) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_carry_job_and_control() {
        let job = Job::new("alice", "smoke", chrono::Utc::now());
        let inv = WorkerInvocation::new(WorkerMode::Run, Path::new("/r/1-alice/group0"))
            .hosts(vec!["h1".into(), "h2".into()])
            .job(&job)
            .control_file(PathBuf::from("/r/1-alice/group0/control"));
        assert_eq!(
            inv.args(),
            vec![
                "--run",
                "-r",
                "/r/1-alice/group0",
                "-m",
                "h1,h2",
                "-u",
                "alice",
                "-l",
                "smoke",
                "/r/1-alice/group0/control",
            ]
        );
    }

    #[test]
    fn repair_args_carry_protection() {
        let inv = WorkerInvocation::new(WorkerMode::Repair, Path::new("/r/hosts/h1/1-repair"))
            .host("h1")
            .protection(Protection::RepairFilesystemOnly);
        let args = inv.args();
        assert_eq!(args[0], "--repair");
        assert!(args.last().unwrap().starts_with("--host-protection="));
    }
}
