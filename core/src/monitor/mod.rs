//! Supervision of one detached worker through its pidfile.
//!
//! The monitor holds no process handle. Every poll re-reads the pidfile, so
//! a monitor attached after a scheduler restart behaves exactly like the
//! one that launched the worker. Ambiguity is resolved here and nowhere
//! else: a worker that never writes a pid within the timeout, disappears
//! without an exit code, or leaves a malformed pidfile is lost, which reads
//! as exit code 1 and raises one admin notification.

pub mod pidfile;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::runtime::Runtime;
use crate::worker::WorkerInvocation;
use pidfile::{PidfileError, PidfileState};

/// Exit code reported for a lost worker.
pub const LOST_EXIT_CODE: i32 = 1;


#[derive(Debug, Clone)]
pub struct ExecutionMonitor {
    results_dir: PathBuf,
    since: DateTime<Utc>,
    state: PidfileState,
    lost: Option<String>,
}

impl ExecutionMonitor {
    /// Prepare the results directory and start the worker.
    pub fn launch(rt: &mut Runtime, invocation: &WorkerInvocation) -> Result<ExecutionMonitor> {
        std::fs::create_dir_all(&invocation.results_dir)?;
        if pidfile::move_aside(&invocation.results_dir)? {
            info!(dir = %invocation.results_dir.display(), "moved stale pidfile aside");
        }
        rt.launcher.launch(invocation)?;
        let mut monitor = ExecutionMonitor::attach(&invocation.results_dir, rt.now());
        monitor.refresh(rt);
        Ok(monitor)
    }

    /// Watch a worker that is already running, without relaunching it.
    pub fn attach(results_dir: &Path, now: DateTime<Utc>) -> ExecutionMonitor {
        ExecutionMonitor {
            results_dir: results_dir.to_path_buf(),
            since: now,
            state: PidfileState::default(),
            lost: None,
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Last pid seen, without touching the filesystem.
    pub fn pid(&self) -> Option<u32> {
        self.state.pid
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    /// `(None, None)` not started, `(pid, None)` running, `(pid, code)`
    /// finished. A lost worker reads as `(pid or None, 1)`.
    pub fn get_info(&mut self, rt: &mut Runtime) -> (Option<u32>, Option<i32>) {
        if self.lost.is_none() && self.state.exit_code.is_none() {
            self.refresh(rt);
        }
        (self.state.pid, self.state.exit_code)
    }

    pub fn exit_code(&mut self, rt: &mut Runtime) -> Option<i32> {
        self.get_info(rt).1
    }

    pub fn has_process(&mut self, rt: &mut Runtime) -> bool {
        self.get_info(rt).0.is_some()
    }

    /// Kill the worker's process group if it is still alive.
    pub fn kill(&mut self, rt: &mut Runtime) {
        let (pid, code) = self.get_info(rt);
        if let (Some(pid), None) = (pid, code) {
            info!(pid, dir = %self.results_dir.display(), "killing worker");
            rt.processes.kill(pid);
        }
    }

    fn refresh(&mut self, rt: &mut Runtime) {
        let reading = match pidfile::read(&self.results_dir) {
            Ok(reading) => reading,
            Err(PidfileError::Malformed(detail)) => {
                self.mark_lost(rt, format!("malformed pidfile: {}", detail));
                return;
            }
            Err(e) => {
                warn!(dir = %self.results_dir.display(), error = %e, "pidfile unreadable, will retry");
                return;
            }
        };
        self.state = reading;

        match (reading.pid, reading.exit_code) {
            (_, Some(_)) => {}
            (Some(pid), None) => {
                if rt.processes.is_running(pid) {
                    return;
                }
                // The worker may have exited between the read and the probe.
                match pidfile::read(&self.results_dir) {
                    Ok(again) if again.exit_code.is_some() => self.state = again,
                    _ => self.mark_lost(rt, format!("process {} is gone without an exit code", pid)),
                }
            }
            (None, None) => {
                let timeout = rt.config.pidfile_timeout();
                if rt.now() - self.since > timeout {
                    self.mark_lost(
                        rt,
                        format!("no pid written within {} minutes", timeout.num_minutes()),
                    );
                }
            }
        }
    }

    fn mark_lost(&mut self, rt: &mut Runtime, reason: String) {
        warn!(dir = %self.results_dir.display(), pid = ?self.state.pid, %reason, "worker process lost");
        rt.mail.enqueue_admin(
            &format!("Lost worker process in {}", self.results_dir.display()),
            &format!(
                "Results directory: {}\nPid: {}\nReason: {}\nThe run is treated as failed.",
                self.results_dir.display(),
                self.state
                    .pid
                    .map_or_else(|| "none".to_string(), |p| p.to_string()),
                reason
            ),
        );
        self.state.exit_code = Some(LOST_EXIT_CODE);
        self.lost = Some(reason);
    }
}
