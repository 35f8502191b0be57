//! Spawns real worker processes.
//!
//! The worker binary is wrapped in a tiny `sh` script that writes `$$` to
//! the pidfile before exec'ing the worker and appends its exit status when
//! it finishes, so any program satisfies the pidfile contract. The wrapper
//! leads its own process group so a kill reaches the whole worker tree.

use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};

use super::{WorkerInvocation, WorkerLauncher};
use crate::error::{Result, SchedulerError};
use crate::monitor::pidfile::PIDFILE_NAME;
use crate::process::WORKER_MARKER;

const WRAPPER: &str = r#"pidfile="$1"; shift
echo $$ > "$pidfile"
"$@"
status=$?
echo "$status" >> "$pidfile"
exit "$status""#;

/// Worker output inside the results directory.
pub const DEBUG_LOG: &str = "debug.log";


pub struct ProcessLauncher {
    pub worker_path: PathBuf,
    pub nice_level: Option<i32>,
    children: Vec<Child>,
}

impl ProcessLauncher {
    pub fn new(worker_path: PathBuf, nice_level: Option<i32>) -> Self {
        ProcessLauncher {
            worker_path,
            nice_level,
            children: Vec::new(),
        }
    }

    fn command(&self, invocation: &WorkerInvocation) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(WRAPPER).arg(WORKER_MARKER);
        cmd.arg(invocation.results_dir.join(PIDFILE_NAME));
        if let Some(level) = self.nice_level {
            cmd.arg("nice").arg("-n").arg(level.to_string());
        }
        cmd.arg(&self.worker_path);
        cmd.args(invocation.args());
        cmd
    }

    pub fn children(&self) -> usize {
        self.children.len()
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, invocation: &WorkerInvocation) -> Result<()> {
        fs::create_dir_all(&invocation.results_dir)?;
        let log_path = invocation.results_dir.join(DEBUG_LOG);
        let log = File::create(&log_path)
            .map_err(|e| SchedulerError::Launch(format!("cannot create {}: {}", log_path.display(), e)))?;
        let log_stderr = log
            .try_clone()
            .map_err(|e| SchedulerError::Launch(format!("cannot clone log handle: {}", e)))?;

        let child = self
            .command(invocation)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| SchedulerError::Launch(format!("cannot spawn worker: {}", e)))?;
        info!(
            pid = child.id(),
            mode = %invocation.mode,
            dir = %invocation.results_dir.display(),
            "worker launched"
        );
        self.children.push(child);
        Ok(())
    }

    fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "worker reaped");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = child.id(), error = %e, "cannot poll worker");
                false
            }
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerMode;
    use std::time::{Duration, Instant};

    fn wait_for_exit_line(pidfile: &std::path::Path) -> String {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let content = fs::read_to_string(pidfile).unwrap_or_default();
            if content.lines().count() >= 2 || Instant::now() > deadline {
                return content;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn wrapper_writes_pid_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("h1");
        let mut launcher = ProcessLauncher::new(PathBuf::from("false"), None);
        let inv = WorkerInvocation::new(WorkerMode::Verify, &results).host("h1");
        launcher.launch(&inv).unwrap();

        let content = wait_for_exit_line(&results.join(PIDFILE_NAME));
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].parse::<u32>().is_ok());
        assert_eq!(lines[1], "1");
        assert!(results.join(DEBUG_LOG).exists());

        let deadline = Instant::now() + Duration::from_secs(5);
        while launcher.children() > 0 && Instant::now() < deadline {
            launcher.reap();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(launcher.children(), 0);
    }

    #[test]
    fn reap_collects_every_finished_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = ProcessLauncher::new(PathBuf::from("true"), None);
        let mut dirs = Vec::new();
        for host in ["h1", "h2", "h3"] {
            let results = dir.path().join(host);
            launcher
                .launch(&WorkerInvocation::new(WorkerMode::Verify, &results).host(host))
                .unwrap();
            dirs.push(results);
        }
        assert_eq!(launcher.children(), 3);
        for results in &dirs {
            wait_for_exit_line(&results.join(PIDFILE_NAME));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        launcher.reap();
        while launcher.children() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            launcher.reap();
        }
        assert_eq!(launcher.children(), 0);
    }

    #[test]
    fn wrapper_argv_carries_marker_and_nice() {
        let launcher = ProcessLauncher::new(PathBuf::from("/usr/bin/worker"), Some(10));
        let inv = WorkerInvocation::new(WorkerMode::Reboot, std::path::Path::new("/r"));
        let cmd = launcher.command(&inv);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[2], WORKER_MARKER);
        assert_eq!(args[3], "/r/.execute_pid");
        assert_eq!(&args[4..7], &["nice", "-n", "10"]);
        assert_eq!(args[7], "/usr/bin/worker");
        assert_eq!(args[8], "--reboot");
    }
}
