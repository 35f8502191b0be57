//! OS process table access.
//!
//! Workers are only ever known by pid. Liveness is probed with signal 0,
//! kills go to the worker's whole process group, and orphans are found by
//! scanning `/proc` for workers some other process now parents.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Marker carried in every worker wrapper's argv.
pub const WORKER_MARKER: &str = "fleetsched-worker";


pub trait ProcessTable {
    fn is_running(&self, pid: u32) -> bool;
    fn kill(&mut self, pid: u32);
    /// Worker processes whose parent has gone away.
    fn orphaned_workers(&self) -> Vec<u32>;
}


#[derive(Debug)]
pub struct LocalProcessTable {
    /// How long a worker gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl LocalProcessTable {
    pub fn new() -> Self {
        LocalProcessTable {
            kill_grace: Duration::from_millis(500),
        }
    }
}

impl Default for LocalProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Field 3 (state) and field 4 (ppid) of `/proc/<pid>/stat`. The command
/// name in field 2 may contain spaces, so parse after the last `)`.
fn read_stat(pid: u32) -> Option<(char, u32)> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// A live process carrying the worker marker that this daemon did not
/// spawn. Reparenting goes to init or to the nearest subreaper, so any
/// parent other than us counts.
fn is_orphaned_worker(cmdline: &[u8], state: char, ppid: u32, daemon_pid: u32) -> bool {
    if state == 'Z' || ppid == daemon_pid {
        return false;
    }
    cmdline
        .split(|b| *b == 0)
        .any(|arg| arg == WORKER_MARKER.as_bytes())
}

fn signal_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence check only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl ProcessTable for LocalProcessTable {
    fn is_running(&self, pid: u32) -> bool {
        if !signal_alive(pid) {
            return false;
        }
        !matches!(read_stat(pid), Some(('Z', _)))
    }

    fn kill(&mut self, pid: u32) {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: negative pid targets the worker's process group.
        let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
        if rc != 0 {
            // Not a group leader (or already gone); fall back to the pid.
            unsafe { libc::kill(pgid, libc::SIGTERM) };
        }
        let deadline = Instant::now() + self.kill_grace;
        while Instant::now() < deadline {
            if !self.is_running(pid) {
                debug!(pid, "worker exited after SIGTERM");
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        warn!(pid, "worker ignored SIGTERM, sending SIGKILL");
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
            libc::kill(pgid, libc::SIGKILL);
        }
    }

    fn orphaned_workers(&self) -> Vec<u32> {
        let Ok(dir) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        let daemon_pid = std::process::id();
        let mut found = Vec::new();
        for entry in dir.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let Some((state, ppid)) = read_stat(pid) else {
                continue;
            };
            let Ok(cmdline) = fs::read(format!("/proc/{}/cmdline", pid)) else {
                continue;
            };
            if is_orphaned_worker(&cmdline, state, ppid, daemon_pid) {
                found.push(pid);
            }
        }
        found.sort_unstable();
        found
    }
}


#[derive(Debug, Default)]
struct MockProcesses {
    dead: BTreeSet<u32>,
    killed: Vec<u32>,
    orphans: Vec<u32>,
}

/// Every pid is running until marked dead or killed. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockProcessTable {
    inner: Rc<RefCell<MockProcesses>>,
}

impl MockProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dead(&self, pid: u32) {
        self.inner.borrow_mut().dead.insert(pid);
    }

    pub fn add_orphan(&self, pid: u32) {
        self.inner.borrow_mut().orphans.push(pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.inner.borrow().killed.clone()
    }
}

impl ProcessTable for MockProcessTable {
    fn is_running(&self, pid: u32) -> bool {
        !self.inner.borrow().dead.contains(&pid)
    }

    fn kill(&mut self, pid: u32) {
        let mut inner = self.inner.borrow_mut();
        inner.killed.push(pid);
        inner.dead.insert(pid);
        inner.orphans.retain(|p| *p != pid);
    }

    fn orphaned_workers(&self) -> Vec<u32> {
        let inner = self.inner.borrow();
        inner
            .orphans
            .iter()
            .copied()
            .filter(|p| !inner.dead.contains(p))
            .collect()
    }
}
