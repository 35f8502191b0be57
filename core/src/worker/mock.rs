//! In-memory launcher and parser for tests.
//!
//! `MockLauncher` never starts a process. It writes the pidfile the way a
//! worker would, according to a scripted outcome, and hands out pids from
//! 1000 upwards. Clones share state so a test keeps a handle after the
//! launcher moves into the runtime.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::{ResultsParser, WorkerInvocation, WorkerLauncher, WorkerMode};
use crate::error::{Result, SchedulerError};
use crate::monitor::pidfile::PIDFILE_NAME;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Write the pid only; the worker is still running.
    Running,
    /// Write the pid and exit code.
    Exit(i32),
    /// Start but never write anything.
    Silent,
    /// Fail to launch at all.
    LaunchError,
}

#[derive(Debug, Clone)]
pub struct MockLaunch {
    pub pid: u32,
    pub invocation: WorkerInvocation,
    pub finished: bool,
}

#[derive(Debug)]
struct MockState {
    next_pid: u32,
    defaults: HashMap<WorkerMode, MockOutcome>,
    scripted: HashMap<(WorkerMode, Option<String>), VecDeque<MockOutcome>>,
    launches: Vec<MockLaunch>,
    reaps: usize,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            next_pid: 1000,
            defaults: HashMap::new(),
            scripted: HashMap::new(),
            launches: Vec::new(),
            reaps: 0,
        }
    }
}

impl MockState {
    fn outcome_for(&mut self, invocation: &WorkerInvocation) -> MockOutcome {
        let host = invocation.hosts.first().cloned();
        for key in [(invocation.mode, host), (invocation.mode, None)] {
            if let Some(queue) = self.scripted.get_mut(&key) {
                if let Some(outcome) = queue.pop_front() {
                    return outcome;
                }
            }
        }
        self.defaults
            .get(&invocation.mode)
            .copied()
            .unwrap_or(MockOutcome::Running)
    }
}


#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    state: Rc<RefCell<MockState>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome for every launch of `mode` without a scripted one.
    pub fn set_default(&self, mode: WorkerMode, outcome: MockOutcome) {
        self.state.borrow_mut().defaults.insert(mode, outcome);
    }

    /// Queue an outcome for the next launch of `mode`.
    pub fn script(&self, mode: WorkerMode, outcome: MockOutcome) {
        self.state
            .borrow_mut()
            .scripted
            .entry((mode, None))
            .or_default()
            .push_back(outcome);
    }

    /// Queue an outcome for the next launch of `mode` whose first host is
    /// `hostname`. Takes precedence over [`MockLauncher::script`].
    pub fn script_host(&self, mode: WorkerMode, hostname: &str, outcome: MockOutcome) {
        self.state
            .borrow_mut()
            .scripted
            .entry((mode, Some(hostname.to_string())))
            .or_default()
            .push_back(outcome);
    }

    pub fn launches(&self) -> Vec<MockLaunch> {
        self.state.borrow().launches.clone()
    }

    pub fn launched(&self, mode: WorkerMode) -> usize {
        self.state
            .borrow()
            .launches
            .iter()
            .filter(|l| l.invocation.mode == mode)
            .count()
    }

    /// Append `code` to the pidfile of every unfinished worker of `mode`.
    /// Returns how many were finished.
    pub fn finish(&self, mode: WorkerMode, code: i32) -> usize {
        let mut state = self.state.borrow_mut();
        let mut n = 0;
        for launch in state.launches.iter_mut() {
            if launch.invocation.mode == mode && !launch.finished {
                append_line(&launch.invocation.results_dir, &code.to_string());
                launch.finished = true;
                n += 1;
            }
        }
        n
    }

    pub fn reap_count(&self) -> usize {
        self.state.borrow().reaps
    }

    /// Finish one worker by pid.
    pub fn exit(&self, pid: u32, code: i32) {
        let mut state = self.state.borrow_mut();
        if let Some(launch) = state.launches.iter_mut().find(|l| l.pid == pid) {
            append_line(&launch.invocation.results_dir, &code.to_string());
            launch.finished = true;
        }
    }
}

fn append_line(dir: &Path, line: &str) {
    let path = dir.join(PIDFILE_NAME);
    if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", line);
    }
}

impl WorkerLauncher for MockLauncher {
    fn launch(&mut self, invocation: &WorkerInvocation) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let outcome = state.outcome_for(invocation);
        if outcome == MockOutcome::LaunchError {
            return Err(SchedulerError::Launch(format!(
                "scripted launch failure for {}",
                invocation.mode
            )));
        }
        fs::create_dir_all(&invocation.results_dir)?;
        let pid = state.next_pid;
        state.next_pid += 1;
        let finished = match outcome {
            MockOutcome::Running => {
                append_line(&invocation.results_dir, &pid.to_string());
                false
            }
            MockOutcome::Exit(code) => {
                append_line(&invocation.results_dir, &pid.to_string());
                append_line(&invocation.results_dir, &code.to_string());
                true
            }
            MockOutcome::Silent | MockOutcome::LaunchError => false,
        };
        state.launches.push(MockLaunch {
            pid,
            invocation: invocation.clone(),
            finished,
        });
        Ok(())
    }
    fn reap(&mut self) {
        self.state.borrow_mut().reaps += 1;
    }
}


/// Records every results directory it is asked to parse.
#[derive(Debug, Clone, Default)]
pub struct RecordingParser {
    parsed: Rc<RefCell<Vec<PathBuf>>>,
}

impl RecordingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parsed(&self) -> Vec<PathBuf> {
        self.parsed.borrow().clone()
    }
}

impl ResultsParser for RecordingParser {
    fn parse(&mut self, results_dir: &Path) -> Result<()> {
        self.parsed.borrow_mut().push(results_dir.to_path_buf());
        Ok(())
    }
}
