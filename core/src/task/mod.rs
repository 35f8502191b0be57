//! Tasks: single steps of work owned by an agent.
//!
//! A task runs its prolog when started, optionally launches one worker
//! through an [`ExecutionMonitor`], is polled every tick until the worker
//! reports an exit code, then runs its epilog. Aborting kills the worker
//! and runs the epilog without a success verdict.
//!
//! ```text
//! NotStarted -> Running -> Done(Succeeded | Failed | Aborted)
//! ```
//!
//! A failed task hands its failure tasks to the owning agent, which
//! replaces its remaining queue with them.

pub mod abort;
pub mod queue;
pub mod special;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::error::{Result, SchedulerError};
use crate::models::entry::HostQueueEntry;
use crate::models::job::{self, Job};
use crate::monitor::ExecutionMonitor;
use crate::runtime::Runtime;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    NotStarted,
    Running,
    Done(TaskOutcome),
}

/// Callback fired by a delayed call task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedAction {
    /// Stop waiting for atomic group hosts and run with what is Pending.
    RunAtomicGroup { job_id: i64, entry_id: i64 },
}

impl DelayedAction {
    fn job_id(&self) -> i64 {
        match self {
            DelayedAction::RunAtomicGroup { job_id, .. } => *job_id,
        }
    }
}

#[derive(Debug)]
pub enum TaskKind {
    Verify { host_id: i64, entry_id: Option<i64> },
    Repair { host_id: i64, entry_id: Option<i64> },
    Reboot { host_id: i64, entry_id: Option<i64> },
    Queue { job_id: i64, entry_ids: Vec<i64> },
    Abort { entry_id: i64, agents: Vec<Agent> },
    DelayedCall { end_time: DateTime<Utc>, action: DelayedAction },
}


#[derive(Debug)]
pub struct Task {
    kind: TaskKind,
    phase: TaskPhase,
    monitor: Option<ExecutionMonitor>,
    failure_tasks: Vec<Task>,
    host_ids: Vec<i64>,
    entry_ids: Vec<i64>,
}

impl Task {
    fn with_kind(kind: TaskKind, host_ids: Vec<i64>, entry_ids: Vec<i64>) -> Task {
        Task {
            kind,
            phase: TaskPhase::NotStarted,
            monitor: None,
            failure_tasks: Vec::new(),
            host_ids,
            entry_ids,
        }
    }

    /// Entry handed on to a repair: metahost entries can find another
    /// host, so only direct entries fail with the repair.
    fn repair_entry(entry: Option<&HostQueueEntry>) -> Option<&HostQueueEntry> {
        entry.filter(|e| e.meta_host.is_none())
    }

    pub fn verify(host_id: i64, entry: Option<&HostQueueEntry>) -> Task {
        let mut task = Task::with_kind(
            TaskKind::Verify {
                host_id,
                entry_id: entry.map(|e| e.id),
            },
            vec![host_id],
            entry.map(|e| e.id).into_iter().collect(),
        );
        task.failure_tasks = vec![Task::repair(host_id, Task::repair_entry(entry))];
        task
    }

    pub fn repair(host_id: i64, entry: Option<&HostQueueEntry>) -> Task {
        Task::with_kind(
            TaskKind::Repair {
                host_id,
                entry_id: entry.map(|e| e.id),
            },
            vec![host_id],
            entry.map(|e| e.id).into_iter().collect(),
        )
    }

    pub fn reboot(host_id: i64, entry: Option<&HostQueueEntry>) -> Task {
        let mut task = Task::with_kind(
            TaskKind::Reboot {
                host_id,
                entry_id: entry.map(|e| e.id),
            },
            vec![host_id],
            entry.map(|e| e.id).into_iter().collect(),
        );
        task.failure_tasks = vec![Task::repair(host_id, Task::repair_entry(entry))];
        task
    }

    pub fn queue(job: &Job, entries: &[HostQueueEntry]) -> Task {
        Task::with_kind(
            TaskKind::Queue {
                job_id: job.id,
                entry_ids: entries.iter().map(|e| e.id).collect(),
            },
            entries.iter().filter_map(|e| e.host_id).collect(),
            entries.iter().map(|e| e.id).collect(),
        )
    }

    /// A queue task for a worker that is already running; polling resumes
    /// and the prolog is not run again.
    pub fn recovered_queue(
        job_id: i64,
        entries: &[HostQueueEntry],
        monitor: ExecutionMonitor,
    ) -> Task {
        let mut task = Task::with_kind(
            TaskKind::Queue {
                job_id,
                entry_ids: entries.iter().map(|e| e.id).collect(),
            },
            entries.iter().filter_map(|e| e.host_id).collect(),
            entries.iter().map(|e| e.id).collect(),
        );
        task.phase = TaskPhase::Running;
        task.monitor = Some(monitor);
        task
    }

    pub fn abort_entry(entry: &HostQueueEntry, agents: Vec<Agent>) -> Task {
        Task::with_kind(
            TaskKind::Abort {
                entry_id: entry.id,
                agents,
            },
            entry.host_id.into_iter().collect(),
            vec![entry.id],
        )
    }

    pub fn delayed_call(end_time: DateTime<Utc>, action: DelayedAction) -> Task {
        Task::with_kind(
            TaskKind::DelayedCall { end_time, action },
            Vec::new(),
            Vec::new(),
        )
    }

    // -- accessors --

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            TaskKind::Verify { .. } => "verify",
            TaskKind::Repair { .. } => "repair",
            TaskKind::Reboot { .. } => "reboot",
            TaskKind::Queue { .. } => "queue",
            TaskKind::Abort { .. } => "abort",
            TaskKind::DelayedCall { .. } => "delayed_call",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, TaskPhase::Done(_))
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.phase {
            TaskPhase::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn host_ids(&self) -> &[i64] {
        &self.host_ids
    }

    pub fn entry_ids(&self) -> &[i64] {
        &self.entry_ids
    }

    /// Hosts and entries of this task and everything it could escalate to.
    pub fn collect_ids(&self, hosts: &mut BTreeSet<i64>, entries: &mut BTreeSet<i64>) {
        hosts.extend(self.host_ids.iter().copied());
        entries.extend(self.entry_ids.iter().copied());
        for task in &self.failure_tasks {
            task.collect_ids(hosts, entries);
        }
    }

    /// Worker slots this task occupies for admission control.
    pub fn num_processes(&self) -> usize {
        match &self.kind {
            TaskKind::Verify { .. } | TaskKind::Repair { .. } | TaskKind::Reboot { .. } => 1,
            TaskKind::Queue { .. } => self.host_ids.len().max(1),
            TaskKind::Abort { .. } | TaskKind::DelayedCall { .. } => 0,
        }
    }

    pub fn monitored_pid(&self) -> Option<u32> {
        self.monitor.as_ref().and_then(|m| m.pid())
    }

    pub fn results_dir(&self) -> Option<PathBuf> {
        self.monitor.as_ref().map(|m| m.results_dir().to_path_buf())
    }

    pub fn take_failure_tasks(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.failure_tasks)
    }

    // -- lifecycle --

    /// Advance one step. Returns agents surfaced by the prolog, epilog or
    /// a delayed callback.
    pub fn poll(&mut self, rt: &mut Runtime) -> Result<Vec<Agent>> {
        match self.phase {
            TaskPhase::NotStarted => self.start(rt),
            TaskPhase::Running => self.check(rt),
            TaskPhase::Done(_) => Ok(Vec::new()),
        }
    }

    fn start(&mut self, rt: &mut Runtime) -> Result<Vec<Agent>> {
        debug!(task = self.label(), hosts = ?self.host_ids, entries = ?self.entry_ids, "task starting");
        self.phase = TaskPhase::Running;
        let invocation = match &mut self.kind {
            TaskKind::Verify { host_id, entry_id } => special::verify_prolog(rt, *host_id, *entry_id)?,
            TaskKind::Repair { host_id, .. } => special::repair_prolog(rt, *host_id)?,
            TaskKind::Reboot { host_id, .. } => special::reboot_prolog(rt, *host_id)?,
            TaskKind::Queue { job_id, entry_ids } => queue::prolog(rt, *job_id, entry_ids)?,
            TaskKind::Abort { entry_id, agents } => {
                let spawned = abort::prolog(rt, *entry_id, agents)?;
                let mut more = self.finish(rt, true)?;
                more.extend(spawned);
                return Ok(more);
            }
            TaskKind::DelayedCall { .. } => return self.check(rt),
        };

        match ExecutionMonitor::launch(rt, &invocation) {
            Ok(monitor) => {
                self.monitor = Some(monitor);
                Ok(Vec::new())
            }
            Err(e @ (SchedulerError::Launch(_) | SchedulerError::Io(_))) => {
                warn!(task = self.label(), dir = %invocation.results_dir.display(), error = %e, "worker launch failed");
                rt.mail.enqueue_admin(
                    &format!("Failed to launch {} worker", invocation.mode),
                    &format!(
                        "Hosts: {}\nResults directory: {}\nError: {}",
                        invocation.hosts.join(", "),
                        invocation.results_dir.display(),
                        e
                    ),
                );
                self.finish(rt, false)
            }
            Err(e) => Err(e),
        }
    }

    fn check(&mut self, rt: &mut Runtime) -> Result<Vec<Agent>> {
        if let TaskKind::DelayedCall { end_time, action } = &self.kind {
            let (end_time, action) = (*end_time, *action);
            let cancelled = rt
                .ready_delays
                .get(&action.job_id())
                .map_or(true, |delay| delay.cancelled);
            if cancelled {
                debug!(job = action.job_id(), "delayed call cancelled");
                self.phase = TaskPhase::Done(TaskOutcome::Succeeded);
                return Ok(Vec::new());
            }
            if rt.now() < end_time {
                return Ok(Vec::new());
            }
            self.phase = TaskPhase::Done(TaskOutcome::Succeeded);
            let spawned = match action {
                DelayedAction::RunAtomicGroup { job_id, entry_id } => {
                    job::run_delayed(rt, job_id, entry_id)?
                }
            };
            return Ok(spawned.into_iter().collect());
        }

        let Some(monitor) = self.monitor.as_mut() else {
            return Err(SchedulerError::Invariant(format!(
                "{} task polled without a worker",
                self.label()
            )));
        };
        match monitor.exit_code(rt) {
            None => Ok(Vec::new()),
            Some(code) => {
                debug!(task = self.label(), code, "worker finished");
                self.finish(rt, code == 0)
            }
        }
    }

    fn finish(&mut self, rt: &mut Runtime, success: bool) -> Result<Vec<Agent>> {
        let outcome = if success {
            TaskOutcome::Succeeded
        } else {
            TaskOutcome::Failed
        };
        self.phase = TaskPhase::Done(outcome);
        info!(task = self.label(), ?outcome, hosts = ?self.host_ids, "task finished");
        self.epilog(rt, outcome)
    }

    /// Finish a task that never started as failed, running only its
    /// epilog. Used for recovery steps the budget no longer allows.
    pub fn skip_as_failed(&mut self, rt: &mut Runtime) -> Result<Vec<Agent>> {
        if self.phase != TaskPhase::NotStarted {
            return Err(SchedulerError::Invariant(format!(
                "{} task already started",
                self.label()
            )));
        }
        self.phase = TaskPhase::Done(TaskOutcome::Failed);
        info!(task = self.label(), hosts = ?self.host_ids, "task skipped, counted as failed");
        self.epilog(rt, TaskOutcome::Failed)
    }

    /// Kill the worker if any and run the epilog. A finished task is left
    /// alone.
    pub fn abort(&mut self, rt: &mut Runtime) -> Result<Vec<Agent>> {
        if self.is_done() {
            return Ok(Vec::new());
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.kill(rt);
        }
        self.phase = TaskPhase::Done(TaskOutcome::Aborted);
        info!(task = self.label(), hosts = ?self.host_ids, "task aborted");
        self.epilog(rt, TaskOutcome::Aborted)
    }

    fn epilog(&self, rt: &mut Runtime, outcome: TaskOutcome) -> Result<Vec<Agent>> {
        let lost = self.monitor.as_ref().map_or(false, |m| m.is_lost());
        let results_dir = self.results_dir();
        match &self.kind {
            TaskKind::Verify { host_id, entry_id } => {
                special::verify_epilog(rt, *host_id, *entry_id, outcome)?;
                Ok(Vec::new())
            }
            TaskKind::Repair { host_id, entry_id } => {
                special::repair_epilog(rt, *host_id, *entry_id, outcome)?;
                Ok(Vec::new())
            }
            TaskKind::Reboot { host_id, entry_id } => {
                special::reboot_epilog(rt, *host_id, *entry_id, outcome)?;
                Ok(Vec::new())
            }
            TaskKind::Queue { job_id, entry_ids } => {
                queue::epilog(rt, *job_id, entry_ids, outcome, lost, results_dir)
            }
            TaskKind::Abort { entry_id, .. } => {
                abort::epilog(rt, *entry_id)?;
                Ok(Vec::new())
            }
            TaskKind::DelayedCall { .. } => Ok(Vec::new()),
        }
    }
}
