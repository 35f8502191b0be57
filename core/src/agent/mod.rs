//! Agents: ordered task queues, one per thread of orchestrated work.
//!
//! The dispatcher ticks every started agent once per cycle. A tick polls
//! the active task and, as long as tasks finish within the tick, moves on
//! to the next one. A failed task's failure tasks replace whatever was left
//! in the queue; each such escalation moves the agent one step further into
//! `Recovering` and is bounded by the recovery budget.

pub mod state;

use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, error, info};

use crate::error::{Result, SchedulerError};
use crate::runtime::Runtime;
use crate::task::{Task, TaskOutcome};
pub use state::{AgentState, Transition};

pub type AgentId = u64;


/// One finished task, as the agent saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub label: &'static str,
    pub outcome: TaskOutcome,
    pub before: AgentState,
    pub after: AgentState,
}


#[derive(Debug)]
pub struct Agent {
    id: AgentId,
    state: AgentState,
    active: Option<Task>,
    queue: VecDeque<Task>,
    history: Vec<TaskRecord>,
    host_ids: BTreeSet<i64>,
    entry_ids: BTreeSet<i64>,
    num_processes: usize,
    /// Overrides the configured recovery budget.
    max_recoveries: Option<u32>,
    started: bool,
}

impl Agent {
    pub fn new(tasks: Vec<Task>) -> Agent {
        let mut host_ids = BTreeSet::new();
        let mut entry_ids = BTreeSet::new();
        for task in &tasks {
            task.collect_ids(&mut host_ids, &mut entry_ids);
        }
        let num_processes = tasks.iter().map(Task::num_processes).max().unwrap_or(0);
        Agent {
            id: 0,
            state: AgentState::Queued,
            active: None,
            queue: tasks.into(),
            history: Vec::new(),
            host_ids,
            entry_ids,
            num_processes,
            max_recoveries: None,
            started: false,
        }
    }

    /// Wraps a task whose worker survived a scheduler restart. The agent
    /// counts as started, so admission never holds it back.
    pub fn recovered(task: Task) -> Agent {
        let mut agent = Agent::new(Vec::new());
        task.collect_ids(&mut agent.host_ids, &mut agent.entry_ids);
        agent.num_processes = task.num_processes();
        agent.active = Some(task);
        agent.state = AgentState::Running;
        agent.started = true;
        agent
    }

    pub fn with_max_recoveries(mut self, max: u32) -> Agent {
        self.max_recoveries = Some(max);
        self
    }

    /// Abort agents reclaim a host the aborted job already held, so they
    /// take no new slot.
    pub fn with_num_processes(mut self, n: usize) -> Agent {
        self.num_processes = n;
        self
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn set_id(&mut self, id: AgentId) {
        self.id = id;
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn history(&self) -> &[TaskRecord] {
        &self.history
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn host_ids(&self) -> &BTreeSet<i64> {
        &self.host_ids
    }

    pub fn entry_ids(&self) -> &BTreeSet<i64> {
        &self.entry_ids
    }

    /// Worker slots the agent needs while started.
    pub fn num_processes(&self) -> usize {
        self.num_processes
    }

    /// Labels of the active task followed by the queued ones.
    pub fn task_labels(&self) -> Vec<&'static str> {
        self.active
            .iter()
            .chain(self.queue.iter())
            .map(Task::label)
            .collect()
    }

    pub fn monitored_pid(&self) -> Option<u32> {
        self.active.as_ref().and_then(Task::monitored_pid)
    }

    fn transition(&mut self, transition: Transition) -> Result<()> {
        self.state = self.state.apply(transition).map_err(|e| {
            SchedulerError::Invariant(format!("agent {}: {}", self.id, e))
        })?;
        Ok(())
    }

    /// Advance as far as possible this tick. Returns agents surfaced by the
    /// tasks, for the dispatcher to register.
    pub fn tick(&mut self, rt: &mut Runtime) -> Result<Vec<Agent>> {
        let mut spawned = Vec::new();
        if self.is_done() {
            return Ok(spawned);
        }
        if self.state == AgentState::Queued {
            self.transition(Transition::Started)?;
        }
        self.started = true;

        loop {
            if self.active.is_none() {
                match self.queue.pop_front() {
                    Some(task) => self.active = Some(task),
                    None => {
                        debug!(agent = self.id, history = self.history.len(), "agent finished");
                        self.transition(Transition::Finished)?;
                        break;
                    }
                }
            }
            let Some(task) = self.active.as_mut() else {
                break;
            };
            spawned.extend(task.poll(rt)?);
            if !task.is_done() {
                break;
            }
            if let Some(task) = self.active.take() {
                spawned.extend(self.task_finished(rt, task)?);
            }
        }
        Ok(spawned)
    }

    fn task_finished(&mut self, rt: &mut Runtime, mut task: Task) -> Result<Vec<Agent>> {
        let before = self.state;
        let mut spawned = Vec::new();
        let outcome = task.outcome().unwrap_or(TaskOutcome::Failed);
        if outcome == TaskOutcome::Failed {
            let failure_tasks = task.take_failure_tasks();
            let budget = self.max_recoveries.unwrap_or(rt.config.max_recovery_attempts);
            if failure_tasks.is_empty() {
                self.queue.clear();
            } else if self.state.recovery_attempts() < budget {
                info!(
                    agent = self.id,
                    failed = task.label(),
                    next = ?failure_tasks.iter().map(Task::label).collect::<Vec<_>>(),
                    "escalating"
                );
                self.queue = failure_tasks.into();
                self.transition(Transition::Escalated)?;
            } else {
                error!(
                    agent = self.id,
                    failed = task.label(),
                    attempts = self.state.recovery_attempts(),
                    hosts = ?self.host_ids,
                    "recovery budget exhausted, giving up"
                );
                self.queue.clear();
                // The skipped repairs fail in place, taking their hosts out
                // of service.
                for mut skipped in failure_tasks {
                    spawned.extend(skipped.skip_as_failed(rt)?);
                }
            }
        }
        self.history.push(TaskRecord {
            label: task.label(),
            outcome,
            before,
            after: self.state,
        });
        Ok(spawned)
    }

    /// Abort the active task and drop the rest of the queue. Tasks that
    /// never started are discarded without running anything.
    pub fn abort(&mut self, rt: &mut Runtime) -> Result<Vec<Agent>> {
        if self.is_done() {
            return Ok(Vec::new());
        }
        let before = self.state;
        let mut spawned = Vec::new();
        if let Some(mut task) = self.active.take() {
            spawned = task.abort(rt)?;
            self.queue.clear();
            self.transition(Transition::Aborted)?;
            self.history.push(TaskRecord {
                label: task.label(),
                outcome: TaskOutcome::Aborted,
                before,
                after: self.state,
            });
        } else {
            self.queue.clear();
            self.transition(Transition::Aborted)?;
        }
        info!(agent = self.id, entries = ?self.entry_ids, "agent aborted");
        Ok(spawned)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::entry::EntryStatus;
    use crate::models::host::HostStatus;
    use crate::testing::Fixture;
    use crate::worker::mock::MockOutcome;
    use crate::worker::WorkerMode;

    #[test]
    fn runs_tasks_in_order_within_one_tick_when_they_finish() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        fx.launcher.set_default(WorkerMode::Reboot, MockOutcome::Exit(0));
        fx.launcher.set_default(WorkerMode::Verify, MockOutcome::Exit(0));
        let mut agent = Agent::new(vec![Task::reboot(h, None), Task::verify(h, None)]);
        assert_eq!(agent.state(), AgentState::Queued);
        assert!(!agent.is_started());

        // Each task needs one tick to launch and one to see the exit code.
        agent.tick(&mut fx.rt).unwrap();
        assert_eq!(agent.task_labels(), vec!["reboot", "verify"]);
        agent.tick(&mut fx.rt).unwrap();
        assert_eq!(agent.task_labels(), vec!["verify"]);
        agent.tick(&mut fx.rt).unwrap();
        assert!(agent.is_done());
        assert_eq!(fx.host(h).status, HostStatus::Ready);
        let labels: Vec<_> = agent.history().iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["reboot", "verify"]);
    }

    #[test]
    fn failure_tasks_replace_the_queue() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        fx.launcher.set_default(WorkerMode::Reboot, MockOutcome::Exit(1));
        fx.launcher.set_default(WorkerMode::Repair, MockOutcome::Exit(0));
        let mut agent = Agent::new(vec![Task::reboot(h, None), Task::verify(h, None)]);
        agent.tick(&mut fx.rt).unwrap();
        agent.tick(&mut fx.rt).unwrap();

        assert_eq!(agent.state(), AgentState::Recovering { attempt: 1 });
        assert_eq!(agent.task_labels(), vec!["repair"]);
        agent.tick(&mut fx.rt).unwrap();
        assert!(agent.is_done());
        assert_eq!(fx.launcher.launched(WorkerMode::Verify), 0);
        assert_eq!(fx.host(h).status, HostStatus::Ready);
        let record = &agent.history()[0];
        assert_eq!(record.outcome, TaskOutcome::Failed);
        assert_eq!(record.before, AgentState::Running);
        assert_eq!(record.after, AgentState::Recovering { attempt: 1 });
    }

    #[test]
    fn exhausted_budget_stops_escalation() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        fx.launcher.set_default(WorkerMode::Verify, MockOutcome::Exit(1));
        let mut agent = Agent::new(vec![Task::verify(h, None)]).with_max_recoveries(0);
        agent.tick(&mut fx.rt).unwrap();
        agent.tick(&mut fx.rt).unwrap();

        assert!(agent.is_done());
        assert_eq!(fx.launcher.launched(WorkerMode::Repair), 0);
        assert_eq!(agent.history().len(), 1);
        assert_eq!(fx.host(h).status, HostStatus::RepairFailed);
    }

    #[test]
    fn exhausted_budget_fails_bound_direct_entry() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        let job = fx.add_job("alice", 1);
        let entry = fx.add_entry(job, Some(h), None);
        fx.launcher.set_default(WorkerMode::Verify, MockOutcome::Exit(1));
        let mut agent = Agent::new(vec![Task::verify(h, Some(&entry))]).with_max_recoveries(0);
        agent.tick(&mut fx.rt).unwrap();
        agent.tick(&mut fx.rt).unwrap();

        assert!(agent.is_done());
        assert_eq!(fx.launcher.launched(WorkerMode::Repair), 0);
        assert_eq!(fx.host(h).status, HostStatus::RepairFailed);
        assert_eq!(fx.entry(entry.id).status, EntryStatus::Failed);
    }

    #[test]
    fn ids_and_processes_cover_failure_tasks() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        let job = fx.add_job("alice", 1);
        let entry = fx.add_entry(job, Some(h), None);
        let agent = Agent::new(vec![Task::verify(h, Some(&entry))]);
        assert_eq!(agent.entry_ids().iter().copied().collect::<Vec<_>>(), vec![entry.id]);
        assert!(agent.host_ids().contains(&h));
        assert_eq!(agent.num_processes(), 1);
    }

    #[test]
    fn abort_kills_active_task_and_drops_queue() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        let mut agent = Agent::new(vec![Task::reboot(h, None), Task::verify(h, None)]);
        agent.tick(&mut fx.rt).unwrap();
        assert_eq!(agent.monitored_pid(), Some(1000));

        agent.abort(&mut fx.rt).unwrap();
        assert!(agent.is_done());
        assert!(agent.task_labels().is_empty());
        assert_eq!(fx.processes.killed(), vec![1000]);
        assert_eq!(fx.launcher.launched(WorkerMode::Verify), 0);
        assert_eq!(agent.history()[0].outcome, TaskOutcome::Aborted);
    }

    #[test]
    fn recovered_agent_resumes_polling_without_relaunch() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        let job = fx.add_job("alice", 1);
        let mut entry = fx.add_entry(job, Some(h), None);
        entry.set_execution_subdir(&mut fx.rt.store, "h1").unwrap();
        entry.write_status(&mut fx.rt.store, EntryStatus::Running).unwrap();
        let dir = entry.results_dir(&mut fx.rt).unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(crate::monitor::pidfile::PIDFILE_NAME), "4242\n0\n").unwrap();

        let monitor = crate::monitor::ExecutionMonitor::attach(&dir, fx.rt.now());
        let mut agent = Agent::recovered(Task::recovered_queue(job, &[entry.clone()], monitor));
        assert!(agent.is_started());
        agent.tick(&mut fx.rt).unwrap();

        assert!(agent.is_done());
        assert!(fx.launcher.launches().is_empty());
        assert_eq!(fx.entry(entry.id).status, EntryStatus::Completed);
    }
}
