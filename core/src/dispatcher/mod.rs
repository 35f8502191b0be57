//! The control loop's body: one `tick` advances the whole fleet.
//!
//! Order within a tick is fixed:
//!
//! ```text
//! clear cache -> maintenance -> aborts -> new jobs -> atomic delays
//!   -> starting groups -> agents -> reap exited workers
//!   -> flush notifications
//! ```
//!
//! Aborts run before scheduling, so an entry aborted this tick is never
//! scheduled this tick. Agents created by scheduling are ticked in the same
//! tick; agents surfaced by other agents wait for the next one.

pub mod admission;
pub mod host_scheduler;
pub mod maintenance;
pub mod recovery;


use std::collections::{BTreeMap, BTreeSet, HashMap};

use rusqlite::types::Value;
use tracing::{debug, error, info};

use crate::agent::{Agent, AgentId};
use crate::error::Result;
use crate::models::entry::{EntryStatus, HostQueueEntry};
use crate::models::host::{Host, HostStatus};
use crate::models::job::Job;
use crate::runtime::Runtime;
use crate::store::record;
use crate::store::Query;
use crate::task::Task;
use admission::Admission;
use host_scheduler::HostScheduler;
use maintenance::Maintenance;


pub struct Dispatcher {
    agents: Vec<Agent>,
    next_agent_id: AgentId,
    host_agents: HashMap<i64, BTreeSet<AgentId>>,
    entry_agents: HashMap<i64, BTreeSet<AgentId>>,
    maintenance: Maintenance,
    tick_count: u64,
}

impl Dispatcher {
    pub fn new(rt: &Runtime) -> Dispatcher {
        Dispatcher {
            agents: Vec::new(),
            next_agent_id: 1,
            host_agents: HashMap::new(),
            entry_agents: HashMap::new(),
            maintenance: Maintenance::new(rt.now()),
            tick_count: 0,
        }
    }

    // -- agent registry --

    pub fn add_agent(&mut self, mut agent: Agent) -> AgentId {
        let id = self.next_agent_id;
        self.next_agent_id += 1;
        agent.set_id(id);
        for host in agent.host_ids() {
            self.host_agents.entry(*host).or_default().insert(id);
        }
        for entry in agent.entry_ids() {
            self.entry_agents.entry(*entry).or_default().insert(id);
        }
        debug!(agent = id, tasks = ?agent.task_labels(), hosts = ?agent.host_ids(), "agent added");
        self.agents.push(agent);
        id
    }

    pub fn remove_agent(&mut self, id: AgentId) -> Option<Agent> {
        let index = self.agents.iter().position(|a| a.id() == id)?;
        let agent = self.agents.remove(index);
        for host in agent.host_ids() {
            unregister(&mut self.host_agents, *host, id);
        }
        for entry in agent.entry_ids() {
            unregister(&mut self.entry_agents, *entry, id);
        }
        Some(agent)
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn host_has_agent(&self, host_id: i64) -> bool {
        self.host_agents.get(&host_id).map_or(false, |ids| !ids.is_empty())
    }

    pub fn entry_has_agent(&self, entry_id: i64) -> bool {
        self.entry_agents.get(&entry_id).map_or(false, |ids| !ids.is_empty())
    }

    pub fn agents_for_entry(&self, entry_id: i64) -> Vec<&Agent> {
        let Some(ids) = self.entry_agents.get(&entry_id) else {
            return Vec::new();
        };
        self.agents.iter().filter(|a| ids.contains(&a.id())).collect()
    }

    /// Unregister and return every agent representing the entry.
    fn take_agents_for_entry(&mut self, entry_id: i64) -> Vec<Agent> {
        let ids: Vec<AgentId> = self
            .entry_agents
            .get(&entry_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.remove_agent(id)).collect()
    }

    /// Worker pids of every agent's active task.
    pub fn monitored_pids(&self) -> BTreeSet<u32> {
        self.agents.iter().filter_map(Agent::monitored_pid).collect()
    }

    // -- entry points --

    /// Rebuild agents for work left behind by a previous run.
    pub fn initialize(&mut self, rt: &mut Runtime) -> Result<()> {
        recovery::run(self, rt)
    }

    pub fn tick(&mut self, rt: &mut Runtime) -> Result<()> {
        self.tick_count += 1;
        debug!(tick = self.tick_count, agents = self.agents.len(), "tick");
        rt.store.clear_cache();
        self.maintenance.run_maybe(rt)?;
        self.process_aborts(rt)?;
        self.schedule_new_jobs(rt)?;
        self.schedule_delay_tasks(rt)?;
        self.schedule_starting_entries(rt)?;
        self.handle_agents(rt)?;
        rt.launcher.reap();
        rt.mail.flush();
        Ok(())
    }

    // -- aborts --

    fn process_aborts(&mut self, rt: &mut Runtime) -> Result<()> {
        let entries: Vec<HostQueueEntry> = rt.store.fetch(
            Query::filter(
                "host_queue_entries.status = ?",
                vec![record::text(EntryStatus::Abort.as_str())],
            )
            .order_by("host_queue_entries.id")
            .limit(rt.config.max_aborts_per_tick),
        )?;
        let mut jobs = BTreeSet::new();
        for entry in entries {
            jobs.insert(entry.job_id);
            self.abort_entry(rt, entry)?;
        }
        for job_id in jobs {
            let job: Job = rt.store.get(job_id)?;
            job.stop_if_necessary(rt)?;
        }
        Ok(())
    }

    /// Replace whatever agents hold the entry with one that aborts them and
    /// then reclaims the host with a reboot and a verify. The host is
    /// marked Rebooting at once so nothing else picks it up meanwhile.
    /// A host another agent or live entry is using is left alone.
    fn abort_entry(&mut self, rt: &mut Runtime, mut entry: HostQueueEntry) -> Result<()> {
        let agents = self.take_agents_for_entry(entry.id);
        info!(entry = entry.id, job = entry.job_id, agents = agents.len(), "aborting entry");
        if !entry.aborted {
            entry.mark_aborted(&mut rt.store)?;
        }
        if entry.status != EntryStatus::Aborting {
            entry.set_status(rt, EntryStatus::Aborting)?;
        }

        let mut tasks = vec![Task::abort_entry(&entry, agents)];
        if let Some(mut host) = entry.host(&mut rt.store)? {
            if self.host_in_use_by_others(rt, &host, entry.id)? {
                info!(entry = entry.id, host = %host.hostname, "host busy with other work, not reclaiming");
            } else {
                host.set_status(&mut rt.store, HostStatus::Rebooting)?;
                tasks.push(Task::reboot(host.id, None));
                tasks.push(Task::verify(host.id, None));
            }
        }
        self.add_agent(Agent::new(tasks).with_num_processes(0));
        Ok(())
    }

    /// Whether an agent, or an active entry other than `entry_id` that is
    /// not itself being aborted, holds the host.
    fn host_in_use_by_others(&self, rt: &mut Runtime, host: &Host, entry_id: i64) -> Result<bool> {
        if self.host_has_agent(host.id) {
            return Ok(true);
        }
        let others = rt.store.count(
            "SELECT COUNT(*) FROM host_queue_entries \
             WHERE host_id = ? AND id != ? AND active AND status NOT IN (?, ?)",
            &[
                Value::Integer(host.id),
                Value::Integer(entry_id),
                record::text(EntryStatus::Abort.as_str()),
                record::text(EntryStatus::Aborting.as_str()),
            ],
        )?;
        Ok(others > 0)
    }

    // -- scheduling --

    fn schedule_new_jobs(&mut self, rt: &mut Runtime) -> Result<()> {
        let queued = host_scheduler::pending_queue_entries(&mut rt.store)?;
        if queued.is_empty() {
            return Ok(());
        }
        let mut scheduler = HostScheduler::refresh(&mut rt.store, &queued)?;
        debug!(queued = queued.len(), hosts = scheduler.available_count(), "scheduling new jobs");

        for candidate in queued {
            // Earlier entries of the same job may have moved this one on.
            let mut entry: HostQueueEntry = rt.store.get(candidate.id)?;
            if entry.status != EntryStatus::Queued {
                continue;
            }
            if entry.is_hostless() {
                self.schedule_hostless(rt, &mut entry)?;
            } else if entry.atomic_group_id.is_some() && entry.host_id.is_none() {
                self.schedule_atomic_group(rt, &mut scheduler, &mut entry)?;
            } else if let Some(host) = scheduler.schedule_entry(&entry) {
                if self.host_has_agent(host.id) {
                    continue;
                }
                self.run_entry_on_host(rt, &mut entry, &host)?;
            }
        }
        Ok(())
    }

    fn schedule_hostless(&mut self, rt: &mut Runtime, entry: &mut HostQueueEntry) -> Result<()> {
        info!(entry = entry.id, job = entry.job_id, "starting hostless entry");
        entry.set_execution_subdir(&mut rt.store, "hostless")?;
        entry.set_status(rt, EntryStatus::Starting)
    }

    /// Expand an unassigned atomic group entry over every host found. All
    /// copies exist before any pre-job step runs, so an early Pending
    /// entry sees the full group.
    fn schedule_atomic_group(
        &mut self,
        rt: &mut Runtime,
        scheduler: &mut HostScheduler,
        entry: &mut HostQueueEntry,
    ) -> Result<()> {
        let hosts = scheduler.find_eligible_atomic_group(rt, entry)?;
        let Some((first, rest)) = hosts.split_first() else {
            return Ok(());
        };
        entry.set_host(&mut rt.store, Some(first.id))?;
        let mut members = vec![(entry.id, first)];
        for host in rest {
            let mut copy = entry.clone_for_host(host.id);
            rt.store.save(&mut copy)?;
            copy.set_host(&mut rt.store, Some(host.id))?;
            members.push((copy.id, host));
        }
        for (entry_id, host) in members {
            let mut member: HostQueueEntry = rt.store.get(entry_id)?;
            if member.status != EntryStatus::Queued {
                continue;
            }
            self.run_entry_on_host(rt, &mut member, host)?;
        }
        Ok(())
    }

    fn run_entry_on_host(
        &mut self,
        rt: &mut Runtime,
        entry: &mut HostQueueEntry,
        host: &Host,
    ) -> Result<()> {
        if entry.host_id != Some(host.id) {
            entry.set_host(&mut rt.store, Some(host.id))?;
        }
        if let Some(agent) = entry.schedule_pre_job_tasks(rt)? {
            self.add_agent(agent);
        }
        Ok(())
    }

    /// Waiting atomic group entries go back to Pending under one countdown
    /// per job.
    fn schedule_delay_tasks(&mut self, rt: &mut Runtime) -> Result<()> {
        let waiting: Vec<HostQueueEntry> = rt.store.fetch(
            Query::filter(
                "host_queue_entries.status = ?",
                vec![record::text(EntryStatus::Waiting.as_str())],
            )
            .order_by("host_queue_entries.id"),
        )?;
        for mut entry in waiting {
            let job = entry.job(&mut rt.store)?;
            if let Some(agent) = job.schedule_delayed_callback_task(rt, &mut entry)? {
                self.add_agent(agent);
            }
        }
        Ok(())
    }

    /// One queue agent per (job, execution subdir) group of Starting
    /// entries that nothing represents yet.
    fn schedule_starting_entries(&mut self, rt: &mut Runtime) -> Result<()> {
        let starting: Vec<HostQueueEntry> = rt.store.fetch(
            Query::filter(
                "host_queue_entries.status = ?",
                vec![record::text(EntryStatus::Starting.as_str())],
            )
            .order_by("host_queue_entries.job_id, host_queue_entries.id"),
        )?;
        let mut groups: BTreeMap<(i64, String), Vec<HostQueueEntry>> = BTreeMap::new();
        for entry in starting {
            if self.entry_has_agent(entry.id) {
                continue;
            }
            groups
                .entry((entry.job_id, entry.execution_subdir.clone()))
                .or_default()
                .push(entry);
        }

        for ((job_id, subdir), entries) in groups {
            let busy: Vec<i64> = entries
                .iter()
                .filter_map(|e| e.host_id)
                .filter(|h| self.host_has_agent(*h))
                .collect();
            if !busy.is_empty() {
                error!(job = job_id, subdir = %subdir, hosts = ?busy, "hosts of a starting group already have agents, not starting it");
                continue;
            }
            let job: Job = rt.store.get(job_id)?;
            info!(job = %job.tag(), subdir = %subdir, entries = entries.len(), "starting queue task");
            self.add_agent(Agent::new(vec![Task::queue(&job, &entries)]));
        }
        Ok(())
    }

    // -- agents --

    /// Tick every started agent, and start new ones as admission allows.
    fn handle_agents(&mut self, rt: &mut Runtime) -> Result<()> {
        let running = self
            .agents
            .iter()
            .filter(|a| a.is_started() && !a.is_done() && a.num_processes() > 0)
            .count();
        let mut admission = Admission::new(&rt.config, running);
        let mut spawned = Vec::new();
        let mut finished = Vec::new();

        for agent in self.agents.iter_mut() {
            if !agent.is_started() && !admission.try_start(agent.num_processes()) {
                continue;
            }
            spawned.extend(agent.tick(rt)?);
            if agent.is_done() {
                finished.push(agent.id());
            }
        }
        if admission.started_this_tick() > 0 {
            debug!(started = admission.started_this_tick(), "agents started");
        }

        for id in finished {
            if let Some(agent) = self.remove_agent(id) {
                debug!(agent = id, history = agent.history().len(), "agent done");
            }
        }
        for agent in spawned {
            self.add_agent(agent);
        }
        Ok(())
    }
}


fn unregister(index: &mut HashMap<i64, BTreeSet<AgentId>>, key: i64, id: AgentId) {
    if let Some(ids) = index.get_mut(&key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(&key);
        }
    }
}


/// Entries in any of `statuses`, oldest first.
fn entries_with_status(
    rt: &mut Runtime,
    statuses: &[EntryStatus],
) -> Result<Vec<HostQueueEntry>> {
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let params: Vec<Value> = statuses.iter().map(|s| record::text(s.as_str())).collect();
    Ok(rt.store.fetch(
        Query::filter(
            &format!("host_queue_entries.status IN ({})", placeholders),
            params,
        )
        .order_by("host_queue_entries.job_id, host_queue_entries.id"),
    )?)
}
