//! Jobs and the rendezvous logic that decides when their entries start.
//!
//! A job with `synch_count` N runs only once N of its entries are Pending at
//! the same time. Atomic group jobs may additionally wait a bounded time for
//! more hosts before the group size is fixed.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::agent::Agent;
use crate::error::{Result, StoreError};
use crate::models::entry::{EntryStatus, HostQueueEntry};
use crate::models::host::{cmp_hostnames, Host, HostStatus, Protection};
use crate::runtime::{ReadyDelay, Runtime};
use crate::store::record::{self, Record, RowReader};
use crate::store::{Query, Store};
use crate::task::{DelayedAction, Task};

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootBefore {
    Never,
    IfDirty,
    Always,
}

impl TryFrom<i64> for RebootBefore {
    type Error = String;

    fn try_from(code: i64) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(RebootBefore::Never),
            1 => Ok(RebootBefore::IfDirty),
            2 => Ok(RebootBefore::Always),
            other => Err(format!("unknown reboot_before {}", other)),
        }
    }
}

impl RebootBefore {
    pub fn code(self) -> i64 {
        match self {
            RebootBefore::Never => 0,
            RebootBefore::IfDirty => 1,
            RebootBefore::Always => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootAfter {
    Never,
    IfAllTestsPassed,
    Always,
}

impl TryFrom<i64> for RebootAfter {
    type Error = String;

    fn try_from(code: i64) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(RebootAfter::Never),
            1 => Ok(RebootAfter::IfAllTestsPassed),
            2 => Ok(RebootAfter::Always),
            other => Err(format!("unknown reboot_after {}", other)),
        }
    }
}

impl RebootAfter {
    pub fn code(self) -> i64 {
        match self {
            RebootAfter::Never => 0,
            RebootAfter::IfAllTestsPassed => 1,
            RebootAfter::Always => 2,
        }
    }
}

/// Where the control blob runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    Server,
    Client,
}

impl TryFrom<i64> for ControlType {
    type Error = String;

    fn try_from(code: i64) -> std::result::Result<Self, Self::Error> {
        match code {
            1 => Ok(ControlType::Server),
            2 => Ok(ControlType::Client),
            other => Err(format!("unknown control_type {}", other)),
        }
    }
}

impl ControlType {
    pub fn code(self) -> i64 {
        match self {
            ControlType::Server => 1,
            ControlType::Client => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub priority: i64,
    pub control_file: String,
    pub control_type: ControlType,
    pub created_on: DateTime<Utc>,
    pub synch_count: i64,
    /// Wall-clock budget in hours, counted from creation.
    pub timeout: i64,
    pub run_verify: bool,
    pub email_list: String,
    pub reboot_before: RebootBefore,
    pub reboot_after: RebootAfter,
    pub reserve_hosts: bool,
}

impl Record for Job {
    const TABLE: &'static str = "jobs";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "owner",
        "name",
        "priority",
        "control_file",
        "control_type",
        "created_on",
        "synch_count",
        "timeout",
        "run_verify",
        "email_list",
        "reboot_before",
        "reboot_after",
        "reserve_hosts",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn from_values(values: &[Value]) -> std::result::Result<Self, StoreError> {
        let row = RowReader::new::<Self>(values)?;
        Ok(Job {
            id: row.int(0)?,
            owner: row.text(1)?,
            name: row.text(2)?,
            priority: row.int(3)?,
            control_file: row.text(4)?,
            control_type: row.coded(5)?,
            created_on: row.time(6)?,
            synch_count: row.int(7)?,
            timeout: row.int(8)?,
            run_verify: row.flag(9)?,
            email_list: row.text(10)?,
            reboot_before: row.coded(11)?,
            reboot_after: row.coded(12)?,
            reserve_hosts: row.flag(13)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            record::text(&self.owner),
            record::text(&self.name),
            Value::Integer(self.priority),
            record::text(&self.control_file),
            Value::Integer(self.control_type.code()),
            record::time(&self.created_on),
            Value::Integer(self.synch_count),
            Value::Integer(self.timeout),
            record::flag(self.run_verify),
            record::text(&self.email_list),
            Value::Integer(self.reboot_before.code()),
            Value::Integer(self.reboot_after.code()),
            record::flag(self.reserve_hosts),
        ]
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.tag(), self.name)
    }
}

impl Job {
    /// An unsaved single-host job with the frontend's defaults.
    pub fn new(owner: &str, name: &str, created_on: DateTime<Utc>) -> Job {
        Job {
            id: 0,
            owner: owner.to_string(),
            name: name.to_string(),
            priority: 0,
            control_file: String::new(),
            control_type: ControlType::Client,
            created_on,
            synch_count: 1,
            timeout: 72,
            run_verify: true,
            email_list: String::new(),
            reboot_before: RebootBefore::IfDirty,
            reboot_after: RebootAfter::Never,
            reserve_hosts: false,
        }
    }

    pub fn tag(&self) -> String {
        format!("{}-{}", self.id, self.owner)
    }

    pub fn is_synchronous(&self) -> bool {
        self.synch_count > 1
    }

    pub fn email_recipients(&self) -> Vec<String> {
        self.email_list
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.created_on + Duration::hours(self.timeout) < now
    }

    pub fn should_reboot_before(&self, host: &Host) -> bool {
        match self.reboot_before {
            RebootBefore::Never => false,
            RebootBefore::IfDirty => host.dirty,
            RebootBefore::Always => true,
        }
    }

    pub fn should_verify(&self, host: &Host) -> bool {
        self.run_verify && host.protection != Protection::DoNotVerify
    }

    pub fn should_reboot_after(&self, success: bool) -> bool {
        match self.reboot_after {
            RebootAfter::Never => false,
            RebootAfter::IfAllTestsPassed => success,
            RebootAfter::Always => true,
        }
    }

    // -- entry queries --

    pub fn entries(&self, store: &mut Store) -> std::result::Result<Vec<HostQueueEntry>, StoreError> {
        store.fetch(
            Query::filter("host_queue_entries.job_id = ?", vec![Value::Integer(self.id)])
                .order_by("host_queue_entries.id"),
        )
    }

    fn entries_with_status(
        &self,
        store: &mut Store,
        statuses: &[EntryStatus],
    ) -> std::result::Result<Vec<HostQueueEntry>, StoreError> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let mut params = vec![Value::Integer(self.id)];
        params.extend(statuses.iter().map(|s| record::text(s.as_str())));
        store.fetch(
            Query::filter(
                &format!(
                    "host_queue_entries.job_id = ? AND host_queue_entries.status IN ({})",
                    placeholders
                ),
                params,
            )
            .order_by("host_queue_entries.id"),
        )
    }

    fn count_where(&self, store: &mut Store, clause: &str) -> std::result::Result<i64, StoreError> {
        store.count(
            &format!(
                "SELECT COUNT(*) FROM host_queue_entries WHERE job_id = ? AND {}",
                clause
            ),
            &[Value::Integer(self.id)],
        )
    }

    pub fn pending_count(&self, store: &mut Store) -> std::result::Result<i64, StoreError> {
        self.count_where(store, "status = 'Pending'")
    }

    pub fn hosts_assigned_count(&self, store: &mut Store) -> std::result::Result<i64, StoreError> {
        self.count_where(store, "host_id IS NOT NULL")
    }

    /// Entries whose worker has not started: Queued, Pending or Verifying.
    pub fn not_yet_run_count(&self, store: &mut Store) -> std::result::Result<i64, StoreError> {
        self.count_where(store, "status IN ('Queued', 'Pending', 'Verifying')")
    }

    /// An atomic group job runs at most once; after that new hosts may not
    /// join it.
    pub fn atomic_and_has_started(&self, store: &mut Store) -> std::result::Result<bool, StoreError> {
        let started = self.count_where(
            store,
            "atomic_group_id IS NOT NULL \
             AND status IN ('Starting', 'Running', 'Gathering', 'Parsing', 'Archiving', 'Completed')",
        )?;
        Ok(started > 0)
    }

    pub fn is_ready(&self, store: &mut Store) -> std::result::Result<bool, StoreError> {
        let pending = self.pending_count(store)?;
        if pending < self.synch_count {
            return Ok(false);
        }
        Ok(!self.atomic_and_has_started(store)?)
    }

    pub fn is_finished(&self, store: &mut Store) -> std::result::Result<bool, StoreError> {
        Ok(self.count_where(store, "NOT complete")? == 0)
    }

    // -- stopping and failing --

    /// Stop the remaining unstarted entries once too few are left to ever
    /// reach `synch_count`.
    pub fn stop_if_necessary(&self, rt: &mut Runtime) -> Result<()> {
        let not_yet_run = self.not_yet_run_count(&mut rt.store)?;
        if not_yet_run < self.synch_count {
            self.finish_unstarted(rt, &[EntryStatus::Queued, EntryStatus::Pending], EntryStatus::Stopped, None)?;
        }
        Ok(())
    }

    /// A synchronous job lost one of its hosts before starting: every other
    /// entry that has not run yet fails with it.
    pub fn fail_unstarted_entries(&self, rt: &mut Runtime, except: i64) -> Result<()> {
        self.finish_unstarted(
            rt,
            &[
                EntryStatus::Queued,
                EntryStatus::Verifying,
                EntryStatus::Pending,
                EntryStatus::Waiting,
                EntryStatus::Starting,
            ],
            EntryStatus::Failed,
            Some(except),
        )
    }

    /// Entries are written quietly; completion hooks would recurse back
    /// into this job.
    fn finish_unstarted(
        &self,
        rt: &mut Runtime,
        statuses: &[EntryStatus],
        to: EntryStatus,
        except: Option<i64>,
    ) -> Result<()> {
        for mut entry in self.entries_with_status(&mut rt.store, statuses)? {
            if Some(entry.id) == except {
                continue;
            }
            let holds_host = matches!(
                entry.status,
                EntryStatus::Pending | EntryStatus::Waiting | EntryStatus::Starting
            );
            if holds_host {
                if let Some(mut host) = entry.host(&mut rt.store)? {
                    host.set_status(&mut rt.store, HostStatus::Ready)?;
                }
            }
            info!(entry = entry.id, job = %self.tag(), from = %entry.status, to = %to, "finishing unstarted entry");
            entry.write_status(&mut rt.store, to)?;
        }
        Ok(())
    }

    /// Flag every incomplete entry for abort. Active entries become Abort
    /// and are picked up by the dispatcher; inactive ones are finished
    /// directly. The two sets are disjoint, so nothing is handled twice.
    pub fn abort_entries(&self, rt: &mut Runtime) -> Result<usize> {
        let active: Vec<HostQueueEntry> = rt.store.fetch(Query::filter(
            "host_queue_entries.job_id = ? AND host_queue_entries.active \
             AND NOT host_queue_entries.complete",
            vec![Value::Integer(self.id)],
        ))?;
        let mut flagged = 0;
        for mut entry in active {
            entry.mark_aborted(&mut rt.store)?;
            if !entry.status.is_aborting() {
                entry.write_status(&mut rt.store, EntryStatus::Abort)?;
            }
            flagged += 1;
        }

        let inactive: Vec<HostQueueEntry> = rt.store.fetch(Query::filter(
            "host_queue_entries.job_id = ? AND NOT host_queue_entries.active \
             AND NOT host_queue_entries.complete",
            vec![Value::Integer(self.id)],
        ))?;
        for mut entry in inactive {
            entry.mark_aborted(&mut rt.store)?;
            entry.set_status(rt, EntryStatus::Aborted)?;
            flagged += 1;
        }
        self.cancel_ready_delay(rt);
        Ok(flagged)
    }

    // -- starting --

    /// Called whenever an entry reaches Pending.
    pub fn run_if_ready(&self, rt: &mut Runtime, entry: &mut HostQueueEntry) -> Result<()> {
        if !self.is_ready(&mut rt.store)? {
            self.stop_if_necessary(rt)?;
        } else if entry.atomic_group_id.is_some() {
            self.run_with_ready_delay(rt, entry)?;
        } else {
            self.run(rt, entry)?;
        }
        Ok(())
    }

    /// Atomic groups start right away when every assigned host (up to the
    /// group maximum) is Pending or the wait has run out. Otherwise the
    /// entry waits for the delayed call.
    pub fn run_with_ready_delay(&self, rt: &mut Runtime, entry: &mut HostQueueEntry) -> Result<()> {
        let delay_disabled = rt.config.secs_to_wait_for_atomic_group_hosts == 0;
        let pending = self.count_where(&mut rt.store, "status IN ('Pending', 'Waiting')")?;
        let mut wanted = self.hosts_assigned_count(&mut rt.store)?;
        if let Some(group) = entry.atomic_group(&mut rt.store)? {
            wanted = wanted.min(group.max_number_of_machines);
        }
        let now = rt.now();
        let delay_expired = rt
            .ready_delays
            .get(&self.id)
            .map_or(false, |delay| now >= delay.end_time);

        if delay_disabled || pending >= wanted || delay_expired {
            self.run(rt, entry)?;
        } else {
            entry.set_status(rt, EntryStatus::Waiting)?;
        }
        Ok(())
    }

    /// Turn a Waiting entry back into Pending and make sure exactly one
    /// delayed call is counting down for this job.
    pub fn schedule_delayed_callback_task(
        &self,
        rt: &mut Runtime,
        entry: &mut HostQueueEntry,
    ) -> Result<Option<Agent>> {
        entry.set_status(rt, EntryStatus::Pending)?;
        if rt.ready_delays.contains_key(&self.id) {
            return Ok(None);
        }
        let end_time = rt.now() + rt.config.atomic_group_delay();
        info!(job = %self.tag(), %end_time, "waiting for more atomic group hosts");
        rt.ready_delays.insert(
            self.id,
            ReadyDelay {
                end_time,
                cancelled: false,
            },
        );
        let task = Task::delayed_call(
            end_time,
            DelayedAction::RunAtomicGroup {
                job_id: self.id,
                entry_id: entry.id,
            },
        );
        Ok(Some(Agent::new(vec![task])))
    }

    pub fn cancel_ready_delay(&self, rt: &mut Runtime) {
        if let Some(delay) = rt.ready_delays.get_mut(&self.id) {
            delay.cancelled = true;
        }
    }

    /// Pick the group that runs together with `entry`, give it an execution
    /// subdir and move it to Starting. Returns the started entries; empty
    /// when the job cannot start.
    pub fn run(&self, rt: &mut Runtime, entry: &HostQueueEntry) -> Result<Vec<HostQueueEntry>> {
        if entry.atomic_group_id.is_some() && self.atomic_and_has_started(&mut rt.store)? {
            error!(job = %self.tag(), entry = entry.id, "atomic group job already started, not running again");
            return Ok(Vec::new());
        }
        let mut group = self.choose_group_to_run(rt, entry)?;
        for member in group.iter_mut() {
            member.set_status(rt, EntryStatus::Starting)?;
        }
        if !group.is_empty() {
            self.cancel_ready_delay(rt);
        }
        Ok(group)
    }

    fn choose_group_to_run(
        &self,
        rt: &mut Runtime,
        include: &HostQueueEntry,
    ) -> Result<Vec<HostQueueEntry>> {
        let wanted = match include.atomic_group(&mut rt.store)? {
            Some(group) => group.max_number_of_machines,
            None => self.synch_count,
        };
        let mut chosen: Vec<HostQueueEntry> = vec![rt.store.get(include.id)?];

        if wanted > 1 {
            let others: Vec<HostQueueEntry> = rt.store.fetch(Query::filter(
                "host_queue_entries.job_id = ? \
                 AND host_queue_entries.status IN ('Pending', 'Waiting') \
                 AND host_queue_entries.id != ?",
                vec![Value::Integer(self.id), Value::Integer(include.id)],
            ))?;
            let mut named = Vec::with_capacity(others.len());
            for other in others {
                let hostname = match other.host(&mut rt.store)? {
                    Some(host) => host.hostname,
                    None => String::new(),
                };
                named.push((hostname, other));
            }
            named.sort_by(|a, b| cmp_hostnames(&a.0, &b.0));
            chosen.extend(
                named
                    .into_iter()
                    .take(wanted as usize - 1)
                    .map(|(_, entry)| entry),
            );
        }

        if (chosen.len() as i64) < self.synch_count {
            error!(job = %self.tag(), chosen = chosen.len(), synch_count = self.synch_count, "too few entries chosen to run");
            rt.mail.enqueue_admin(
                &format!("Job {} not started", self.tag()),
                &format!(
                    "Only {} of {} required entries were Pending when job {} tried to start.",
                    chosen.len(),
                    self.synch_count,
                    self.tag()
                ),
            );
            return Ok(Vec::new());
        }

        let group_name = include.group_name(&mut rt.store)?;
        self.assign_new_group(rt, &mut chosen, &group_name)?;
        Ok(chosen)
    }

    fn assign_new_group(
        &self,
        rt: &mut Runtime,
        group: &mut [HostQueueEntry],
        group_name: &str,
    ) -> Result<()> {
        let subdir = if group.len() == 1 {
            match group[0].host(&mut rt.store)? {
                Some(host) => host.hostname,
                None => "hostless".to_string(),
            }
        } else {
            self.next_group_name(&mut rt.store, group_name)?
        };
        info!(job = %self.tag(), subdir = %subdir, size = group.len(), "running group");
        for member in group.iter_mut() {
            member.set_execution_subdir(&mut rt.store, &subdir)?;
        }
        Ok(())
    }

    /// `[<group name>.]groupN` with N one past the highest in use.
    fn next_group_name(
        &self,
        store: &mut Store,
        group_name: &str,
    ) -> std::result::Result<String, StoreError> {
        let prefix = if group_name.is_empty() {
            "group".to_string()
        } else {
            format!("{}.group", group_name.replace(['/', ' '], "_"))
        };
        let used = store.strings(
            "SELECT DISTINCT execution_subdir FROM host_queue_entries WHERE job_id = ?",
            &[Value::Integer(self.id)],
        )?;
        let next = used
            .iter()
            .filter_map(|subdir| subdir.strip_prefix(&prefix))
            .filter_map(|n| n.parse::<u32>().ok())
            .map(|n| n + 1)
            .max()
            .unwrap_or(0);
        Ok(format!("{}{}", prefix, next))
    }

    /// Entries sharing `entry`'s execution subdir, i.e. its running group.
    pub fn group_entries(
        &self,
        store: &mut Store,
        entry: &HostQueueEntry,
    ) -> std::result::Result<Vec<HostQueueEntry>, StoreError> {
        store.fetch(
            Query::filter(
                "host_queue_entries.job_id = ? AND host_queue_entries.execution_subdir = ?",
                vec![Value::Integer(self.id), record::text(&entry.execution_subdir)],
            )
            .order_by("host_queue_entries.id"),
        )
    }

    pub fn email_completion(&self, rt: &mut Runtime) -> Result<()> {
        let recipients = self.email_recipients();
        if recipients.is_empty() {
            return Ok(());
        }
        let mut body = format!("Job {} ({}) finished.\n\n", self.tag(), self.name);
        for entry in self.entries(&mut rt.store)? {
            let hostname = match entry.host(&mut rt.store)? {
                Some(host) => host.hostname,
                None => "no host".to_string(),
            };
            body.push_str(&format!("{:<24} {}\n", hostname, entry.status));
        }
        rt.mail
            .enqueue(recipients, &format!("Job {} {} finished", self.tag(), self.name), &body);
        Ok(())
    }
}


/// Fire the atomic group countdown. Runs the job with whatever hosts are
/// Pending, or aborts it when fewer than `synch_count` made it.
pub fn run_delayed(rt: &mut Runtime, job_id: i64, entry_id: i64) -> Result<Option<Agent>> {
    if rt.ready_delays.get(&job_id).map_or(true, |d| d.cancelled) {
        return Ok(None);
    }
    let job: Job = rt.store.get(job_id)?;
    info!(job = %job.tag(), "done waiting for atomic group hosts");
    if job.pending_count(&mut rt.store)? < job.synch_count {
        warn!(job = %job.tag(), "too few hosts ready after waiting, aborting");
        job.abort_entries(rt)?;
        return Ok(None);
    }

    let mut entry: HostQueueEntry = rt.store.get(entry_id)?;
    if entry.status != EntryStatus::Pending {
        let pending: Vec<HostQueueEntry> = rt.store.fetch(
            Query::filter(
                "host_queue_entries.job_id = ? AND host_queue_entries.status = 'Pending'",
                vec![Value::Integer(job_id)],
            )
            .order_by("host_queue_entries.id")
            .limit(1),
        )?;
        match pending.into_iter().next() {
            Some(other) => entry = other,
            None => return Ok(None),
        }
    }
    let group = job.run(rt, &entry)?;
    if group.is_empty() {
        return Ok(None);
    }
    Ok(Some(Agent::new(vec![Task::queue(&job, &group)])))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn tag_and_recipients() {
        let mut job = Job::new("alice", "smoke", Utc::now());
        job.id = 12;
        job.email_list = "a@x.org, b@x.org  c@x.org".into();
        assert_eq!(job.tag(), "12-alice");
        assert_eq!(job.email_recipients(), vec!["a@x.org", "b@x.org", "c@x.org"]);
    }

    #[test]
    fn timeout_counts_from_creation() {
        let created = Utc::now();
        let mut job = Job::new("alice", "smoke", created);
        job.timeout = 2;
        assert!(!job.is_timed_out(created + Duration::hours(1)));
        assert!(job.is_timed_out(created + Duration::hours(3)));
    }

    #[test]
    fn reboot_policies() {
        let mut job = Job::new("alice", "smoke", Utc::now());
        let mut host = Host::new("h1");
        assert!(!job.should_reboot_before(&host));
        host.dirty = true;
        assert!(job.should_reboot_before(&host));
        job.reboot_before = RebootBefore::Never;
        assert!(!job.should_reboot_before(&host));

        job.reboot_after = RebootAfter::IfAllTestsPassed;
        assert!(job.should_reboot_after(true));
        assert!(!job.should_reboot_after(false));

        host.protection = Protection::DoNotVerify;
        assert!(!job.should_verify(&host));
    }

    #[test]
    fn synchronous_job_waits_for_synch_count() {
        let mut fx = Fixture::new();
        let a = fx.add_host("a1");
        let b = fx.add_host("b1");
        let job_id = fx.add_job("alice", 2);
        let mut ea = fx.add_entry(job_id, Some(a), None);
        let mut eb = fx.add_entry(job_id, Some(b), None);
        ea.write_status(&mut fx.rt.store, EntryStatus::Verifying).unwrap();
        eb.write_status(&mut fx.rt.store, EntryStatus::Verifying).unwrap();

        ea.on_pending(&mut fx.rt).unwrap();
        assert_eq!(fx.entry(ea.id).status, EntryStatus::Pending);

        eb.on_pending(&mut fx.rt).unwrap();
        let ea = fx.entry(ea.id);
        let eb = fx.entry(eb.id);
        assert_eq!(ea.status, EntryStatus::Starting);
        assert_eq!(eb.status, EntryStatus::Starting);
        assert_eq!(ea.execution_subdir, "group0");
        assert_eq!(eb.execution_subdir, "group0");
    }

    #[test]
    fn single_entry_group_uses_hostname() {
        let mut fx = Fixture::new();
        let a = fx.add_host("a1");
        let job_id = fx.add_job("alice", 1);
        let mut entry = fx.add_entry(job_id, Some(a), None);
        entry.on_pending(&mut fx.rt).unwrap();
        let entry = fx.entry(entry.id);
        assert_eq!(entry.status, EntryStatus::Starting);
        assert_eq!(entry.execution_subdir, "a1");
    }

    #[test]
    fn stop_if_necessary_stops_when_too_few_remain() {
        let mut fx = Fixture::new();
        let a = fx.add_host("a1");
        let b = fx.add_host("b1");
        let job_id = fx.add_job("alice", 2);
        let mut ea = fx.add_entry(job_id, Some(a), None);
        let mut eb = fx.add_entry(job_id, Some(b), None);
        ea.on_pending(&mut fx.rt).unwrap();
        assert_eq!(fx.host(a).status, HostStatus::Pending);

        eb.set_status(&mut fx.rt, EntryStatus::Failed).unwrap();
        assert_eq!(fx.entry(ea.id).status, EntryStatus::Stopped);
        assert_eq!(fx.host(a).status, HostStatus::Ready);
    }

    #[test]
    fn fail_unstarted_skips_the_trigger() {
        let mut fx = Fixture::new();
        let a = fx.add_host("a1");
        let b = fx.add_host("b1");
        let job_id = fx.add_job("alice", 2);
        let ea = fx.add_entry(job_id, Some(a), None);
        let mut eb = fx.add_entry(job_id, Some(b), None);
        eb.write_status(&mut fx.rt.store, EntryStatus::Verifying).unwrap();
        let job: Job = fx.rt.store.get(job_id).unwrap();
        job.fail_unstarted_entries(&mut fx.rt, ea.id).unwrap();
        assert_eq!(fx.entry(ea.id).status, EntryStatus::Queued);
        assert_eq!(fx.entry(eb.id).status, EntryStatus::Failed);
    }

    #[test]
    fn abort_entries_splits_active_and_inactive() {
        let mut fx = Fixture::new();
        let a = fx.add_host("a1");
        let b = fx.add_host("b1");
        let job_id = fx.add_job("alice", 1);
        let mut running = fx.add_entry(job_id, Some(a), None);
        running.write_status(&mut fx.rt.store, EntryStatus::Running).unwrap();
        let queued = fx.add_entry(job_id, Some(b), None);

        let job: Job = fx.rt.store.get(job_id).unwrap();
        assert_eq!(job.abort_entries(&mut fx.rt).unwrap(), 2);
        let running = fx.entry(running.id);
        let queued = fx.entry(queued.id);
        assert_eq!(running.status, EntryStatus::Abort);
        assert!(running.aborted && running.active);
        assert_eq!(queued.status, EntryStatus::Aborted);
        assert!(queued.complete);
    }

    #[test]
    fn next_group_name_increments() {
        let mut fx = Fixture::new();
        let job_id = fx.add_job("alice", 2);
        let mut e = fx.add_entry(job_id, None, None);
        e.set_execution_subdir(&mut fx.rt.store, "rack.group3").unwrap();
        let job: Job = fx.rt.store.get(job_id).unwrap();
        assert_eq!(job.next_group_name(&mut fx.rt.store, "rack").unwrap(), "rack.group4");
        assert_eq!(job.next_group_name(&mut fx.rt.store, "").unwrap(), "group0");
    }

    #[test]
    fn atomic_group_waits_then_runs_when_all_pending() {
        let mut fx = Fixture::new();
        let group = fx.add_atomic_group("rack", 3);
        let hosts: Vec<i64> = ["r1", "r2", "r3"].iter().map(|h| fx.add_host(h)).collect();
        let label = fx.add_label("rack", &hosts);
        fx.set_label_atomic_group(label, group);
        let job_id = fx.add_job("alice", 2);
        let mut entries: Vec<HostQueueEntry> = hosts
            .iter()
            .map(|h| {
                let mut e = fx.add_entry(job_id, Some(*h), Some(label));
                e.atomic_group_id = Some(group);
                fx.rt.store.save(&mut e).unwrap();
                e
            })
            .collect();

        entries[0].on_pending(&mut fx.rt).unwrap();
        assert_eq!(fx.entry(entries[0].id).status, EntryStatus::Pending);
        entries[1].on_pending(&mut fx.rt).unwrap();
        // Two of three hosts are ready: wait for the third.
        assert_eq!(fx.entry(entries[1].id).status, EntryStatus::Waiting);

        entries[2].on_pending(&mut fx.rt).unwrap();
        for e in &entries {
            let fresh = fx.entry(e.id);
            assert_eq!(fresh.status, EntryStatus::Starting);
            assert_eq!(fresh.execution_subdir, "rack.group0");
        }
    }

    #[test]
    fn delayed_call_aborts_when_too_few_pending() {
        let mut fx = Fixture::new();
        let a = fx.add_host("a1");
        let job_id = fx.add_job("alice", 2);
        let mut e = fx.add_entry(job_id, Some(a), None);
        e.write_status(&mut fx.rt.store, EntryStatus::Pending).unwrap();
        let now = fx.rt.now();
        fx.rt.ready_delays.insert(job_id, ReadyDelay { end_time: now, cancelled: false });

        let agent = run_delayed(&mut fx.rt, job_id, e.id).unwrap();
        assert!(agent.is_none());
        let e = fx.entry(e.id);
        assert_eq!(e.status, EntryStatus::Abort);
    }

    #[test]
    fn cancelled_delay_does_nothing() {
        let mut fx = Fixture::new();
        let job_id = fx.add_job("alice", 2);
        let now = fx.rt.now();
        fx.rt.ready_delays.insert(job_id, ReadyDelay { end_time: now, cancelled: true });
        assert!(run_delayed(&mut fx.rt, job_id, 1).unwrap().is_none());
    }
}
