//! Host queue entries: the scheduling unit pairing one job with one host.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::error::{Result, SchedulerError, StoreError};
use crate::models::host::{Host, HostStatus};
use crate::models::ineligible;
use crate::models::job::Job;
use crate::models::label::{AtomicGroup, Label};
use crate::models::acl;
use crate::runtime::Runtime;
use crate::store::record::{self, Record, RowReader};
use crate::store::{Query, Store};
use crate::task::Task;

// ---------------------------------------------------------------------------
// EntryStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Queued,
    Verifying,
    Pending,
    Waiting,
    Starting,
    Running,
    Gathering,
    Parsing,
    Archiving,
    Completed,
    Failed,
    Stopped,
    Abort,
    Aborting,
    Aborted,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 15] = [
        EntryStatus::Queued,
        EntryStatus::Verifying,
        EntryStatus::Pending,
        EntryStatus::Waiting,
        EntryStatus::Starting,
        EntryStatus::Running,
        EntryStatus::Gathering,
        EntryStatus::Parsing,
        EntryStatus::Archiving,
        EntryStatus::Completed,
        EntryStatus::Failed,
        EntryStatus::Stopped,
        EntryStatus::Abort,
        EntryStatus::Aborting,
        EntryStatus::Aborted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Queued => "Queued",
            EntryStatus::Verifying => "Verifying",
            EntryStatus::Pending => "Pending",
            EntryStatus::Waiting => "Waiting",
            EntryStatus::Starting => "Starting",
            EntryStatus::Running => "Running",
            EntryStatus::Gathering => "Gathering",
            EntryStatus::Parsing => "Parsing",
            EntryStatus::Archiving => "Archiving",
            EntryStatus::Completed => "Completed",
            EntryStatus::Failed => "Failed",
            EntryStatus::Stopped => "Stopped",
            EntryStatus::Abort => "Abort",
            EntryStatus::Aborting => "Aborting",
            EntryStatus::Aborted => "Aborted",
        }
    }

    /// The `(active, complete)` pair stored alongside the status. The two
    /// flags are never written any other way.
    pub fn flags(self) -> (bool, bool) {
        match self {
            EntryStatus::Queued => (false, false),
            EntryStatus::Verifying
            | EntryStatus::Pending
            | EntryStatus::Waiting
            | EntryStatus::Starting
            | EntryStatus::Running
            | EntryStatus::Gathering
            | EntryStatus::Parsing
            | EntryStatus::Archiving
            | EntryStatus::Abort
            | EntryStatus::Aborting => (true, false),
            EntryStatus::Completed
            | EntryStatus::Failed
            | EntryStatus::Stopped
            | EntryStatus::Aborted => (false, true),
        }
    }

    pub fn is_active(self) -> bool {
        self.flags().0
    }

    pub fn is_complete(self) -> bool {
        self.flags().1
    }

    /// Statuses whose worker has not started yet.
    pub fn is_unstarted(self) -> bool {
        matches!(
            self,
            EntryStatus::Queued | EntryStatus::Pending | EntryStatus::Verifying
        )
    }

    pub fn is_aborting(self) -> bool {
        matches!(
            self,
            EntryStatus::Abort | EntryStatus::Aborting | EntryStatus::Aborted
        )
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EntryStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown entry status '{}'", s))
    }
}

// ---------------------------------------------------------------------------
// HostQueueEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HostQueueEntry {
    pub id: i64,
    pub job_id: i64,
    pub host_id: Option<i64>,
    pub status: EntryStatus,
    /// Label to pick a host from when no host is assigned yet.
    pub meta_host: Option<i64>,
    pub active: bool,
    pub complete: bool,
    pub execution_subdir: String,
    pub atomic_group_id: Option<i64>,
    pub aborted: bool,
    pub started_on: Option<DateTime<Utc>>,
}

impl Record for HostQueueEntry {
    const TABLE: &'static str = "host_queue_entries";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "job_id",
        "host_id",
        "status",
        "meta_host",
        "active",
        "complete",
        "execution_subdir",
        "atomic_group_id",
        "aborted",
        "started_on",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn from_values(values: &[Value]) -> std::result::Result<Self, StoreError> {
        let row = RowReader::new::<Self>(values)?;
        Ok(HostQueueEntry {
            id: row.int(0)?,
            job_id: row.int(1)?,
            host_id: row.opt_int(2)?,
            status: row.parsed(3)?,
            meta_host: row.opt_int(4)?,
            active: row.flag(5)?,
            complete: row.flag(6)?,
            execution_subdir: row.text(7)?,
            atomic_group_id: row.opt_int(8)?,
            aborted: row.flag(9)?,
            started_on: row.opt_time(10)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            Value::Integer(self.job_id),
            record::opt_int(self.host_id),
            record::text(self.status.as_str()),
            record::opt_int(self.meta_host),
            record::flag(self.active),
            record::flag(self.complete),
            record::text(&self.execution_subdir),
            record::opt_int(self.atomic_group_id),
            record::flag(self.aborted),
            record::opt_time(self.started_on.as_ref()),
        ]
    }
}

impl fmt::Display for HostQueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_id {
            Some(host) => write!(
                f,
                "entry {} (job {}, host {}) {}",
                self.id, self.job_id, host, self.status
            ),
            None => write!(f, "entry {} (job {}) {}", self.id, self.job_id, self.status),
        }
    }
}

impl HostQueueEntry {
    /// An unsaved Queued entry.
    pub fn new(
        job_id: i64,
        host_id: Option<i64>,
        meta_host: Option<i64>,
        atomic_group_id: Option<i64>,
    ) -> HostQueueEntry {
        let (active, complete) = EntryStatus::Queued.flags();
        HostQueueEntry {
            id: 0,
            job_id,
            host_id,
            status: EntryStatus::Queued,
            meta_host,
            active,
            complete,
            execution_subdir: String::new(),
            atomic_group_id,
            aborted: false,
            started_on: None,
        }
    }

    /// A fresh Queued copy of this entry bound to another host. Used to
    /// expand atomic group entries.
    pub fn clone_for_host(&self, host_id: i64) -> HostQueueEntry {
        HostQueueEntry::new(self.job_id, Some(host_id), self.meta_host, self.atomic_group_id)
    }

    /// No host, no label and no atomic group: runs without a machine.
    pub fn is_hostless(&self) -> bool {
        self.host_id.is_none() && self.meta_host.is_none() && self.atomic_group_id.is_none()
    }

    pub fn job(&self, store: &mut Store) -> std::result::Result<Job, StoreError> {
        store.get(self.job_id)
    }

    pub fn host(&self, store: &mut Store) -> std::result::Result<Option<Host>, StoreError> {
        self.host_id.map(|id| store.get(id)).transpose()
    }

    pub fn atomic_group(
        &self,
        store: &mut Store,
    ) -> std::result::Result<Option<AtomicGroup>, StoreError> {
        self.atomic_group_id.map(|id| store.get(id)).transpose()
    }

    /// Write the status and its derived flags in one statement, with no
    /// side effects on the job or host.
    pub fn write_status(
        &mut self,
        store: &mut Store,
        status: EntryStatus,
    ) -> std::result::Result<(), StoreError> {
        let (active, complete) = status.flags();
        store.update_fields(
            self,
            vec![
                ("status", record::text(status.as_str())),
                ("active", record::flag(active)),
                ("complete", record::flag(complete)),
            ],
        )
    }

    /// Change status and run the completion hooks: an entry finishing may
    /// stop the rest of its job, and configured statuses email the job's
    /// list.
    pub fn set_status(&mut self, rt: &mut Runtime, status: EntryStatus) -> Result<()> {
        info!(entry = self.id, job = self.job_id, from = %self.status, to = %status, "entry status change");
        self.write_status(&mut rt.store, status)?;

        if rt.config.notifies_on(status) {
            self.email_status(rt, status)?;
        }
        if status.is_complete() {
            self.on_complete(rt, status)?;
        }
        Ok(())
    }

    fn on_complete(&mut self, rt: &mut Runtime, status: EntryStatus) -> Result<()> {
        let job = self.job(&mut rt.store)?;
        if status != EntryStatus::Aborted {
            job.stop_if_necessary(rt)?;
        }
        if job.is_finished(&mut rt.store)? {
            job.email_completion(rt)?;
        }
        Ok(())
    }

    fn email_status(&self, rt: &mut Runtime, status: EntryStatus) -> Result<()> {
        let job = self.job(&mut rt.store)?;
        let recipients = job.email_recipients();
        if recipients.is_empty() {
            return Ok(());
        }
        let hostname = match self.host(&mut rt.store)? {
            Some(host) => host.hostname,
            None => "no host".to_string(),
        };
        let subject = format!("Job {} {} on {}: {}", job.tag(), job.name, hostname, status);
        let body = format!("{}\nJob: {}\nHost: {}\nStatus: {}\n", subject, job.name, hostname, status);
        rt.mail.enqueue(recipients, &subject, &body);
        Ok(())
    }

    pub fn mark_aborted(&mut self, store: &mut Store) -> std::result::Result<(), StoreError> {
        store.update_field(self, "aborted", record::flag(true))
    }

    /// Assign or release the host. Assigned hosts are blocked for the rest
    /// of the job; the block stays after release.
    pub fn set_host(
        &mut self,
        store: &mut Store,
        host_id: Option<i64>,
    ) -> std::result::Result<(), StoreError> {
        match host_id {
            Some(id) => {
                info!(entry = self.id, host = id, "assigning host");
                ineligible::block(store, self.job_id, id)?;
            }
            None => info!(entry = self.id, host = ?self.host_id, "releasing host"),
        }
        store.update_field(self, "host_id", record::opt_int(host_id))
    }

    pub fn set_execution_subdir(
        &mut self,
        store: &mut Store,
        subdir: &str,
    ) -> std::result::Result<(), StoreError> {
        store.update_field(self, "execution_subdir", record::text(subdir))
    }

    pub fn set_started_on(
        &mut self,
        store: &mut Store,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        store.update_field(self, "started_on", record::time(&at))
    }

    /// `<job tag>/<execution subdir>`.
    pub fn execution_tag(&self, store: &mut Store) -> std::result::Result<String, StoreError> {
        let job = self.job(store)?;
        Ok(format!("{}/{}", job.tag(), self.execution_subdir))
    }

    pub fn results_dir(&self, rt: &mut Runtime) -> std::result::Result<PathBuf, StoreError> {
        let tag = self.execution_tag(&mut rt.store)?;
        Ok(rt.config.results_dir.join(tag))
    }

    /// Name used for multi-host execution groups: the atomic group label,
    /// or empty for plain synchronous jobs.
    pub fn group_name(&self, store: &mut Store) -> std::result::Result<String, StoreError> {
        let Some(group) = self.atomic_group(store)? else {
            return Ok(String::new());
        };
        if let Some(label_id) = self.meta_host {
            let label: Label = store.get(label_id)?;
            if label.atomic_group_id == Some(group.id) {
                return Ok(label.name);
            }
        }
        let labels: Vec<Label> = store.fetch(
            Query::filter(
                "labels.id IN (SELECT label_id FROM job_dependency_labels WHERE job_id = ?) \
                 AND labels.atomic_group_id = ?",
                vec![Value::Integer(self.job_id), Value::Integer(group.id)],
            )
            .order_by("labels.id"),
        )?;
        Ok(labels
            .into_iter()
            .next()
            .map_or(group.name, |label| label.name))
    }

    /// Back to Queued. A metahost entry gives its host back; the host stays
    /// blocked for this job.
    pub fn requeue(&mut self, rt: &mut Runtime) -> Result<()> {
        info!(entry = self.id, job = self.job_id, from = %self.status, "requeueing entry");
        let (active, complete) = EntryStatus::Queued.flags();
        rt.store.update_fields(
            self,
            vec![
                ("status", record::text(EntryStatus::Queued.as_str())),
                ("active", record::flag(active)),
                ("complete", record::flag(complete)),
                ("started_on", Value::Null),
                ("execution_subdir", record::text("")),
            ],
        )?;
        if self.meta_host.is_some() {
            self.set_host(&mut rt.store, None)?;
        }
        Ok(())
    }

    /// Move an old execution directory aside so a rerun starts clean but
    /// the earlier output is kept.
    pub fn preserve_results(&self, rt: &mut Runtime) -> Result<()> {
        if self.execution_subdir.is_empty() {
            return Ok(());
        }
        let dir = self.results_dir(rt)?;
        if !dir.exists() {
            return Ok(());
        }
        let stamp = rt.now().format("%Y%m%d%H%M%S");
        let mut aside = dir.clone().into_os_string();
        aside.push(format!(".requeued-{}", stamp));
        if let Err(e) = std::fs::rename(&dir, &aside) {
            warn!(entry = self.id, dir = %dir.display(), error = %e, "could not move old results aside");
        }
        Ok(())
    }

    /// The host is verified (or needs no verify). Mark Pending and let the
    /// job decide whether enough entries are ready to start.
    pub fn on_pending(&mut self, rt: &mut Runtime) -> Result<()> {
        self.set_status(rt, EntryStatus::Pending)?;
        if let Some(mut host) = self.host(&mut rt.store)? {
            host.set_status(&mut rt.store, HostStatus::Pending)?;
        }
        let job = self.job(&mut rt.store)?;
        job.run_if_ready(rt, self)
    }

    /// Start whatever has to happen on the host before the job may run.
    /// Returns the agent doing it, or `None` when the entry went straight
    /// to Pending.
    pub fn schedule_pre_job_tasks(&mut self, rt: &mut Runtime) -> Result<Option<Agent>> {
        let job = self.job(&mut rt.store)?;
        let host = self.host(&mut rt.store)?.ok_or_else(|| {
            SchedulerError::Invariant(format!("{} scheduled without a host", self))
        })?;
        info!(entry = self.id, job = %job.tag(), host = %host.hostname, "scheduling pre-job tasks");

        if job.reserve_hosts {
            acl::reserve_host(&mut rt.store, host.id, &job.owner)?;
        }
        self.set_status(rt, EntryStatus::Verifying)?;

        let mut tasks = Vec::new();
        if job.should_reboot_before(&host) {
            tasks.push(Task::reboot(host.id, Some(self)));
        }
        if job.should_verify(&host) {
            tasks.push(Task::verify(host.id, Some(self)));
        }
        if tasks.is_empty() {
            self.on_pending(rt)?;
            return Ok(None);
        }
        Ok(Some(Agent::new(tasks)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn active_and_complete_never_both_set() {
        for status in EntryStatus::ALL {
            let (active, complete) = status.flags();
            assert!(!(active && complete), "{} is both active and complete", status);
        }
    }

    #[test]
    fn flag_derivation_matches_status_groups() {
        assert_eq!(EntryStatus::Queued.flags(), (false, false));
        assert_eq!(EntryStatus::Aborting.flags(), (true, false));
        assert_eq!(EntryStatus::Waiting.flags(), (true, false));
        assert_eq!(EntryStatus::Stopped.flags(), (false, true));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in EntryStatus::ALL {
            assert_eq!(status.as_str().parse::<EntryStatus>().unwrap(), status);
        }
        assert!("Done".parse::<EntryStatus>().is_err());
    }

    #[test]
    fn write_status_keeps_flags_in_step() {
        let mut fx = Fixture::new();
        let host = fx.add_host("h1");
        let job = fx.add_job("alice", 1);
        let mut entry = fx.add_entry(job, Some(host), None);
        for status in EntryStatus::ALL {
            entry.write_status(&mut fx.rt.store, status).unwrap();
            let fresh = fx.entry(entry.id);
            assert_eq!((fresh.active, fresh.complete), status.flags());
            assert!(!(fresh.active && fresh.complete));
        }
    }

    #[test]
    fn requeue_metahost_releases_host() {
        let mut fx = Fixture::new();
        let host = fx.add_host("h1");
        let label = fx.add_label("pool", &[host]);
        let job = fx.add_job("alice", 1);
        let mut entry = fx.add_entry(job, None, Some(label));
        entry.set_host(&mut fx.rt.store, Some(host)).unwrap();
        entry.set_execution_subdir(&mut fx.rt.store, "h1").unwrap();
        entry.set_status(&mut fx.rt, EntryStatus::Verifying).unwrap();

        entry.requeue(&mut fx.rt).unwrap();
        let fresh = fx.entry(entry.id);
        assert_eq!(fresh.status, EntryStatus::Queued);
        assert!(!fresh.active);
        assert!(!fresh.complete);
        assert_eq!(fresh.host_id, None);
        assert_eq!(fresh.execution_subdir, "");
        assert!(ineligible::is_blocked(&mut fx.rt.store, job, host).unwrap());
    }

    #[test]
    fn requeue_direct_entry_keeps_host() {
        let mut fx = Fixture::new();
        let host = fx.add_host("h1");
        let job = fx.add_job("alice", 1);
        let mut entry = fx.add_entry(job, Some(host), None);
        entry.set_status(&mut fx.rt, EntryStatus::Running).unwrap();
        entry.requeue(&mut fx.rt).unwrap();
        let fresh = fx.entry(entry.id);
        assert_eq!(fresh.status, EntryStatus::Queued);
        assert_eq!(fresh.host_id, Some(host));
        assert_eq!(fresh.started_on, None);
    }

    #[test]
    fn status_email_goes_to_job_list() {
        let mut fx = Fixture::new();
        fx.rt.config.notify_email_statuses = vec!["Failed".into()];
        let host = fx.add_host("h1");
        let job = fx.add_job("alice", 1);
        fx.rt
            .store
            .execute(
                "UPDATE jobs SET email_list = 'a@example.com, b@example.com' WHERE id = ?",
                &[Value::Integer(job)],
            )
            .unwrap();
        fx.rt.store.clear_cache();
        let mut entry = fx.add_entry(job, Some(host), None);
        entry.set_status(&mut fx.rt, EntryStatus::Running).unwrap();
        entry.set_status(&mut fx.rt, EntryStatus::Failed).unwrap();
        fx.rt.mail.flush();

        let sent = fx.mail.sent();
        let status_mail = sent
            .iter()
            .find(|m| m.subject.ends_with(": Failed"))
            .unwrap();
        assert_eq!(status_mail.to, vec!["a@example.com", "b@example.com"]);
        assert!(sent.iter().all(|m| !m.subject.ends_with(": Running")));
    }

    #[test]
    fn pre_job_without_verify_or_reboot_goes_pending() {
        let mut fx = Fixture::new();
        let host = fx.add_host("h1");
        let job = fx.add_job_with("alice", 2, |j| {
            j.run_verify = false;
            j.reboot_before = crate::models::job::RebootBefore::Never;
        });
        let mut entry = fx.add_entry(job, Some(host), None);
        let sibling_host = fx.add_host("h2");
        let sibling = fx.add_entry(job, Some(sibling_host), None);
        let agent = entry.schedule_pre_job_tasks(&mut fx.rt).unwrap();
        assert!(agent.is_none());
        // Waits for its sibling rather than starting alone.
        assert_eq!(fx.entry(entry.id).status, EntryStatus::Pending);
        assert_eq!(fx.entry(sibling.id).status, EntryStatus::Queued);
        assert_eq!(fx.host(host).status, HostStatus::Pending);
    }

    #[test]
    fn pre_job_dirty_host_reboots_then_verifies() {
        let mut fx = Fixture::new();
        let host = fx.add_host("h1");
        fx.rt
            .store
            .execute("UPDATE hosts SET dirty = 1 WHERE id = ?", &[Value::Integer(host)])
            .unwrap();
        fx.rt.store.clear_cache();
        let job = fx.add_job("alice", 1);
        let mut entry = fx.add_entry(job, Some(host), None);
        let agent = entry.schedule_pre_job_tasks(&mut fx.rt).unwrap().unwrap();
        assert_eq!(agent.task_labels(), vec!["reboot", "verify"]);
        assert_eq!(fx.entry(entry.id).status, EntryStatus::Verifying);
    }

    #[test]
    fn reserve_hosts_moves_host_into_owner_group() {
        let mut fx = Fixture::new();
        let host = fx.add_host("h1");
        let job = fx.add_job_with("alice", 1, |j| j.reserve_hosts = true);
        fx.add_user("bob");
        let mut entry = fx.add_entry(job, Some(host), None);
        entry.schedule_pre_job_tasks(&mut fx.rt).unwrap();
        assert!(acl::can_use(&mut fx.rt.store, "alice", host).unwrap());
        assert!(!acl::can_use(&mut fx.rt.store, "bob", host).unwrap());
    }
}
