//! Test fixture: a runtime over an in-memory store with every external
//! seam mocked, plus helpers to populate the fleet.

use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use rusqlite::types::Value;
use tempfile::TempDir;

use crate::clock::ManualClock;
use crate::config::SchedulerConfig;
use crate::models::acl;
use crate::models::entry::HostQueueEntry;
use crate::models::host::Host;
use crate::models::job::Job;
use crate::models::label::{AtomicGroup, Label};
use crate::notify::{NotificationSink, RecordingMailer};
use crate::process::MockProcessTable;
use crate::runtime::Runtime;
use crate::store::Store;
use crate::worker::mock::{MockLauncher, RecordingParser};

pub const ADMIN: &str = "admin@example.com";
const EVERYONE: &str = "Everyone";


pub struct Fixture {
    pub rt: Runtime,
    pub launcher: MockLauncher,
    pub processes: MockProcessTable,
    pub clock: ManualClock,
    pub mail: RecordingMailer,
    pub parser: RecordingParser,
    everyone: i64,
    _results: TempDir,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture::with_config(SchedulerConfig::default())
    }

    /// `results_dir` and `admin_emails` are always overridden.
    pub fn with_config(mut config: SchedulerConfig) -> Fixture {
        let results = TempDir::new().unwrap();
        config.results_dir = results.path().to_path_buf();
        config.admin_emails = vec![ADMIN.to_string()];

        let mut store = Store::open_in_memory().unwrap();
        let everyone = acl::ensure_group(&mut store, EVERYONE).unwrap();
        let launcher = MockLauncher::new();
        let processes = MockProcessTable::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let mail = RecordingMailer::new();
        let parser = RecordingParser::new();
        let sink = NotificationSink::new(Box::new(mail.clone()), config.admin_emails.clone());

        let rt = Runtime::new(
            store,
            config,
            sink,
            Box::new(clock.clone()),
            Box::new(launcher.clone()),
            Box::new(processes.clone()),
            Box::new(parser.clone()),
        );
        Fixture {
            rt,
            launcher,
            processes,
            clock,
            mail,
            parser,
            everyone,
            _results: results,
        }
    }

    pub fn results_root(&self) -> PathBuf {
        self.rt.config.results_dir.clone()
    }

    /// A Ready host usable by every test user.
    pub fn add_host(&mut self, hostname: &str) -> i64 {
        let mut host = Host::new(hostname);
        self.rt.store.save(&mut host).unwrap();
        acl::add_host(&mut self.rt.store, self.everyone, host.id).unwrap();
        host.id
    }

    pub fn add_label(&mut self, name: &str, hosts: &[i64]) -> i64 {
        let mut label = Label::new(name);
        self.rt.store.save(&mut label).unwrap();
        for host in hosts {
            self.rt
                .store
                .execute(
                    "INSERT INTO host_labels (host_id, label_id) VALUES (?, ?)",
                    &[Value::Integer(*host), Value::Integer(label.id)],
                )
                .unwrap();
        }
        label.id
    }

    pub fn add_atomic_group(&mut self, name: &str, max_machines: i64) -> i64 {
        let mut group = AtomicGroup::new(name, max_machines);
        self.rt.store.save(&mut group).unwrap();
        group.id
    }

    pub fn set_label_atomic_group(&mut self, label_id: i64, group_id: i64) {
        let mut label: Label = self.rt.store.get(label_id).unwrap();
        label.atomic_group_id = Some(group_id);
        self.rt.store.save(&mut label).unwrap();
    }

    pub fn add_job_dependency(&mut self, job_id: i64, label_id: i64) {
        self.rt
            .store
            .execute(
                "INSERT INTO job_dependency_labels (job_id, label_id) VALUES (?, ?)",
                &[Value::Integer(job_id), Value::Integer(label_id)],
            )
            .unwrap();
    }

    pub fn add_user(&mut self, login: &str) {
        acl::add_user(&mut self.rt.store, self.everyone, login).unwrap();
    }

    pub fn add_job(&mut self, owner: &str, synch_count: i64) -> i64 {
        self.add_job_with(owner, synch_count, |_| {})
    }

    pub fn add_job_with(&mut self, owner: &str, synch_count: i64, edit: impl FnOnce(&mut Job)) -> i64 {
        self.add_user(owner);
        let now = self.rt.now();
        let mut job = Job::new(owner, &format!("job-{}", owner), now);
        job.synch_count = synch_count;
        job.control_file = "run_tests()\n".to_string();
        edit(&mut job);
        self.rt.store.save(&mut job).unwrap();
        job.id
    }

    pub fn add_entry(&mut self, job_id: i64, host: Option<i64>, label: Option<i64>) -> HostQueueEntry {
        let mut entry = HostQueueEntry::new(job_id, host, label, None);
        self.rt.store.save(&mut entry).unwrap();
        entry
    }

    /// Fresh from the database.
    pub fn entry(&mut self, id: i64) -> HostQueueEntry {
        self.rt.store.refresh(id).unwrap()
    }

    /// Fresh from the database.
    pub fn host(&mut self, id: i64) -> Host {
        self.rt.store.refresh(id).unwrap()
    }
}
