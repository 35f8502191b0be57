//! The task that runs a job group's worker.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{Task, TaskOutcome};
use crate::agent::Agent;
use crate::error::{Result, SchedulerError};
use crate::models::entry::{EntryStatus, HostQueueEntry};
use crate::models::host::{cmp_hostnames, Host, HostStatus};
use crate::models::job::Job;
use crate::runtime::Runtime;
use crate::worker::{WorkerInvocation, WorkerMode};

pub const CONTROL_FILE: &str = "control";
pub const JOB_FAILURE_FILE: &str = "job_failure";
pub const KEYVAL_FILE: &str = "keyval";


fn load_entries(rt: &mut Runtime, entry_ids: &[i64]) -> Result<Vec<HostQueueEntry>> {
    let mut entries = Vec::with_capacity(entry_ids.len());
    for id in entry_ids {
        entries.push(rt.store.refresh::<HostQueueEntry>(*id)?);
    }
    Ok(entries)
}

fn append_keyval(dir: &Path, key: &str, value: i64) {
    let path = dir.join(KEYVAL_FILE);
    let line = format!("{}={}\n", key, value);
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "cannot write keyval");
    }
}


pub(super) fn prolog(rt: &mut Runtime, job_id: i64, entry_ids: &[i64]) -> Result<WorkerInvocation> {
    let job: Job = rt.store.refresh(job_id)?;
    let mut entries = load_entries(rt, entry_ids)?;
    let first = entries.first().ok_or_else(|| {
        SchedulerError::Invariant(format!("queue task for job {} has no entries", job.tag()))
    })?;
    let results_dir = first.results_dir(rt)?;

    let now = rt.now();
    let mut hostnames = Vec::new();
    for entry in entries.iter_mut() {
        if entry.status != EntryStatus::Starting {
            warn!(entry = entry.id, status = %entry.status, "queue task starting entry that is not Starting");
        }
        entry.set_status(rt, EntryStatus::Running)?;
        entry.set_started_on(&mut rt.store, now)?;
        if let Some(mut host) = entry.host(&mut rt.store)? {
            host.set_status(&mut rt.store, HostStatus::Running)?;
            host.set_dirty(&mut rt.store, true)?;
            hostnames.push(host.hostname);
        }
    }
    hostnames.sort_by(|a, b| cmp_hostnames(a, b));

    fs::create_dir_all(&results_dir)?;
    let control_path = results_dir.join(CONTROL_FILE);
    fs::write(&control_path, &job.control_file)?;
    append_keyval(&results_dir, "job_queued", job.created_on.timestamp());
    append_keyval(&results_dir, "job_started", now.timestamp());
    info!(job = %job.tag(), dir = %results_dir.display(), hosts = ?hostnames, "starting job group");

    Ok(WorkerInvocation::new(WorkerMode::Run, &results_dir)
        .hosts(hostnames)
        .job(&job)
        .control_file(control_path))
}


pub(super) fn epilog(
    rt: &mut Runtime,
    job_id: i64,
    entry_ids: &[i64],
    outcome: TaskOutcome,
    lost: bool,
    results_dir: Option<PathBuf>,
) -> Result<Vec<Agent>> {
    let job: Job = rt.store.refresh(job_id)?;
    let entries = load_entries(rt, entry_ids)?;
    match outcome {
        TaskOutcome::Aborted => aborted(rt, entries),
        TaskOutcome::Succeeded | TaskOutcome::Failed => finished(
            rt,
            &job,
            entries,
            outcome == TaskOutcome::Succeeded,
            lost,
            results_dir,
        ),
    }
}

/// Entries being aborted belong to their abort task. Anything else the
/// killed worker was running failed, and its host needs a cleanup.
fn aborted(rt: &mut Runtime, entries: Vec<HostQueueEntry>) -> Result<Vec<Agent>> {
    let mut spawned = Vec::new();
    for mut entry in entries {
        if entry.status.is_aborting() || entry.status.is_complete() {
            continue;
        }
        entry.set_status(rt, EntryStatus::Failed)?;
        if let Some(mut host) = entry.host(&mut rt.store)? {
            host.set_status(&mut rt.store, HostStatus::Rebooting)?;
            spawned.push(cleanup_agent(host.id));
        }
    }
    Ok(spawned)
}

fn cleanup_agent(host_id: i64) -> Agent {
    Agent::new(vec![Task::reboot(host_id, None), Task::verify(host_id, None)])
}

fn finished(
    rt: &mut Runtime,
    job: &Job,
    entries: Vec<HostQueueEntry>,
    success: bool,
    lost: bool,
    results_dir: Option<PathBuf>,
) -> Result<Vec<Agent>> {
    if let Some(dir) = &results_dir {
        if lost {
            let note = "The worker process was lost: it exited without recording an exit code.\n";
            if let Err(e) = fs::write(dir.join(JOB_FAILURE_FILE), note) {
                warn!(dir = %dir.display(), error = %e, "cannot write job failure note");
            }
        }
        append_keyval(dir, "job_finished", rt.now().timestamp());
    }

    let mut live: Vec<HostQueueEntry> = Vec::new();
    for mut entry in entries {
        if entry.status != EntryStatus::Running {
            info!(entry = entry.id, status = %entry.status, "entry left Running during the run, skipping");
            continue;
        }
        entry.set_status(rt, EntryStatus::Parsing)?;
        live.push(entry);
    }

    if let Some(dir) = &results_dir {
        let mut dirs: Vec<PathBuf> = Vec::new();
        if job.is_synchronous() || live.len() <= 1 {
            dirs.push(dir.clone());
        } else {
            for entry in &live {
                if let Some(host) = entry.host(&mut rt.store)? {
                    dirs.push(dir.join(&host.hostname));
                }
            }
        }
        for dir in dirs {
            if let Err(e) = rt.parser.parse(&dir) {
                warn!(dir = %dir.display(), error = %e, "results parser failed");
            }
        }
    }

    let final_status = if success {
        EntryStatus::Completed
    } else {
        EntryStatus::Failed
    };
    let reboot_after = job.should_reboot_after(success);
    let mut spawned = Vec::new();
    for mut entry in live {
        let host: Option<Host> = entry.host(&mut rt.store)?;
        entry.set_status(rt, final_status)?;
        if let Some(mut host) = host {
            if reboot_after {
                host.set_status(&mut rt.store, HostStatus::Rebooting)?;
                spawned.push(cleanup_agent(host.id));
            } else {
                host.set_status(&mut rt.store, HostStatus::Ready)?;
            }
        }
    }
    Ok(spawned)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::RebootAfter;
    use crate::monitor::pidfile;
    use crate::testing::Fixture;

    fn starting_group(fx: &mut Fixture, synch: i64, hosts: &[&str]) -> (Job, Vec<HostQueueEntry>) {
        let job_id = fx.add_job(
            "alice",
            synch,
        );
        let mut entries = Vec::new();
        for name in hosts {
            let h = fx.add_host(name);
            let mut e = fx.add_entry(job_id, Some(h), None);
            e.write_status(&mut fx.rt.store, EntryStatus::Starting).unwrap();
            e.set_execution_subdir(&mut fx.rt.store, if hosts.len() == 1 { name } else { "group0" })
                .unwrap();
            entries.push(e);
        }
        let job: Job = fx.rt.store.get(job_id).unwrap();
        (job, entries)
    }

    #[test]
    fn prolog_marks_running_and_writes_control() {
        let mut fx = Fixture::new();
        let (job, entries) = starting_group(&mut fx, 2, &["b1", "a1"]);
        let mut task = Task::queue(&job, &entries);
        task.poll(&mut fx.rt).unwrap();

        for e in &entries {
            let fresh = fx.entry(e.id);
            assert_eq!(fresh.status, EntryStatus::Running);
            assert!(fresh.started_on.is_some());
            let host = fx.host(e.host_id.unwrap());
            assert_eq!(host.status, HostStatus::Running);
            assert!(host.dirty);
        }
        let dir = fx.results_root().join(format!("{}/group0", job.tag()));
        assert!(dir.join(CONTROL_FILE).exists());
        let launch = &fx.launcher.launches()[0];
        assert_eq!(launch.invocation.hosts, vec!["a1", "b1"]);
        assert_eq!(launch.invocation.mode, WorkerMode::Run);
    }

    #[test]
    fn success_completes_entries_and_readies_hosts() {
        let mut fx = Fixture::new();
        let (job, entries) = starting_group(&mut fx, 1, &["h1"]);
        let mut task = Task::queue(&job, &entries);
        task.poll(&mut fx.rt).unwrap();
        fx.launcher.finish(WorkerMode::Run, 0);
        let spawned = task.poll(&mut fx.rt).unwrap();

        assert!(spawned.is_empty());
        assert_eq!(fx.entry(entries[0].id).status, EntryStatus::Completed);
        assert_eq!(fx.host(entries[0].host_id.unwrap()).status, HostStatus::Ready);
        let dir = fx.results_root().join(format!("{}/h1", job.tag()));
        assert_eq!(fx.parser.parsed(), vec![dir.clone()]);
        let keyval = fs::read_to_string(dir.join(KEYVAL_FILE)).unwrap();
        assert!(keyval.contains("job_finished="));
    }

    #[test]
    fn lost_worker_fails_and_leaves_note() {
        let mut fx = Fixture::new();
        let (job, entries) = starting_group(&mut fx, 1, &["h1"]);
        let mut task = Task::queue(&job, &entries);
        task.poll(&mut fx.rt).unwrap();
        fx.processes.mark_dead(1000);
        task.poll(&mut fx.rt).unwrap();

        assert_eq!(fx.entry(entries[0].id).status, EntryStatus::Failed);
        let dir = fx.results_root().join(format!("{}/h1", job.tag()));
        assert!(dir.join(JOB_FAILURE_FILE).exists());
        assert_eq!(pidfile::read(&dir).unwrap().exit_code, None);
        assert_eq!(fx.rt.mail.admin_subjects().len(), 1);
    }

    #[test]
    fn reboot_after_reserves_host() {
        let mut fx = Fixture::new();
        let (mut job, entries) = starting_group(&mut fx, 1, &["h1"]);
        job.reboot_after = RebootAfter::Always;
        fx.rt.store.save(&mut job).unwrap();
        let mut task = Task::queue(&job, &entries);
        task.poll(&mut fx.rt).unwrap();
        fx.launcher.finish(WorkerMode::Run, 1);
        let spawned = task.poll(&mut fx.rt).unwrap();

        assert_eq!(fx.entry(entries[0].id).status, EntryStatus::Failed);
        assert_eq!(fx.host(entries[0].host_id.unwrap()).status, HostStatus::Rebooting);
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].task_labels(), vec!["reboot", "verify"]);
    }

    #[test]
    fn abort_skips_aborting_entries_and_fails_the_rest() {
        let mut fx = Fixture::new();
        let (job, entries) = starting_group(&mut fx, 2, &["a1", "b1"]);
        let mut task = Task::queue(&job, &entries);
        task.poll(&mut fx.rt).unwrap();
        let mut first = fx.entry(entries[0].id);
        first.write_status(&mut fx.rt.store, EntryStatus::Aborting).unwrap();

        let spawned = task.abort(&mut fx.rt).unwrap();
        assert_eq!(fx.processes.killed(), vec![1000]);
        assert_eq!(fx.entry(entries[0].id).status, EntryStatus::Aborting);
        assert_eq!(fx.entry(entries[1].id).status, EntryStatus::Failed);
        assert_eq!(spawned.len(), 1);
        assert_eq!(fx.host(entries[1].host_id.unwrap()).status, HostStatus::Rebooting);
    }
}
