//! Periodic housekeeping, run from the tick every `clean_interval_minutes`.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::entry::HostQueueEntry;
use crate::models::ineligible;
use crate::models::job::Job;
use crate::runtime::Runtime;
use crate::store::{id_list, Query};

/// Inconsistent rows listed in one notification.
const MAX_REPORTED_ROWS: usize = 50;


#[derive(Debug)]
pub struct Maintenance {
    last_run: DateTime<Utc>,
}

impl Maintenance {
    /// The first pass runs one interval after `now`.
    pub fn new(now: DateTime<Utc>) -> Maintenance {
        Maintenance { last_run: now }
    }

    /// Run when the interval has elapsed. Returns whether it ran.
    pub fn run_maybe(&mut self, rt: &mut Runtime) -> Result<bool> {
        let now = rt.now();
        if now - self.last_run < rt.config.clean_interval() {
            return Ok(false);
        }
        run(rt)?;
        self.last_run = now;
        Ok(true)
    }
}


pub fn run(rt: &mut Runtime) -> Result<()> {
    info!("running periodic maintenance");
    abort_timed_out_jobs(rt)?;
    let purged = ineligible::purge_finished(&mut rt.store)?;
    if purged > 0 {
        info!(purged, "cleared blocks of finished jobs");
    }
    check_for_inconsistencies(rt)?;
    prune_ready_delays(rt)?;
    Ok(())
}


/// Abort every job with incomplete entries that is past its timeout.
/// Active entries are flagged for the dispatcher; inactive ones finish
/// right away.
pub fn abort_timed_out_jobs(rt: &mut Runtime) -> Result<usize> {
    let job_ids = rt.store.ids(
        "SELECT DISTINCT job_id FROM host_queue_entries WHERE NOT complete ORDER BY job_id",
        &[],
    )?;
    let now = rt.now();
    let mut aborted = 0;
    for job_id in job_ids {
        let job: Job = rt.store.get(job_id)?;
        if !job.is_timed_out(now) {
            continue;
        }
        warn!(job = %job.tag(), timeout_hours = job.timeout, "aborting timed out job");
        job.abort_entries(rt)?;
        aborted += 1;
    }
    Ok(aborted)
}


fn check_for_inconsistencies(rt: &mut Runtime) -> Result<()> {
    let broken: Vec<HostQueueEntry> = rt.store.fetch(
        Query::filter(
            "host_queue_entries.active AND host_queue_entries.complete",
            Vec::new(),
        )
        .order_by("host_queue_entries.id"),
    )?;
    if broken.is_empty() {
        return Ok(());
    }
    error!(count = broken.len(), ids = %id_list(broken.iter().map(|e| e.id)), "entries both active and complete");
    let mut body: Vec<String> = broken
        .iter()
        .take(MAX_REPORTED_ROWS)
        .map(|entry| entry.to_string())
        .collect();
    if broken.len() > MAX_REPORTED_ROWS {
        body.push("(truncated)".to_string());
    }
    rt.mail.enqueue_admin(
        &format!("{} queue entries found with active and complete set", broken.len()),
        &body.join("\n"),
    );
    Ok(())
}


/// Forget countdowns of jobs that are cancelled or have nothing left to
/// run.
fn prune_ready_delays(rt: &mut Runtime) -> Result<()> {
    let job_ids: Vec<i64> = rt.ready_delays.keys().copied().collect();
    for job_id in job_ids {
        let cancelled = rt.ready_delays.get(&job_id).map_or(true, |d| d.cancelled);
        let finished = match rt.store.get::<Job>(job_id) {
            Ok(job) => job.is_finished(&mut rt.store)?,
            Err(_) => true,
        };
        if cancelled || finished {
            rt.ready_delays.remove(&job_id);
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::entry::EntryStatus;
    use crate::runtime::ReadyDelay;
    use crate::testing::{Fixture, ADMIN};
    use chrono::Duration;
    use rusqlite::types::Value;

    #[test]
    fn runs_only_after_interval() {
        let mut fx = Fixture::new();
        let mut maintenance = Maintenance::new(fx.rt.now());
        assert!(!maintenance.run_maybe(&mut fx.rt).unwrap());
        fx.clock.advance(Duration::minutes(61));
        assert!(maintenance.run_maybe(&mut fx.rt).unwrap());
        assert!(!maintenance.run_maybe(&mut fx.rt).unwrap());
    }

    #[test]
    fn timed_out_job_is_aborted_in_one_pass() {
        let mut fx = Fixture::new();
        let h1 = fx.add_host("h1");
        let job = fx.add_job_with("alice", 1, |j| j.timeout = 1);
        let mut running = fx.add_entry(job, Some(h1), None);
        running.write_status(&mut fx.rt.store, EntryStatus::Running).unwrap();
        let queued = fx.add_entry(job, None, None);
        let fresh_job = fx.add_job("bob", 1);
        let untouched = fx.add_entry(fresh_job, None, None);

        fx.clock.advance(Duration::hours(2));
        assert_eq!(abort_timed_out_jobs(&mut fx.rt).unwrap(), 1);
        let running = fx.entry(running.id);
        assert_eq!(running.status, EntryStatus::Abort);
        assert!(running.aborted);
        assert_eq!(fx.entry(queued.id).status, EntryStatus::Aborted);
        assert_eq!(fx.entry(untouched.id).status, EntryStatus::Queued);
    }

    #[test]
    fn active_and_complete_rows_are_reported() {
        let mut fx = Fixture::new();
        let job = fx.add_job("alice", 1);
        let entry = fx.add_entry(job, None, None);
        fx.rt
            .store
            .execute(
                "UPDATE host_queue_entries SET active = 1, complete = 1 WHERE id = ?",
                &[Value::Integer(entry.id)],
            )
            .unwrap();
        run(&mut fx.rt).unwrap();
        assert_eq!(fx.rt.mail.admin_subjects().len(), 1);
        fx.rt.mail.flush();
        let sent = fx.mail.sent();
        assert!(sent[0].to.contains(&ADMIN.to_string()));
        assert!(sent[0].subject.contains("1 queue entries"));
    }

    #[test]
    fn blocks_of_finished_jobs_are_purged() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        let job = fx.add_job("alice", 1);
        let mut entry = fx.add_entry(job, None, None);
        ineligible::block(&mut fx.rt.store, job, h).unwrap();
        entry.write_status(&mut fx.rt.store, EntryStatus::Completed).unwrap();
        run(&mut fx.rt).unwrap();
        assert!(!ineligible::is_blocked(&mut fx.rt.store, job, h).unwrap());
    }

    #[test]
    fn stale_ready_delays_are_pruned() {
        let mut fx = Fixture::new();
        let done = fx.add_job("alice", 1);
        let mut entry = fx.add_entry(done, None, None);
        entry.write_status(&mut fx.rt.store, EntryStatus::Completed).unwrap();
        let waiting = fx.add_job("bob", 1);
        fx.add_entry(waiting, None, None);
        let end_time = fx.rt.now() + Duration::minutes(10);
        for job in [done, waiting] {
            fx.rt.ready_delays.insert(job, ReadyDelay { end_time, cancelled: false });
        }
        run(&mut fx.rt).unwrap();
        assert!(!fx.rt.ready_delays.contains_key(&done));
        assert!(fx.rt.ready_delays.contains_key(&waiting));
    }
}
