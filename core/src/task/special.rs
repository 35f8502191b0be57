//! Host maintenance tasks: verify, repair and reboot.
//!
//! Each runs one worker against one host. When bound to an entry they act
//! as its pre-job steps, so their epilogs also move the entry on.

use tracing::{info, warn};

use super::TaskOutcome;
use crate::error::Result;
use crate::models::entry::{EntryStatus, HostQueueEntry};
use crate::models::host::{Host, HostStatus, Protection};
use crate::runtime::Runtime;
use crate::worker::{WorkerInvocation, WorkerMode};


fn host_invocation(rt: &mut Runtime, host: &Host, mode: WorkerMode) -> WorkerInvocation {
    let dir = rt.host_results_dir(&host.hostname, mode);
    WorkerInvocation::new(mode, &dir).host(&host.hostname)
}

/// Re-read the bound entry. `None` when it has moved on since the task
/// took it (aborted, or failed along with a sibling).
fn bound_entry(
    rt: &mut Runtime,
    entry_id: Option<i64>,
    expected: EntryStatus,
) -> Result<Option<HostQueueEntry>> {
    let Some(id) = entry_id else {
        return Ok(None);
    };
    let entry: HostQueueEntry = rt.store.refresh(id)?;
    if entry.status != expected {
        info!(entry = id, status = %entry.status, expected = %expected, "bound entry moved on, leaving it alone");
        return Ok(None);
    }
    Ok(Some(entry))
}

/// A pre-job step failed. Synchronous jobs without metahosts cannot run
/// short a host, so the whole unstarted job fails; anything else goes back
/// to the queue to try again.
pub fn prejob_failure(rt: &mut Runtime, entry: &mut HostQueueEntry) -> Result<()> {
    let job = entry.job(&mut rt.store)?;
    if job.is_synchronous() && entry.meta_host.is_none() {
        warn!(entry = entry.id, job = %job.tag(), "pre-job failure, failing synchronous job");
        job.fail_unstarted_entries(rt, entry.id)?;
        entry.set_status(rt, EntryStatus::Failed)?;
    } else {
        entry.requeue(rt)?;
    }
    Ok(())
}


pub(super) fn verify_prolog(
    rt: &mut Runtime,
    host_id: i64,
    entry_id: Option<i64>,
) -> Result<WorkerInvocation> {
    let mut host: Host = rt.store.refresh(host_id)?;
    if let Some(id) = entry_id {
        let mut entry: HostQueueEntry = rt.store.refresh(id)?;
        if entry.status == EntryStatus::Queued {
            entry.set_status(rt, EntryStatus::Verifying)?;
        }
    }
    host.set_status(&mut rt.store, HostStatus::Verifying)?;
    Ok(host_invocation(rt, &host, WorkerMode::Verify))
}

pub(super) fn verify_epilog(
    rt: &mut Runtime,
    host_id: i64,
    entry_id: Option<i64>,
    outcome: TaskOutcome,
) -> Result<()> {
    let mut host: Host = rt.store.refresh(host_id)?;
    let success = match outcome {
        TaskOutcome::Aborted => return Ok(()),
        TaskOutcome::Succeeded => true,
        TaskOutcome::Failed if host.protection == Protection::DoNotVerify => {
            info!(host = %host.hostname, "verify failed on a do-not-verify host, ignoring");
            true
        }
        TaskOutcome::Failed => false,
    };

    if success {
        host.set_status(&mut rt.store, HostStatus::Ready)?;
        if let Some(mut entry) = bound_entry(rt, entry_id, EntryStatus::Verifying)? {
            entry.on_pending(rt)?;
        }
    } else {
        warn!(host = %host.hostname, "verify failed");
        if let Some(mut entry) = bound_entry(rt, entry_id, EntryStatus::Verifying)? {
            prejob_failure(rt, &mut entry)?;
        }
    }
    Ok(())
}


pub(super) fn repair_prolog(rt: &mut Runtime, host_id: i64) -> Result<WorkerInvocation> {
    let mut host: Host = rt.store.refresh(host_id)?;
    host.set_status(&mut rt.store, HostStatus::Repairing)?;
    Ok(host_invocation(rt, &host, WorkerMode::Repair).protection(host.protection))
}

pub(super) fn repair_epilog(
    rt: &mut Runtime,
    host_id: i64,
    entry_id: Option<i64>,
    outcome: TaskOutcome,
) -> Result<()> {
    let mut host: Host = rt.store.refresh(host_id)?;
    match outcome {
        TaskOutcome::Aborted => {}
        TaskOutcome::Succeeded => host.set_status(&mut rt.store, HostStatus::Ready)?,
        TaskOutcome::Failed => {
            warn!(host = %host.hostname, "repair failed, host out of service");
            host.set_status(&mut rt.store, HostStatus::RepairFailed)?;
            if let Some(id) = entry_id {
                let mut entry: HostQueueEntry = rt.store.refresh(id)?;
                if entry.status.is_complete() || entry.status.is_aborting() {
                    return Ok(());
                }
                if entry.host_id.is_none() {
                    entry.set_host(&mut rt.store, Some(host_id))?;
                }
                entry.set_status(rt, EntryStatus::Failed)?;
            }
        }
    }
    Ok(())
}


pub(super) fn reboot_prolog(rt: &mut Runtime, host_id: i64) -> Result<WorkerInvocation> {
    let mut host: Host = rt.store.refresh(host_id)?;
    host.set_status(&mut rt.store, HostStatus::Rebooting)?;
    Ok(host_invocation(rt, &host, WorkerMode::Reboot))
}

pub(super) fn reboot_epilog(
    rt: &mut Runtime,
    host_id: i64,
    entry_id: Option<i64>,
    outcome: TaskOutcome,
) -> Result<()> {
    let mut host: Host = rt.store.refresh(host_id)?;
    match outcome {
        TaskOutcome::Aborted => {}
        TaskOutcome::Succeeded => {
            host.set_dirty(&mut rt.store, false)?;
            if let Some(mut entry) = bound_entry(rt, entry_id, EntryStatus::Verifying)? {
                let job = entry.job(&mut rt.store)?;
                if !job.should_verify(&host) {
                    host.set_status(&mut rt.store, HostStatus::Ready)?;
                    entry.on_pending(rt)?;
                }
            }
            // A reboot without an entry is always followed by a verify,
            // which decides whether the host is Ready.
        }
        TaskOutcome::Failed => {
            warn!(host = %host.hostname, "reboot failed");
            if let Some(mut entry) = bound_entry(rt, entry_id, EntryStatus::Verifying)? {
                prejob_failure(rt, &mut entry)?;
            }
        }
    }
    Ok(())
}
