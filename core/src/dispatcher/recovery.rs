//! Startup recovery.
//!
//! Everything is re-derived from the store and the results directories:
//! running workers are adopted rather than relaunched, work stranded
//! mid-transition is requeued, orphaned workers are killed and hosts left
//! half-maintained are verified again. Every step skips entries and hosts
//! that already have an agent, so a second pass changes nothing.

use std::collections::BTreeSet;

use tracing::{error, info, warn};

use super::{entries_with_status, Dispatcher};
use crate::agent::Agent;
use crate::error::Result;
use crate::models::entry::{EntryStatus, HostQueueEntry};
use crate::models::host::{Host, HostStatus};
use crate::models::job::Job;
use crate::monitor::ExecutionMonitor;
use crate::runtime::Runtime;
use crate::store::Query;
use crate::task::Task;

/// Active entries in these states are recovered by their own step; any
/// other active entry is requeued.
const HANDLED_ACTIVE: [EntryStatus; 4] = [
    EntryStatus::Running,
    EntryStatus::Pending,
    EntryStatus::Abort,
    EntryStatus::Aborting,
];


pub fn run(dispatcher: &mut Dispatcher, rt: &mut Runtime) -> Result<()> {
    info!(recover_hosts = rt.config.recover_hosts, "recovering from previous run");
    rt.store.clear_cache();
    recover_running_entries(dispatcher, rt)?;
    kill_orphans(dispatcher, rt);
    recover_aborting_entries(dispatcher, rt)?;
    requeue_stranded_entries(dispatcher, rt)?;
    recover_pending_entries(dispatcher, rt)?;
    reverify_hosts(dispatcher, rt)?;
    info!(agents = dispatcher.agent_count(), "recovery done");
    Ok(())
}


/// Adopt the worker of every Running group. A group whose worker never
/// wrote a pid is requeued.
fn recover_running_entries(dispatcher: &mut Dispatcher, rt: &mut Runtime) -> Result<()> {
    let running = entries_with_status(rt, &[EntryStatus::Running])?;
    let mut seen = BTreeSet::new();
    for entry in running {
        if dispatcher.entry_has_agent(entry.id) {
            continue;
        }
        if !seen.insert((entry.job_id, entry.execution_subdir.clone())) {
            continue;
        }
        let job: Job = rt.store.get(entry.job_id)?;
        let group: Vec<HostQueueEntry> = job
            .group_entries(&mut rt.store, &entry)?
            .into_iter()
            .filter(|e| e.status == EntryStatus::Running && !dispatcher.entry_has_agent(e.id))
            .collect();

        let dir = entry.results_dir(rt)?;
        let mut monitor = ExecutionMonitor::attach(&dir, rt.now());
        match monitor.get_info(rt) {
            (None, None) => {
                info!(job = %job.tag(), dir = %dir.display(), "worker never started, requeueing");
                for mut member in group {
                    member.preserve_results(rt)?;
                    member.requeue(rt)?;
                }
            }
            (pid, code) => {
                info!(job = %job.tag(), dir = %dir.display(), ?pid, ?code, entries = group.len(), "adopting running worker");
                let task = Task::recovered_queue(job.id, &group, monitor);
                dispatcher.add_agent(Agent::recovered(task));
            }
        }
    }
    Ok(())
}


/// Kill worker processes no agent is watching.
fn kill_orphans(dispatcher: &Dispatcher, rt: &mut Runtime) {
    let watched = dispatcher.monitored_pids();
    for pid in rt.processes.orphaned_workers() {
        if watched.contains(&pid) {
            continue;
        }
        warn!(pid, "killing orphaned worker");
        rt.processes.kill(pid);
    }
}


fn recover_aborting_entries(dispatcher: &mut Dispatcher, rt: &mut Runtime) -> Result<()> {
    for entry in entries_with_status(rt, &[EntryStatus::Abort, EntryStatus::Aborting])? {
        if dispatcher.entry_has_agent(entry.id) {
            continue;
        }
        info!(entry = entry.id, status = %entry.status, "recovering aborted entry");
        dispatcher.abort_entry(rt, entry)?;
    }
    Ok(())
}


fn requeue_stranded_entries(dispatcher: &mut Dispatcher, rt: &mut Runtime) -> Result<()> {
    let active: Vec<HostQueueEntry> = rt.store.fetch(
        Query::filter(
            "host_queue_entries.active AND NOT host_queue_entries.complete",
            Vec::new(),
        )
        .order_by("host_queue_entries.id"),
    )?;
    for mut entry in active {
        if HANDLED_ACTIVE.contains(&entry.status) || dispatcher.entry_has_agent(entry.id) {
            continue;
        }
        info!(entry = entry.id, status = %entry.status, "requeueing stranded entry");
        entry.preserve_results(rt)?;
        entry.requeue(rt)?;
    }
    Ok(())
}


/// Pending entries lost the agent that would have started them; check
/// again whether their job can run.
fn recover_pending_entries(dispatcher: &mut Dispatcher, rt: &mut Runtime) -> Result<()> {
    for entry in entries_with_status(rt, &[EntryStatus::Pending])? {
        if dispatcher.entry_has_agent(entry.id) {
            continue;
        }
        // An earlier entry of the same job may have started this one.
        let mut entry: HostQueueEntry = rt.store.get(entry.id)?;
        if entry.status != EntryStatus::Pending {
            continue;
        }
        info!(entry = entry.id, job = entry.job_id, "recovering pending entry");
        entry.on_pending(rt)?;
    }
    Ok(())
}


fn reverify_hosts(dispatcher: &mut Dispatcher, rt: &mut Runtime) -> Result<()> {
    const UNLOCKED: &str = "NOT hosts.locked AND NOT hosts.invalid";
    const IDLE: &str = "hosts.id NOT IN \
        (SELECT host_id FROM host_queue_entries WHERE active AND host_id IS NOT NULL)";

    let midway = hosts_where(
        rt,
        &format!("{} AND hosts.status IN ('Verifying', 'Repairing', 'Rebooting')", UNLOCKED),
    )?;
    for host in midway {
        reverify(dispatcher, &host, "host left mid maintenance")?;
    }

    // Pending hosts whose entries were requeued above.
    let pending = hosts_where(rt, &format!("{} AND hosts.status = 'Pending' AND {}", UNLOCKED, IDLE))?;
    for host in pending {
        reverify(dispatcher, &host, "pending host without an active entry")?;
    }

    let running = hosts_where(rt, &format!("{} AND hosts.status = 'Running' AND {}", UNLOCKED, IDLE))?;
    for host in running {
        if dispatcher.host_has_agent(host.id) {
            continue;
        }
        error!(host = %host.hostname, "running host without an active entry, probably a scheduler bug");
        reverify(dispatcher, &host, "running host without an active entry")?;
    }

    if rt.config.recover_hosts {
        let failed = hosts_where(
            rt,
            &format!("{} AND hosts.status = '{}'", UNLOCKED, HostStatus::RepairFailed.as_str()),
        )?;
        for host in failed {
            if dispatcher.host_has_agent(host.id) {
                continue;
            }
            rt.mail.enqueue_admin(
                &format!("Recovering host {}", host.hostname),
                &format!("Host {} was {} and is being verified again.", host.hostname, host.status),
            );
            reverify(dispatcher, &host, "recovering repair failed host")?;
        }
    }
    Ok(())
}

fn hosts_where(rt: &mut Runtime, clause: &str) -> Result<Vec<Host>> {
    Ok(rt
        .store
        .fetch(Query::filter(clause, Vec::new()).order_by("hosts.id"))?)
}

fn reverify(dispatcher: &mut Dispatcher, host: &Host, reason: &str) -> Result<()> {
    if dispatcher.host_has_agent(host.id) {
        return Ok(());
    }
    info!(host = %host.hostname, status = %host.status, reason, "reverifying host");
    dispatcher.add_agent(Agent::new(vec![Task::verify(host.id, None)]));
    Ok(())
}
