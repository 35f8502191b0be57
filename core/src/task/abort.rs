//! The task that aborts one entry: kill whatever is working on it, then
//! mark it Aborted.

use tracing::info;

use crate::agent::Agent;
use crate::error::Result;
use crate::models::entry::{EntryStatus, HostQueueEntry};
use crate::runtime::Runtime;


pub(super) fn prolog(rt: &mut Runtime, entry_id: i64, agents: &mut Vec<Agent>) -> Result<Vec<Agent>> {
    let mut entry: HostQueueEntry = rt.store.refresh(entry_id)?;
    if entry.status != EntryStatus::Aborting {
        entry.set_status(rt, EntryStatus::Aborting)?;
    }
    let mut spawned = Vec::new();
    for agent in agents.iter_mut() {
        info!(entry = entry_id, agent = agent.id(), "aborting agent");
        spawned.extend(agent.abort(rt)?);
    }
    Ok(spawned)
}

pub(super) fn epilog(rt: &mut Runtime, entry_id: i64) -> Result<()> {
    let mut entry: HostQueueEntry = rt.store.refresh(entry_id)?;
    entry.set_status(rt, EntryStatus::Aborted)?;
    let job = entry.job(&mut rt.store)?;
    job.cancel_ready_delay(rt);
    Ok(())
}
