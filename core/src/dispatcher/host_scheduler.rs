//! Picks hosts for queued entries.
//!
//! One `HostScheduler` is built per scheduling pass from a handful of bulk
//! queries (ready hosts, labels, ACLs, blocks, dependencies) and then
//! answers eligibility questions in memory. A host handed out is popped
//! from the available set, so nothing is offered twice in one pass.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rusqlite::types::Value;
use tracing::{error, info};

use crate::error::{Result, StoreError};
use crate::models::entry::{EntryStatus, HostQueueEntry};
use crate::models::host::{cmp_hostnames, Host};
use crate::models::job::Job;
use crate::models::label::Label;
use crate::runtime::Runtime;
use crate::store::{id_list, Query, Store};

type Relation = HashMap<i64, BTreeSet<i64>>;

fn relation(store: &mut Store, sql: &str, ids: &[i64], flip: bool) -> std::result::Result<Relation, StoreError> {
    let mut result = Relation::new();
    if ids.is_empty() {
        return Ok(result);
    }
    let sql = sql.replace("{ids}", &id_list(ids.iter().copied()));
    for (left, right) in store.pairs(&sql, &[])? {
        let (key, value) = if flip { (right, left) } else { (left, right) };
        result.entry(key).or_default().insert(value);
    }
    Ok(result)
}


#[derive(Debug, Default)]
pub struct HostScheduler {
    available: BTreeMap<i64, Host>,
    job_acls: Relation,
    ineligible: Relation,
    job_dependencies: Relation,
    host_acls: Relation,
    label_hosts: Relation,
    host_labels: Relation,
    labels: HashMap<i64, Label>,
}

impl HostScheduler {
    /// Snapshot everything needed to place `entries`.
    pub fn refresh(store: &mut Store, entries: &[HostQueueEntry]) -> std::result::Result<HostScheduler, StoreError> {
        // Unlocked Ready hosts without an active entry.
        let hosts: Vec<Host> = store.fetch(
            Query::filter(
                "active_hqe.host_id IS NULL AND NOT hosts.locked AND hosts.status = 'Ready'",
                Vec::new(),
            )
            .join(
                "LEFT JOIN host_queue_entries AS active_hqe \
                 ON (hosts.id = active_hqe.host_id AND active_hqe.active)",
            ),
        )?;
        let available: BTreeMap<i64, Host> = hosts.into_iter().map(|h| (h.id, h)).collect();

        let mut job_ids: Vec<i64> = entries.iter().map(|e| e.job_id).collect();
        job_ids.sort_unstable();
        job_ids.dedup();
        let host_ids: Vec<i64> = available.keys().copied().collect();

        let job_acls = relation(
            store,
            "SELECT jobs.id, acl_group_users.acl_group_id FROM jobs \
             INNER JOIN acl_group_users ON acl_group_users.login = jobs.owner \
             WHERE jobs.id IN ({ids})",
            &job_ids,
            false,
        )?;
        let ineligible = relation(
            store,
            "SELECT job_id, host_id FROM ineligible_host_queues WHERE job_id IN ({ids})",
            &job_ids,
            false,
        )?;
        let job_dependencies = relation(
            store,
            "SELECT job_id, label_id FROM job_dependency_labels WHERE job_id IN ({ids})",
            &job_ids,
            false,
        )?;
        let host_acls = relation(
            store,
            "SELECT host_id, acl_group_id FROM acl_group_hosts WHERE host_id IN ({ids})",
            &host_ids,
            false,
        )?;
        let label_sql = "SELECT label_id, host_id FROM host_labels WHERE host_id IN ({ids})";
        let label_hosts = relation(store, label_sql, &host_ids, false)?;
        let host_labels = relation(store, label_sql, &host_ids, true)?;
        let labels: Vec<Label> = store.fetch(Query::all())?;

        Ok(HostScheduler {
            available,
            job_acls,
            ineligible,
            job_dependencies,
            host_acls,
            label_hosts,
            host_labels,
            labels: labels.into_iter().map(|l| (l.id, l)).collect(),
        })
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    fn hosts_in_label(&self, label_id: i64) -> BTreeSet<i64> {
        self.label_hosts.get(&label_id).cloned().unwrap_or_default()
    }

    fn ineligible_hosts(&self, entry: &HostQueueEntry) -> BTreeSet<i64> {
        self.ineligible.get(&entry.job_id).cloned().unwrap_or_default()
    }

    /// Available this pass and not a one-time host.
    fn is_host_usable(&self, host_id: i64) -> bool {
        self.available.get(&host_id).map_or(false, |h| !h.invalid)
    }

    fn is_host_invalid(&self, host_id: i64) -> bool {
        self.available.get(&host_id).map_or(false, |h| h.invalid)
    }

    fn is_acl_accessible(&self, host_id: i64, entry: &HostQueueEntry) -> bool {
        let (Some(job_acls), Some(host_acls)) =
            (self.job_acls.get(&entry.job_id), self.host_acls.get(&host_id))
        else {
            return false;
        };
        !job_acls.is_disjoint(host_acls)
    }

    /// A metahost entry may not land on an only-if-needed label it did not
    /// ask for, either as its metahost or as a dependency.
    fn check_only_if_needed_labels(
        &self,
        dependencies: &BTreeSet<i64>,
        host_labels: &BTreeSet<i64>,
        entry: &HostQueueEntry,
    ) -> bool {
        let Some(meta_host) = entry.meta_host else {
            return true;
        };
        host_labels.iter().all(|label_id| {
            let only_if_needed = self.labels.get(label_id).map_or(false, |l| l.only_if_needed);
            !only_if_needed || *label_id == meta_host || dependencies.contains(label_id)
        })
    }

    fn host_atomic_group(&self, host_labels: &BTreeSet<i64>, entry: &HostQueueEntry) -> Option<i64> {
        let groups: BTreeSet<i64> = host_labels
            .iter()
            .filter_map(|id| self.labels.get(id).and_then(|l| l.atomic_group_id))
            .collect();
        if groups.len() > 1 {
            error!(entry = entry.id, groups = ?groups, "host carries labels of more than one atomic group");
        }
        groups.into_iter().next()
    }

    pub fn is_host_eligible_for_job(&self, host_id: i64, entry: &HostQueueEntry) -> bool {
        if self.is_host_invalid(host_id) {
            // One-time hosts are only ever scheduled directly.
            return true;
        }
        let empty = BTreeSet::new();
        let dependencies = self.job_dependencies.get(&entry.job_id).unwrap_or(&empty);
        let host_labels = self.host_labels.get(&host_id).unwrap_or(&empty);

        self.is_acl_accessible(host_id, entry)
            && dependencies.is_subset(host_labels)
            && self.check_only_if_needed_labels(dependencies, host_labels, entry)
            && self.host_atomic_group(host_labels, entry) == entry.atomic_group_id
    }

    /// Claim a host for a directly scheduled or metahost entry.
    pub fn schedule_entry(&mut self, entry: &HostQueueEntry) -> Option<Host> {
        if let Some(host_id) = entry.host_id {
            if !self.is_host_eligible_for_job(host_id, entry) {
                return None;
            }
            return self.available.remove(&host_id);
        }
        let label = entry.meta_host?;
        let ineligible = self.ineligible_hosts(entry);
        let candidate = self
            .hosts_in_label(label)
            .into_iter()
            .filter(|id| !ineligible.contains(id))
            .find(|id| self.is_host_usable(*id) && self.is_host_eligible_for_job(*id, entry))?;
        self.pop_host(candidate)
    }

    fn pop_host(&mut self, host_id: i64) -> Option<Host> {
        for hosts in self.label_hosts.values_mut() {
            hosts.remove(&host_id);
        }
        self.available.remove(&host_id)
    }

    /// Hosts for an unassigned atomic group entry: the first atomic group
    /// label with at least `synch_count` eligible hosts, capped at the
    /// group maximum, in natural hostname order. Empty when no label has
    /// enough. A job asking for more hosts than the group allows is
    /// aborted.
    pub fn find_eligible_atomic_group(
        &mut self,
        rt: &mut Runtime,
        entry: &mut HostQueueEntry,
    ) -> Result<Vec<Host>> {
        let job: Job = entry.job(&mut rt.store)?;
        let Some(group) = entry.atomic_group(&mut rt.store)? else {
            return Ok(Vec::new());
        };
        if job.synch_count > group.max_number_of_machines {
            error!(
                job = %job.tag(),
                synch_count = job.synch_count,
                group = %group.name,
                max = group.max_number_of_machines,
                entry = entry.id,
                "synch count exceeds atomic group size, aborting entry"
            );
            entry.set_status(rt, EntryStatus::Aborted)?;
            return Ok(Vec::new());
        }

        let meta_hosts = entry.meta_host.map(|label| self.hosts_in_label(label));
        let ineligible = self.ineligible_hosts(entry);
        let mut group_labels: Vec<i64> = self
            .labels
            .values()
            .filter(|l| l.atomic_group_id == Some(group.id) && !l.invalid)
            .map(|l| l.id)
            .collect();
        group_labels.sort_unstable();

        for label_id in group_labels {
            let mut candidates: Vec<&Host> = self
                .hosts_in_label(label_id)
                .into_iter()
                .filter(|id| meta_hosts.as_ref().map_or(true, |m| m.contains(id)))
                .filter(|id| !ineligible.contains(id))
                .filter(|id| self.is_host_usable(*id) && self.is_host_eligible_for_job(*id, entry))
                .filter_map(|id| self.available.get(&id))
                .collect();
            if (candidates.len() as i64) < job.synch_count {
                continue;
            }
            candidates.sort_by(|a, b| cmp_hostnames(&a.hostname, &b.hostname));
            let chosen: Vec<i64> = candidates
                .iter()
                .take(group.max_number_of_machines.max(0) as usize)
                .map(|h| h.id)
                .collect();
            info!(job = %job.tag(), group = %group.name, hosts = chosen.len(), "found atomic group hosts");
            return Ok(chosen.into_iter().filter_map(|id| self.pop_host(id)).collect());
        }
        Ok(Vec::new())
    }
}


/// Queued entries in scheduling order: job priority first, then FIFO.
pub fn pending_queue_entries(store: &mut Store) -> std::result::Result<Vec<HostQueueEntry>, StoreError> {
    store.fetch(
        Query::filter(
            "NOT host_queue_entries.complete AND NOT host_queue_entries.active \
             AND host_queue_entries.status = ?",
            vec![Value::Text(EntryStatus::Queued.as_str().to_string())],
        )
        .join("INNER JOIN jobs ON (host_queue_entries.job_id = jobs.id)")
        .order_by("jobs.priority DESC, host_queue_entries.id"),
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::acl;
    use crate::models::ineligible;
    use crate::testing::Fixture;

    fn scheduler_for(fx: &mut Fixture) -> (HostScheduler, Vec<HostQueueEntry>) {
        let entries = pending_queue_entries(&mut fx.rt.store).unwrap();
        (HostScheduler::refresh(&mut fx.rt.store, &entries).unwrap(), entries)
    }

    #[test]
    fn orders_by_priority_then_id() {
        let mut fx = Fixture::new();
        let low = fx.add_job("alice", 1);
        let high = fx.add_job_with("bob", 1, |j| j.priority = 10);
        let a = fx.add_entry(low, None, None);
        let b = fx.add_entry(high, None, None);
        let c = fx.add_entry(low, None, None);
        let order: Vec<i64> = pending_queue_entries(&mut fx.rt.store)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![b.id, a.id, c.id]);
    }

    #[test]
    fn busy_and_locked_hosts_are_not_available() {
        let mut fx = Fixture::new();
        let idle = fx.add_host("idle");
        let busy = fx.add_host("busy");
        let locked = fx.add_host("locked");
        fx.rt
            .store
            .execute("UPDATE hosts SET locked = 1 WHERE id = ?", &[Value::Integer(locked)])
            .unwrap();
        let job = fx.add_job("alice", 1);
        let mut running = fx.add_entry(job, Some(busy), None);
        running.write_status(&mut fx.rt.store, EntryStatus::Running).unwrap();
        let (scheduler, _) = scheduler_for(&mut fx);
        assert_eq!(scheduler.available_count(), 1);
        assert!(scheduler.is_host_usable(idle));
    }

    #[test]
    fn metahost_skips_blocked_host() {
        let mut fx = Fixture::new();
        let h1 = fx.add_host("h1");
        let h2 = fx.add_host("h2");
        let label = fx.add_label("pool", &[h1, h2]);
        let job = fx.add_job("alice", 1);
        let entry = fx.add_entry(job, None, Some(label));
        ineligible::block(&mut fx.rt.store, job, h1).unwrap();

        let (mut scheduler, _) = scheduler_for(&mut fx);
        assert_eq!(scheduler.schedule_entry(&entry).map(|h| h.id), Some(h2));
        // Claimed hosts are not offered again in the same pass.
        assert!(scheduler.schedule_entry(&entry).is_none());
    }

    #[test]
    fn acl_denied_host_is_not_eligible() {
        let mut fx = Fixture::new();
        let h = fx.add_host("h1");
        let job = fx.add_job("alice", 1);
        let entry = fx.add_entry(job, Some(h), None);
        acl::reserve_host(&mut fx.rt.store, h, "carol").unwrap();
        let (mut scheduler, _) = scheduler_for(&mut fx);
        assert!(scheduler.schedule_entry(&entry).is_none());
    }

    #[test]
    fn dependencies_and_only_if_needed_labels() {
        let mut fx = Fixture::new();
        let plain = fx.add_host("plain");
        let special = fx.add_host("special");
        let pool = fx.add_label("pool", &[plain, special]);
        let gpu = fx.add_label("gpu", &[special]);
        let mut gpu_label: Label = fx.rt.store.get(gpu).unwrap();
        gpu_label.only_if_needed = true;
        fx.rt.store.save(&mut gpu_label).unwrap();

        let job = fx.add_job("alice", 1);
        let entry = fx.add_entry(job, None, Some(pool));
        let needs_gpu = fx.add_job("alice", 1);
        fx.add_job_dependency(needs_gpu, gpu);
        let gpu_entry = fx.add_entry(needs_gpu, None, Some(pool));

        let (scheduler, _) = scheduler_for(&mut fx);
        assert!(scheduler.is_host_eligible_for_job(plain, &entry));
        assert!(!scheduler.is_host_eligible_for_job(special, &entry));
        assert!(!scheduler.is_host_eligible_for_job(plain, &gpu_entry));
        assert!(scheduler.is_host_eligible_for_job(special, &gpu_entry));
    }

    #[test]
    fn atomic_group_takes_first_label_with_enough_hosts() {
        let mut fx = Fixture::new();
        let group = fx.add_atomic_group("rack", 2);
        let hosts: Vec<i64> = ["r10", "r2", "r3"].iter().map(|h| fx.add_host(h)).collect();
        let small_host = fx.add_host("s1");
        let small = fx.add_label("small-rack", &[small_host]);
        fx.set_label_atomic_group(small, group);
        let rack = fx.add_label("rack", &hosts);
        fx.set_label_atomic_group(rack, group);
        let job = fx.add_job("alice", 2);
        let mut entry = fx.add_entry(job, None, None);
        entry.atomic_group_id = Some(group);
        fx.rt.store.save(&mut entry).unwrap();

        let (mut scheduler, _) = scheduler_for(&mut fx);
        let chosen = scheduler.find_eligible_atomic_group(&mut fx.rt, &mut entry).unwrap();
        let names: Vec<&str> = chosen.iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(names, vec!["r2", "r3"]);
    }

    #[test]
    fn atomic_group_too_small_for_synch_count_aborts() {
        let mut fx = Fixture::new();
        let group = fx.add_atomic_group("rack", 1);
        let job = fx.add_job("alice", 2);
        let mut entry = fx.add_entry(job, None, None);
        entry.atomic_group_id = Some(group);
        fx.rt.store.save(&mut entry).unwrap();

        let (mut scheduler, _) = scheduler_for(&mut fx);
        assert!(scheduler.find_eligible_atomic_group(&mut fx.rt, &mut entry).unwrap().is_empty());
        assert_eq!(fx.entry(entry.id).status, EntryStatus::Aborted);
    }
}
