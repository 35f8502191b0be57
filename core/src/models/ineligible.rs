//! (job, host) blocks.
//!
//! A host released from a job (for instance after failing verify) is blocked
//! for that job so metahost scheduling does not hand it straight back. Blocks
//! live until the job has no incomplete entries left.

use rusqlite::types::Value;

use crate::error::StoreError;
use crate::store::record::{Record, RowReader};
use crate::store::Store;


#[derive(Debug, Clone, PartialEq)]
pub struct IneligibleHostQueue {
    pub id: i64,
    pub job_id: i64,
    pub host_id: i64,
}

impl Record for IneligibleHostQueue {
    const TABLE: &'static str = "ineligible_host_queues";
    const FIELDS: &'static [&'static str] = &["id", "job_id", "host_id"];

    fn id(&self) -> i64 {
        self.id
    }

    fn from_values(values: &[Value]) -> Result<Self, StoreError> {
        let row = RowReader::new::<Self>(values)?;
        Ok(IneligibleHostQueue {
            id: row.int(0)?,
            job_id: row.int(1)?,
            host_id: row.int(2)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            Value::Integer(self.job_id),
            Value::Integer(self.host_id),
        ]
    }
}


/// Block `host_id` for `job_id`. Blocking twice is a no-op.
pub fn block(store: &mut Store, job_id: i64, host_id: i64) -> Result<(), StoreError> {
    let existing = store.count(
        "SELECT COUNT(*) FROM ineligible_host_queues WHERE job_id = ? AND host_id = ?",
        &[Value::Integer(job_id), Value::Integer(host_id)],
    )?;
    if existing > 0 {
        return Ok(());
    }
    let mut row = IneligibleHostQueue {
        id: 0,
        job_id,
        host_id,
    };
    store.save(&mut row)
}


pub fn is_blocked(store: &mut Store, job_id: i64, host_id: i64) -> Result<bool, StoreError> {
    let n = store.count(
        "SELECT COUNT(*) FROM ineligible_host_queues WHERE job_id = ? AND host_id = ?",
        &[Value::Integer(job_id), Value::Integer(host_id)],
    )?;
    Ok(n > 0)
}


/// Delete blocks owned by jobs with no incomplete entries. Returns the
/// number of rows removed.
pub fn purge_finished(store: &mut Store) -> Result<usize, StoreError> {
    let ids = store.ids(
        "SELECT id FROM ineligible_host_queues WHERE job_id NOT IN \
         (SELECT DISTINCT job_id FROM host_queue_entries WHERE NOT complete)",
        &[],
    )?;
    for id in &ids {
        store.delete::<IneligibleHostQueue>(*id)?;
    }
    Ok(ids.len())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::host::Host;
    use crate::models::job::Job;
    use chrono::{TimeZone, Utc};

    #[test]
    fn block_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut job = Job::new("alice", "smoke", created);
        store.save(&mut job).unwrap();
        let mut blocked = Host::new("h1");
        store.save(&mut blocked).unwrap();
        let mut other = Host::new("h2");
        store.save(&mut other).unwrap();

        block(&mut store, job.id, blocked.id).unwrap();
        block(&mut store, job.id, blocked.id).unwrap();
        let n = store
            .count("SELECT COUNT(*) FROM ineligible_host_queues", &[])
            .unwrap();
        assert_eq!(n, 1);
        assert!(is_blocked(&mut store, job.id, blocked.id).unwrap());
        assert!(!is_blocked(&mut store, job.id, other.id).unwrap());
    }
}
