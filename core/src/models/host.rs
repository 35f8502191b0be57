use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::store::record::{self, Record, RowReader};
use crate::store::Store;

// ---------------------------------------------------------------------------
// HostStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostStatus {
    Ready,
    Running,
    Verifying,
    Repairing,
    Rebooting,
    Pending,
    RepairFailed,
    Dead,
}

impl HostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Ready => "Ready",
            HostStatus::Running => "Running",
            HostStatus::Verifying => "Verifying",
            HostStatus::Repairing => "Repairing",
            HostStatus::Rebooting => "Rebooting",
            HostStatus::Pending => "Pending",
            HostStatus::RepairFailed => "Repair Failed",
            HostStatus::Dead => "Dead",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ready" => Ok(HostStatus::Ready),
            "Running" => Ok(HostStatus::Running),
            "Verifying" => Ok(HostStatus::Verifying),
            "Repairing" => Ok(HostStatus::Repairing),
            "Rebooting" => Ok(HostStatus::Rebooting),
            "Pending" => Ok(HostStatus::Pending),
            "Repair Failed" => Ok(HostStatus::RepairFailed),
            "Dead" => Ok(HostStatus::Dead),
            other => Err(format!("unknown host status '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Protection
// ---------------------------------------------------------------------------

/// How much the repair and verify workers are allowed to touch a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protection {
    NoProtection,
    RepairSoftwareOnly,
    RepairFilesystemOnly,
    DoNotRepair,
    DoNotVerify,
}

impl Protection {
    pub fn code(self) -> i64 {
        match self {
            Protection::NoProtection => 0,
            Protection::RepairSoftwareOnly => 1,
            Protection::RepairFilesystemOnly => 2,
            Protection::DoNotRepair => 3,
            Protection::DoNotVerify => 4,
        }
    }

    /// Name passed to the worker's `--host-protection` flag.
    pub fn worker_arg(self) -> &'static str {
        match self {
            Protection::NoProtection => "NO_PROTECTION",
            Protection::RepairSoftwareOnly => "REPAIR_SOFTWARE_ONLY",
            Protection::RepairFilesystemOnly => "REPAIR_FILESYSTEM_ONLY",
            Protection::DoNotRepair => "DO_NOT_REPAIR",
            Protection::DoNotVerify => "DO_NOT_VERIFY",
        }
    }
}

impl TryFrom<i64> for Protection {
    type Error = String;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Protection::NoProtection),
            1 => Ok(Protection::RepairSoftwareOnly),
            2 => Ok(Protection::RepairFilesystemOnly),
            3 => Ok(Protection::DoNotRepair),
            4 => Ok(Protection::DoNotVerify),
            other => Err(format!("unknown protection level {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub id: i64,
    pub hostname: String,
    pub locked: bool,
    pub locked_by: Option<String>,
    pub lock_time: Option<DateTime<Utc>>,
    pub status: HostStatus,
    /// One-time hosts created for a single job; never offered to metahosts.
    pub invalid: bool,
    pub protection: Protection,
    /// Set when a job ran since the last reboot.
    pub dirty: bool,
}

impl Record for Host {
    const TABLE: &'static str = "hosts";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "hostname",
        "locked",
        "locked_by",
        "lock_time",
        "status",
        "invalid",
        "protection",
        "dirty",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn from_values(values: &[Value]) -> Result<Self, StoreError> {
        let row = RowReader::new::<Self>(values)?;
        Ok(Host {
            id: row.int(0)?,
            hostname: row.text(1)?,
            locked: row.flag(2)?,
            locked_by: row.opt_text(3)?,
            lock_time: row.opt_time(4)?,
            status: row.parsed(5)?,
            invalid: row.flag(6)?,
            protection: row.coded(7)?,
            dirty: row.flag(8)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            record::text(&self.hostname),
            record::flag(self.locked),
            record::opt_text(self.locked_by.as_deref()),
            record::opt_time(self.lock_time.as_ref()),
            record::text(self.status.as_str()),
            record::flag(self.invalid),
            Value::Integer(self.protection.code()),
            record::flag(self.dirty),
        ]
    }
}

impl Host {
    /// An unsaved, unlocked, Ready host.
    pub fn new(hostname: &str) -> Host {
        Host {
            id: 0,
            hostname: hostname.to_string(),
            locked: false,
            locked_by: None,
            lock_time: None,
            status: HostStatus::Ready,
            invalid: false,
            protection: Protection::NoProtection,
            dirty: false,
        }
    }

    pub fn set_status(&mut self, store: &mut Store, status: HostStatus) -> Result<(), StoreError> {
        info!(host = %self.hostname, from = %self.status, to = %status, "host status change");
        store.update_field(self, "status", record::text(status.as_str()))
    }

    pub fn set_dirty(&mut self, store: &mut Store, dirty: bool) -> Result<(), StoreError> {
        store.update_field(self, "dirty", record::flag(dirty))
    }

    /// Whether any queue entry assigned to this host is active.
    pub fn has_active_entry(&self, store: &mut Store) -> Result<bool, StoreError> {
        let n = store.count(
            "SELECT COUNT(*) FROM host_queue_entries WHERE host_id = ? AND active",
            &[Value::Integer(self.id)],
        )?;
        Ok(n > 0)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.hostname)
    }
}


/// Natural hostname order: a trailing number compares numerically, so
/// `rack2` sorts before `rack10`.
pub fn cmp_hostnames(a: &str, b: &str) -> Ordering {
    match (split_trailing_number(a), split_trailing_number(b)) {
        (Some((pa, na)), Some((pb, nb))) => pa.cmp(pb).then(na.cmp(&nb)),
        _ => a.cmp(b),
    }
}

fn split_trailing_number(name: &str) -> Option<(&str, u64)> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 || digits == name.len() {
        return None;
    }
    let (prefix, number) = name.split_at(name.len() - digits);
    if !prefix.chars().all(|c| c.is_ascii_lowercase() || c == '-') {
        return None;
    }
    number.parse().ok().map(|n| (prefix, n))
}
