//! Table definitions.
//!
//! The frontend owns these tables in production; the scheduler only needs
//! them created for fresh installs and tests.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    hostname    TEXT NOT NULL UNIQUE,
    locked      INTEGER NOT NULL DEFAULT 0,
    locked_by   TEXT,
    lock_time   TEXT,
    status      TEXT NOT NULL DEFAULT 'Ready',
    invalid     INTEGER NOT NULL DEFAULT 0,
    protection  INTEGER NOT NULL DEFAULT 0,
    dirty       INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS atomic_groups (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    name                    TEXT NOT NULL UNIQUE,
    max_number_of_machines  INTEGER NOT NULL,
    invalid                 INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS labels (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    atomic_group_id INTEGER REFERENCES atomic_groups(id),
    only_if_needed  INTEGER NOT NULL DEFAULT 0,
    invalid         INTEGER NOT NULL DEFAULT 0,
    platform        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS host_labels (
    host_id  INTEGER NOT NULL REFERENCES hosts(id),
    label_id INTEGER NOT NULL REFERENCES labels(id),
    PRIMARY KEY (host_id, label_id)
);

CREATE TABLE IF NOT EXISTS jobs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    owner          TEXT NOT NULL,
    name           TEXT NOT NULL,
    priority       INTEGER NOT NULL DEFAULT 0,
    control_file   TEXT NOT NULL DEFAULT '',
    control_type   INTEGER NOT NULL DEFAULT 2,
    created_on     TEXT NOT NULL,
    synch_count    INTEGER NOT NULL DEFAULT 1,
    timeout        INTEGER NOT NULL DEFAULT 72,
    run_verify     INTEGER NOT NULL DEFAULT 1,
    email_list     TEXT NOT NULL DEFAULT '',
    reboot_before  INTEGER NOT NULL DEFAULT 1,
    reboot_after   INTEGER NOT NULL DEFAULT 0,
    reserve_hosts  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS job_dependency_labels (
    job_id   INTEGER NOT NULL REFERENCES jobs(id),
    label_id INTEGER NOT NULL REFERENCES labels(id),
    PRIMARY KEY (job_id, label_id)
);

CREATE TABLE IF NOT EXISTS host_queue_entries (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id           INTEGER NOT NULL REFERENCES jobs(id),
    host_id          INTEGER REFERENCES hosts(id),
    status           TEXT NOT NULL DEFAULT 'Queued',
    meta_host        INTEGER REFERENCES labels(id),
    active           INTEGER NOT NULL DEFAULT 0,
    complete         INTEGER NOT NULL DEFAULT 0,
    execution_subdir TEXT NOT NULL DEFAULT '',
    atomic_group_id  INTEGER REFERENCES atomic_groups(id),
    aborted          INTEGER NOT NULL DEFAULT 0,
    started_on       TEXT
);
CREATE INDEX IF NOT EXISTS hqe_status ON host_queue_entries (status);
CREATE INDEX IF NOT EXISTS hqe_job ON host_queue_entries (job_id);

CREATE TABLE IF NOT EXISTS ineligible_host_queues (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id  INTEGER NOT NULL REFERENCES jobs(id),
    host_id INTEGER NOT NULL REFERENCES hosts(id)
);

CREATE TABLE IF NOT EXISTS acl_groups (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS acl_group_users (
    acl_group_id INTEGER NOT NULL REFERENCES acl_groups(id),
    login        TEXT NOT NULL,
    PRIMARY KEY (acl_group_id, login)
);

CREATE TABLE IF NOT EXISTS acl_group_hosts (
    acl_group_id INTEGER NOT NULL REFERENCES acl_groups(id),
    host_id      INTEGER NOT NULL REFERENCES hosts(id),
    PRIMARY KEY (acl_group_id, host_id)
);
"#;
