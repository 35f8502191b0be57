//! Persistent store access.
//!
//! `Store` wraps the retrying [`connector::Connector`] with an identity cache
//! keyed by (table, id). Reads through [`Store::get`] reuse the cached row;
//! [`Store::fetch`] always re-queries and refreshes the cache. Every write
//! reaches the database before the cached copy is touched.
//!
//! The cache is never evicted implicitly. The dispatcher clears it at the
//! start of each tick; tests call [`Store::evict`] or [`Store::clear_cache`].

pub mod connector;
pub mod record;
pub mod retry;
pub mod schema;

use std::collections::HashMap;
use std::path::Path;

use rusqlite::types::Value;
use tracing::debug;

use crate::error::StoreError;
use connector::Connector;
use record::Record;
use retry::RetryPolicy;


// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Clauses for [`Store::fetch`]. Column references in `filter` and
/// `order_by` should be qualified when `join` is used.
#[derive(Debug, Clone, Default)]
pub struct Query {
    joins: String,
    filter: String,
    order_by: String,
    limit: Option<usize>,
    params: Vec<Value>,
}

impl Query {
    pub fn all() -> Query {
        Query::default()
    }

    pub fn filter(clause: &str, params: Vec<Value>) -> Query {
        Query {
            filter: clause.to_string(),
            params,
            ..Query::default()
        }
    }

    pub fn join(mut self, joins: &str) -> Query {
        self.joins = joins.to_string();
        self
    }

    pub fn order_by(mut self, order: &str) -> Query {
        self.order_by = order.to_string();
        self
    }

    pub fn limit(mut self, n: usize) -> Query {
        self.limit = Some(n);
        self
    }

    fn to_sql<T: Record>(&self) -> String {
        let columns: Vec<String> = T::FIELDS
            .iter()
            .map(|f| format!("{}.{}", T::TABLE, f))
            .collect();
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), T::TABLE);
        if !self.joins.is_empty() {
            sql.push(' ');
            sql.push_str(&self.joins);
        }
        if !self.filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.filter);
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by);
        }
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        sql
    }
}


// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connector,
    cache: HashMap<(&'static str, i64), Vec<Value>>,
}


impl Store {
    pub fn new(conn: Connector) -> Store {
        Store {
            conn,
            cache: HashMap::new(),
        }
    }

    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Store, StoreError> {
        Ok(Store::new(Connector::open(path, retry)?))
    }

    /// A fresh in-memory database with the schema already created.
    pub fn open_in_memory() -> Result<Store, StoreError> {
        let mut store = Store::new(Connector::open_in_memory()?);
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn initialize_schema(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(schema::SCHEMA)
    }

    /// Load by id, reusing the cached row when present.
    pub fn get<T: Record>(&mut self, id: i64) -> Result<T, StoreError> {
        if let Some(values) = self.cache.get(&(T::TABLE, id)) {
            return T::from_values(values);
        }
        self.refresh(id)
    }

    /// Load by id from the database, replacing any cached row.
    pub fn refresh<T: Record>(&mut self, id: i64) -> Result<T, StoreError> {
        let sql = Query::filter(&format!("{}.id = ?", T::TABLE), Vec::new()).to_sql::<T>();
        let mut rows = self.conn.query(&sql, &[Value::Integer(id)])?;
        let values = rows.pop().ok_or(StoreError::RowNotFound {
            table: T::TABLE,
            id,
        })?;
        let record = T::from_values(&values)?;
        self.cache.insert((T::TABLE, id), values);
        Ok(record)
    }

    /// Run a query. Every returned row refreshes the cache.
    pub fn fetch<T: Record>(&mut self, query: Query) -> Result<Vec<T>, StoreError> {
        let sql = query.to_sql::<T>();
        let rows = self.conn.query(&sql, &query.params)?;
        let mut records = Vec::with_capacity(rows.len());
        for values in rows {
            let record = T::from_values(&values)?;
            let key = (T::TABLE, record.id());
            if let Some(cached) = self.cache.get(&key) {
                if cached != &values {
                    debug!(table = T::TABLE, id = record.id(), "requery updated cached row");
                }
            }
            self.cache.insert(key, values);
            records.push(record);
        }
        Ok(records)
    }

    /// Write every column. A record with id 0 is inserted and receives its
    /// new id.
    pub fn save<T: Record>(&mut self, record: &mut T) -> Result<(), StoreError> {
        let mut values = record.to_values();
        let columns = &T::FIELDS[1..];
        if record.id() == 0 {
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                T::TABLE,
                columns.join(", "),
                placeholders
            );
            let id = self.conn.insert(&sql, &values[1..])?;
            values[0] = Value::Integer(id);
            *record = T::from_values(&values)?;
        } else {
            let assignments: Vec<String> = columns.iter().map(|c| format!("{} = ?", c)).collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE id = ?",
                T::TABLE,
                assignments.join(", ")
            );
            let mut params = values[1..].to_vec();
            params.push(Value::Integer(record.id()));
            if self.conn.execute(&sql, &params)? == 0 {
                return Err(StoreError::RowNotFound {
                    table: T::TABLE,
                    id: record.id(),
                });
            }
        }
        self.cache.insert((T::TABLE, record.id()), values);
        Ok(())
    }

    pub fn update_field<T: Record>(
        &mut self,
        record: &mut T,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.update_fields(record, vec![(field, value)])
    }

    /// Write several columns in one statement, then patch the record and
    /// the cached row. Other columns of a stale record are never written.
    pub fn update_fields<T: Record>(
        &mut self,
        record: &mut T,
        changes: Vec<(&str, Value)>,
    ) -> Result<(), StoreError> {
        let mut indexed = Vec::with_capacity(changes.len());
        for (field, value) in changes {
            let idx = T::FIELDS
                .iter()
                .skip(1)
                .position(|f| *f == field)
                .map(|p| p + 1)
                .ok_or_else(|| StoreError::UnknownField {
                    table: T::TABLE,
                    field: field.to_string(),
                })?;
            indexed.push((idx, value));
        }
        if indexed.is_empty() {
            return Ok(());
        }

        let assignments: Vec<String> = indexed
            .iter()
            .map(|(idx, _)| format!("{} = ?", T::FIELDS[*idx]))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            T::TABLE,
            assignments.join(", ")
        );
        let mut params: Vec<Value> = indexed.iter().map(|(_, v)| v.clone()).collect();
        params.push(Value::Integer(record.id()));
        if self.conn.execute(&sql, &params)? == 0 {
            return Err(StoreError::RowNotFound {
                table: T::TABLE,
                id: record.id(),
            });
        }

        let mut values = record.to_values();
        for (idx, value) in &indexed {
            values[*idx] = value.clone();
        }
        *record = T::from_values(&values)?;
        if let Some(cached) = self.cache.get_mut(&(T::TABLE, record.id())) {
            for (idx, value) in indexed {
                cached[idx] = value;
            }
        }
        Ok(())
    }

    pub fn delete<T: Record>(&mut self, id: i64) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", T::TABLE);
        self.conn.execute(&sql, &[Value::Integer(id)])?;
        self.cache.remove(&(T::TABLE, id));
        Ok(())
    }

    /// Drop one cached row. Returns whether it was cached.
    pub fn evict<T: Record>(&mut self, id: i64) -> bool {
        self.cache.remove(&(T::TABLE, id)).is_some()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    // -- raw helpers for aggregate and relation queries --

    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, StoreError> {
        self.conn.execute(sql, params)
    }

    pub fn insert_row(&mut self, sql: &str, params: &[Value]) -> Result<i64, StoreError> {
        self.conn.insert(sql, params)
    }

    pub fn count(&mut self, sql: &str, params: &[Value]) -> Result<i64, StoreError> {
        let rows = self.conn.query(sql, params)?;
        match rows.first().and_then(|r| r.first()) {
            Some(Value::Integer(n)) => Ok(*n),
            _ => Ok(0),
        }
    }

    /// First column of every row, as integers. NULLs are skipped.
    pub fn ids(&mut self, sql: &str, params: &[Value]) -> Result<Vec<i64>, StoreError> {
        let rows = self.conn.query(sql, params)?;
        Ok(rows
            .iter()
            .filter_map(|r| match r.first() {
                Some(Value::Integer(n)) => Some(*n),
                _ => None,
            })
            .collect())
    }

    /// First two columns of every row, as integer pairs.
    pub fn pairs(&mut self, sql: &str, params: &[Value]) -> Result<Vec<(i64, i64)>, StoreError> {
        let rows = self.conn.query(sql, params)?;
        Ok(rows
            .iter()
            .filter_map(|r| match (r.first(), r.get(1)) {
                (Some(Value::Integer(a)), Some(Value::Integer(b))) => Some((*a, *b)),
                _ => None,
            })
            .collect())
    }

    /// First column of every row, as strings.
    pub fn strings(&mut self, sql: &str, params: &[Value]) -> Result<Vec<String>, StoreError> {
        let rows = self.conn.query(sql, params)?;
        Ok(rows
            .into_iter()
            .filter_map(|r| match r.into_iter().next() {
                Some(Value::Text(s)) => Some(s),
                _ => None,
            })
            .collect())
    }
}


/// Comma-separated id list for `IN (...)` clauses. Ids are integers so
/// inlining them is safe.
pub fn id_list(ids: impl IntoIterator<Item = i64>) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::host::{Host, HostStatus};
    use record::text;

    fn store_with_host() -> (Store, Host) {
        let mut store = Store::open_in_memory().unwrap();
        let mut host = Host::new("alpha1");
        store.save(&mut host).unwrap();
        (store, host)
    }

    #[test]
    fn save_assigns_id_and_caches() {
        let (mut store, host) = store_with_host();
        assert!(host.id > 0);
        assert_eq!(store.cached_len(), 1);
        let again: Host = store.get(host.id).unwrap();
        assert_eq!(again, host);
    }

    #[test]
    fn update_field_survives_fresh_load() {
        let (mut store, mut host) = store_with_host();
        store
            .update_field(&mut host, "status", text("Repair Failed"))
            .unwrap();
        store.update_field(&mut host, "dirty", record::flag(true)).unwrap();
        assert_eq!(host.status, HostStatus::RepairFailed);

        assert!(store.evict::<Host>(host.id));
        let fresh: Host = store.get(host.id).unwrap();
        assert_eq!(fresh.status, HostStatus::RepairFailed);
        assert!(fresh.dirty);
        assert_eq!(fresh, host);
    }

    #[test]
    fn save_then_update_then_reload_matches() {
        let (mut store, mut host) = store_with_host();
        host.locked = true;
        host.locked_by = Some("ops".into());
        store.save(&mut host).unwrap();
        store
            .update_field(&mut host, "hostname", text("alpha2"))
            .unwrap();
        store.clear_cache();
        let fresh: Host = store.refresh(host.id).unwrap();
        assert_eq!(fresh.hostname, "alpha2");
        assert_eq!(fresh.locked_by.as_deref(), Some("ops"));
        assert_eq!(fresh, host);
    }

    #[test]
    fn get_reuses_cache_until_evicted() {
        let (mut store, host) = store_with_host();
        store
            .execute(
                "UPDATE hosts SET status = 'Dead' WHERE id = ?",
                &[Value::Integer(host.id)],
            )
            .unwrap();
        let cached: Host = store.get(host.id).unwrap();
        assert_eq!(cached.status, HostStatus::Ready);
        store.evict::<Host>(host.id);
        let fresh: Host = store.get(host.id).unwrap();
        assert_eq!(fresh.status, HostStatus::Dead);
    }

    #[test]
    fn fetch_refreshes_cache() {
        let (mut store, host) = store_with_host();
        store
            .execute(
                "UPDATE hosts SET status = 'Dead' WHERE id = ?",
                &[Value::Integer(host.id)],
            )
            .unwrap();
        let all: Vec<Host> = store.fetch(Query::all()).unwrap();
        assert_eq!(all[0].status, HostStatus::Dead);
        let cached: Host = store.get(host.id).unwrap();
        assert_eq!(cached.status, HostStatus::Dead);
    }

    #[test]
    fn stale_record_update_leaves_other_columns_alone() {
        let (mut store, mut stale) = store_with_host();
        let mut current: Host = store.get(stale.id).unwrap();
        store
            .update_field(&mut current, "status", text("Running"))
            .unwrap();
        store.update_field(&mut stale, "dirty", record::flag(true)).unwrap();
        let cached: Host = store.get(stale.id).unwrap();
        assert_eq!(cached.status, HostStatus::Running);
        assert!(cached.dirty);
    }

    #[test]
    fn unknown_field_rejected() {
        let (mut store, mut host) = store_with_host();
        let err = store
            .update_field(&mut host, "colour", text("red"))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownField { .. }));
        let err = store
            .update_field(&mut host, "id", Value::Integer(9))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownField { .. }));
    }

    #[test]
    fn missing_row_is_not_found() {
        let mut store = Store::open_in_memory().unwrap();
        let err = store.get::<Host>(42).unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound { id: 42, .. }));
    }

    #[test]
    fn query_builds_qualified_sql() {
        let sql = Query::filter("hosts.locked = 0", Vec::new())
            .join("JOIN host_labels ON host_labels.host_id = hosts.id")
            .order_by("hosts.id")
            .limit(3)
            .to_sql::<Host>();
        assert!(sql.starts_with("SELECT hosts.id, hosts.hostname"));
        assert!(sql.contains("JOIN host_labels"));
        assert!(sql.ends_with("WHERE hosts.locked = 0 ORDER BY hosts.id LIMIT 3"));
    }

    #[test]
    fn id_list_joins() {
        assert_eq!(id_list(vec![3, 1, 2]), "3,1,2");
        assert_eq!(id_list(Vec::new()), "");
    }
}
