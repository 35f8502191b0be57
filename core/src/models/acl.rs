//! ACL groups and host reservations.
//!
//! A job may use a host only when its owner shares an ACL group with the
//! host. Reserving a host moves it into a private group for one owner.

use rusqlite::types::Value;
use tracing::info;

use crate::error::StoreError;
use crate::store::record::text;
use crate::store::Store;


/// Find or create an ACL group by name.
pub fn ensure_group(store: &mut Store, name: &str) -> Result<i64, StoreError> {
    let existing = store.ids("SELECT id FROM acl_groups WHERE name = ?", &[text(name)])?;
    if let Some(id) = existing.first() {
        return Ok(*id);
    }
    store.insert_row("INSERT INTO acl_groups (name) VALUES (?)", &[text(name)])
}


pub fn add_user(store: &mut Store, group_id: i64, login: &str) -> Result<(), StoreError> {
    store.execute(
        "INSERT OR IGNORE INTO acl_group_users (acl_group_id, login) VALUES (?, ?)",
        &[Value::Integer(group_id), text(login)],
    )?;
    Ok(())
}


pub fn add_host(store: &mut Store, group_id: i64, host_id: i64) -> Result<(), StoreError> {
    store.execute(
        "INSERT OR IGNORE INTO acl_group_hosts (acl_group_id, host_id) VALUES (?, ?)",
        &[Value::Integer(group_id), Value::Integer(host_id)],
    )?;
    Ok(())
}


/// Whether `login` shares at least one ACL group with the host.
pub fn can_use(store: &mut Store, login: &str, host_id: i64) -> Result<bool, StoreError> {
    let n = store.count(
        "SELECT COUNT(*) FROM acl_group_users u \
         JOIN acl_group_hosts h ON h.acl_group_id = u.acl_group_id \
         WHERE u.login = ? AND h.host_id = ?",
        &[text(login), Value::Integer(host_id)],
    )?;
    Ok(n > 0)
}


/// Make `reservation:<owner>` the host's only ACL group.
pub fn reserve_host(store: &mut Store, host_id: i64, owner: &str) -> Result<(), StoreError> {
    let group = ensure_group(store, &format!("reservation:{}", owner))?;
    add_user(store, group, owner)?;
    store.execute(
        "DELETE FROM acl_group_hosts WHERE host_id = ? AND acl_group_id != ?",
        &[Value::Integer(host_id), Value::Integer(group)],
    )?;
    add_host(store, group, host_id)?;
    info!(host = host_id, owner, "host reserved");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::host::Host;

    fn store_with_host() -> (Store, i64) {
        let mut store = Store::open_in_memory().unwrap();
        let mut host = Host::new("h7");
        store.save(&mut host).unwrap();
        (store, host.id)
    }

    #[test]
    fn shared_group_grants_access() {
        let (mut store, h) = store_with_host();
        let everyone = ensure_group(&mut store, "Everyone").unwrap();
        assert_eq!(ensure_group(&mut store, "Everyone").unwrap(), everyone);
        add_user(&mut store, everyone, "alice").unwrap();
        add_host(&mut store, everyone, h).unwrap();
        assert!(can_use(&mut store, "alice", h).unwrap());
        assert!(!can_use(&mut store, "bob", h).unwrap());
    }

    #[test]
    fn reservation_excludes_other_users() {
        let (mut store, h) = store_with_host();
        let everyone = ensure_group(&mut store, "Everyone").unwrap();
        add_user(&mut store, everyone, "alice").unwrap();
        add_user(&mut store, everyone, "bob").unwrap();
        add_host(&mut store, everyone, h).unwrap();

        reserve_host(&mut store, h, "alice").unwrap();
        assert!(can_use(&mut store, "alice", h).unwrap());
        assert!(!can_use(&mut store, "bob", h).unwrap());
    }
}
