//! User and access-key repository.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::DbConn;
use crate::errors::MetaResult;
use crate::metadata::types::DbUser;

const USER_COLUMNS: &str = "user_id, tenant, ns, display_name, user_email, access_keys, \
     swift_keys, sub_users, suspended, max_buckets, op_mask, user_caps, admin, \
     system, placement_name, placement_storage_class, placement_tags, \
     bucket_quota, temp_url_keys, user_quota, \"type\", mfa_ids, \
     assumed_role_arn, user_attrs, user_version, user_version_tag";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<DbUser> {
    Ok(DbUser {
        user_id: row.get(0)?,
        tenant: row.get(1)?,
        ns: row.get(2)?,
        display_name: row.get(3)?,
        user_email: row.get(4)?,
        access_keys: row.get(5)?,
        swift_keys: row.get(6)?,
        sub_users: row.get(7)?,
        suspended: row.get(8)?,
        max_buckets: row.get(9)?,
        op_mask: row.get(10)?,
        user_caps: row.get(11)?,
        admin: row.get(12)?,
        system: row.get(13)?,
        placement_name: row.get(14)?,
        placement_storage_class: row.get(15)?,
        placement_tags: row.get(16)?,
        bucket_quota: row.get(17)?,
        temp_url_keys: row.get(18)?,
        user_quota: row.get(19)?,
        user_type: row.get(20)?,
        mfa_ids: row.get(21)?,
        assumed_role_arn: row.get(22)?,
        user_attrs: row.get(23)?,
        user_version: row.get(24)?,
        user_version_tag: row.get(25)?,
    })
}

/// Repository over the `users` and `access_keys` tables.
pub struct SqliteUsers {
    conn: Arc<DbConn>,
}

impl SqliteUsers {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self { conn }
    }

    pub fn get_user(&self, user_id: &str) -> MetaResult<Option<DbUser>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_email(&self, email: &str) -> MetaResult<Option<DbUser>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_email = ?1"),
                params![email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Look the user up through the `access_keys` table.  When the
    /// same key exists under two users the first row wins.
    pub fn get_user_by_access_key(&self, key: &str) -> MetaResult<Option<DbUser>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let user_id: Option<String> = conn
            .query_row(
                "SELECT user_id FROM access_keys WHERE access_key = ?1 ORDER BY id LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_ids(&self) -> MetaResult<Vec<String>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare("SELECT user_id FROM users")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Upsert a user and resynchronize its `access_keys` rows from the
    /// serialized key map, atomically.
    pub fn store_user(&self, user: &DbUser) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "REPLACE INTO users ({USER_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                         ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
            ),
            params![
                user.user_id,
                user.tenant,
                user.ns,
                user.display_name,
                user.user_email,
                user.access_keys,
                user.swift_keys,
                user.sub_users,
                user.suspended,
                user.max_buckets,
                user.op_mask,
                user.user_caps,
                user.admin,
                user.system,
                user.placement_name,
                user.placement_storage_class,
                user.placement_tags,
                user.bucket_quota,
                user.temp_url_keys,
                user.user_quota,
                user.user_type,
                user.mfa_ids,
                user.assumed_role_arn,
                user.user_attrs,
                user.user_version,
                user.user_version_tag,
            ],
        )?;
        Self::remove_access_keys(&tx, &user.user_id)?;
        for key in access_keys_of(user) {
            tx.execute(
                "INSERT INTO access_keys (access_key, user_id) VALUES (?1, ?2)",
                params![key, user.user_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_user(&self, user_id: &str) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let tx = conn.unchecked_transaction()?;
        Self::remove_access_keys(&tx, user_id)?;
        tx.execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
        tx.commit()?;
        Ok(())
    }

    fn remove_access_keys(conn: &Connection, user_id: &str) -> rusqlite::Result<()> {
        conn.execute(
            "DELETE FROM access_keys WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }
}

/// The `access_keys` column is a JSON object keyed by access key (the
/// values are opaque to the core).  A user with a malformed or empty
/// map simply has no key rows.
fn access_keys_of(user: &DbUser) -> Vec<String> {
    serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&user.access_keys)
        .map(|map| map.into_keys().collect())
        .unwrap_or_default()
}
