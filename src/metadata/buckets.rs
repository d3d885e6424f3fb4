//! Bucket repository.
//!
//! `remove_bucket` deletes a single row and intentionally does not
//! cascade: live callers empty the bucket first, and tombstoned
//! buckets (`deleted = true`) are drained by the garbage collector
//! through [`SqliteBuckets::delete_bucket_transact`].

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};

use crate::db::retry::RetrySqlite;
use crate::db::DbConn;
use crate::errors::MetaResult;
use crate::metadata::ignore_constraint;
use crate::metadata::types::{uuid_from_text, DbBucket, DeletedVersionItem, ObjectState, VersionType};

const BUCKET_COLUMNS: &str = "bucket_id, bucket_name, tenant, marker, owner_id, flags, \
     zone_group, quota, creation_time, mtime, placement_name, \
     placement_storage_class, deleted, bucket_attrs, object_lock";

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<DbBucket> {
    Ok(DbBucket {
        bucket_id: row.get(0)?,
        bucket_name: row.get(1)?,
        tenant: row.get(2)?,
        marker: row.get(3)?,
        owner_id: row.get(4)?,
        flags: row.get(5)?,
        zone_group: row.get(6)?,
        quota: row.get(7)?,
        creation_time: row.get(8)?,
        mtime: row.get(9)?,
        placement_name: row.get(10)?,
        placement_storage_class: row.get(11)?,
        deleted: row.get(12)?,
        bucket_attrs: row.get(13)?,
        object_lock: row.get(14)?,
    })
}

/// Repository over the `buckets` table.
pub struct SqliteBuckets {
    conn: Arc<DbConn>,
}

impl SqliteBuckets {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self { conn }
    }

    pub fn get_bucket(&self, bucket_id: &str) -> MetaResult<Option<DbBucket>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let bucket = conn
            .query_row(
                &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE bucket_id = ?1"),
                params![bucket_id],
                bucket_from_row,
            )
            .optional()?;
        Ok(bucket)
    }

    /// Bucket names are not unique across tenants, so this returns all
    /// matches.
    pub fn get_bucket_by_name(&self, bucket_name: &str) -> MetaResult<Vec<DbBucket>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUCKET_COLUMNS} FROM buckets WHERE bucket_name = ?1"
        ))?;
        let rows = stmt.query_map(params![bucket_name], bucket_from_row)?;
        let mut buckets = Vec::new();
        for row in rows {
            buckets.push(row?);
        }
        Ok(buckets)
    }

    /// Owner id and display name of the bucket's owning user.
    pub fn get_owner(&self, bucket_id: &str) -> MetaResult<Option<(String, String)>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let owner = conn
            .query_row(
                "SELECT u.user_id, u.display_name
                 FROM buckets b INNER JOIN users u ON b.owner_id = u.user_id
                 WHERE b.bucket_id = ?1",
                params![bucket_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(owner)
    }

    pub fn get_buckets(&self, owner_id: Option<&str>) -> MetaResult<Vec<DbBucket>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let (sql, filter) = match owner_id {
            Some(owner) => (
                format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE owner_id = ?1"),
                vec![owner.to_string()],
            ),
            None => (format!("SELECT {BUCKET_COLUMNS} FROM buckets"), vec![]),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(filter), bucket_from_row)?;
        let mut buckets = Vec::new();
        for row in rows {
            buckets.push(row?);
        }
        Ok(buckets)
    }

    pub fn get_bucket_ids(&self) -> MetaResult<Vec<String>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare("SELECT bucket_id FROM buckets")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Upsert.  Creating a bucket with an unknown owner fails on the
    /// `owner_id` foreign key.
    pub fn store_bucket(&self, bucket: &DbBucket) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute(
            &format!(
                "REPLACE INTO buckets ({BUCKET_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                bucket.bucket_id,
                bucket.bucket_name,
                bucket.tenant,
                bucket.marker,
                bucket.owner_id,
                bucket.flags,
                bucket.zone_group,
                bucket.quota,
                bucket.creation_time,
                bucket.mtime,
                bucket.placement_name,
                bucket.placement_storage_class,
                bucket.deleted,
                bucket.bucket_attrs,
                bucket.object_lock,
            ],
        )?;
        Ok(())
    }

    /// Delete the row by id, no cascade.
    pub fn remove_bucket(&self, bucket_id: &str) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute("DELETE FROM buckets WHERE bucket_id = ?1", params![bucket_id])?;
        Ok(())
    }

    /// Ids of tombstoned buckets, in insertion order.
    pub fn get_deleted_buckets_ids(&self) -> MetaResult<Vec<String>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT bucket_id FROM buckets WHERE deleted = 1 ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// A bucket is empty iff no committed regular version reaches it.
    /// Open and deleted versions and delete markers do not count.
    pub fn bucket_empty(&self, bucket_id: &str) -> MetaResult<bool> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*)
             FROM versioned_objects v
             INNER JOIN objects o ON o.uuid = v.object_id
             WHERE o.bucket_id = ?1 AND v.object_state = ?2 AND v.version_type = ?3",
            params![bucket_id, ObjectState::Committed, VersionType::Regular],
            |row| row.get(0),
        )?;
        Ok(count == 0)
    }

    /// The next batch of versions (any state, any type) still chained
    /// to a tombstoned bucket, largest payloads first.  The garbage
    /// collector removes their files before it comes back with
    /// [`delete_bucket_transact`].
    ///
    /// [`delete_bucket_transact`]: SqliteBuckets::delete_bucket_transact
    pub fn get_bucket_versions(
        &self,
        bucket_id: &str,
        max_objects: u64,
    ) -> MetaResult<Vec<DeletedVersionItem>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT o.uuid, v.id, v.version_type
             FROM versioned_objects v
             INNER JOIN objects o ON o.uuid = v.object_id
             WHERE o.bucket_id = ?1
             ORDER BY v.size DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![bucket_id, max_objects as i64], |row| {
            let uuid: String = row.get(0)?;
            Ok(DeletedVersionItem {
                object_id: uuid_from_text(&uuid),
                version_db_id: row.get(1)?,
                version_type: row.get(2)?,
            })
        })?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// One GC draining step for a tombstoned bucket: remove the
    /// reclaimed version rows, then every object and finally the
    /// bucket row itself where the foreign keys allow it.  Returns
    /// whether the bucket row was removed; `Ok(None)` means retries on
    /// contention were exhausted and the next scan picks the bucket up
    /// again.
    pub fn delete_bucket_transact(
        &self,
        bucket_id: &str,
        items: &[DeletedVersionItem],
    ) -> MetaResult<Option<bool>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut retry = RetrySqlite::new(|| {
            let tx = conn.unchecked_transaction()?;
            for item in items {
                tx.execute(
                    "DELETE FROM versioned_objects WHERE id = ?1",
                    params![item.version_db_id],
                )?;
                // the object row goes away with its last version; a
                // foreign-key failure just means versions remain
                ignore_constraint(tx.execute(
                    "DELETE FROM objects WHERE uuid = ?1",
                    params![item.object_id.to_string()],
                ))?;
            }
            if items.is_empty() {
                // objects that never got a version have no payload to
                // reclaim and would keep the bucket row alive
                tx.execute(
                    "DELETE FROM objects
                     WHERE bucket_id = ?1
                       AND uuid NOT IN (SELECT object_id FROM versioned_objects)",
                    params![bucket_id],
                )?;
            }
            let bucket_removed = ignore_constraint(tx.execute(
                "DELETE FROM buckets WHERE bucket_id = ?1",
                params![bucket_id],
            ))?
            .map(|n| n > 0)
            .unwrap_or(false);
            tx.commit()?;
            Ok(bucket_removed)
        });
        let removed = retry.run()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::metadata::objects::SqliteObjects;
    use crate::metadata::types::{DbObject, DbUser, DbVersionedObject};
    use crate::metadata::users::SqliteUsers;
    use crate::metadata::versioned_objects::SqliteVersionedObjects;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_conn(dir: &TempDir) -> Arc<DbConn> {
        DbConn::open(&StoreConfig {
            data_path: dir.path().to_path_buf(),
            ..StoreConfig::default()
        })
        .unwrap()
    }

    fn seed_user(conn: &Arc<DbConn>, id: &str) {
        SqliteUsers::new(Arc::clone(conn))
            .store_user(&DbUser {
                user_id: id.to_string(),
                ..DbUser::default()
            })
            .unwrap();
    }

    fn test_bucket(id: &str, owner: &str) -> DbBucket {
        DbBucket {
            bucket_id: id.to_string(),
            bucket_name: format!("{id}-name"),
            owner_id: owner.to_string(),
            ..DbBucket::default()
        }
    }

    #[test]
    fn store_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_user(&conn, "u1");
        let buckets = SqliteBuckets::new(Arc::clone(&conn));

        let bucket = test_bucket("b1", "u1");
        buckets.store_bucket(&bucket).unwrap();
        assert_eq!(buckets.get_bucket("b1").unwrap().unwrap(), bucket);
        assert_eq!(buckets.get_bucket_by_name("b1-name").unwrap().len(), 1);
        assert_eq!(
            buckets.get_owner("b1").unwrap().unwrap(),
            ("u1".to_string(), String::new())
        );
    }

    #[test]
    fn unknown_owner_is_a_foreign_key_error() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        let buckets = SqliteBuckets::new(conn);
        let err = buckets
            .store_bucket(&test_bucket("b1", "missing"))
            .unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn deleted_bucket_ids_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_user(&conn, "u1");
        let buckets = SqliteBuckets::new(conn);

        for id in ["b3", "b1", "b2"] {
            let mut b = test_bucket(id, "u1");
            b.deleted = true;
            buckets.store_bucket(&b).unwrap();
        }
        let mut live = test_bucket("b4", "u1");
        live.deleted = false;
        buckets.store_bucket(&live).unwrap();

        assert_eq!(
            buckets.get_deleted_buckets_ids().unwrap(),
            vec!["b3", "b1", "b2"]
        );
    }

    #[test]
    fn bucket_empty_tracks_committed_regular_versions() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_user(&conn, "u1");
        let buckets = SqliteBuckets::new(Arc::clone(&conn));
        buckets.store_bucket(&test_bucket("b1", "u1")).unwrap();

        let objects = SqliteObjects::new(Arc::clone(&conn));
        let object = DbObject {
            uuid: Uuid::new_v4(),
            bucket_id: "b1".to_string(),
            name: "o1".to_string(),
        };
        objects.store_object(&object).unwrap();

        let versions = SqliteVersionedObjects::new(Arc::clone(&conn));
        let id = versions
            .insert_versioned_object(&DbVersionedObject {
                object_id: object.uuid,
                version_id: "v1".to_string(),
                object_state: ObjectState::Open,
                ..DbVersionedObject::default()
            })
            .unwrap();
        // an open version does not count
        assert!(buckets.bucket_empty("b1").unwrap());

        let mut version = versions.get_versioned_object(id).unwrap().unwrap();
        version.object_state = ObjectState::Committed;
        versions.store_versioned_object(&version).unwrap();
        assert!(!buckets.bucket_empty("b1").unwrap());

        // a delete marker does not count either
        let mut added = false;
        versions
            .add_delete_marker_transact(object.uuid, "marker-1", &mut added)
            .unwrap();
        assert!(added);
        assert!(!buckets.bucket_empty("b1").unwrap());

        version.object_state = ObjectState::Deleted;
        versions.store_versioned_object(&version).unwrap();
        assert!(buckets.bucket_empty("b1").unwrap());
    }
}
