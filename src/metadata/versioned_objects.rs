//! Version repository.
//!
//! A version's `object_state` drives its lifecycle: inserted OPEN by
//! an upload, OPEN -> COMMITTED on finalize, OPEN -> DELETED on abort,
//! COMMITTED -> DELETED on delete.  DELETED rows are invisible to the
//! front-end and reclaimed by the garbage collector together with
//! their payload files.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::db::retry::RetrySqlite;
use crate::db::DbConn;
use crate::errors::MetaResult;
use crate::metadata::types::{
    uuid_from_text, DbVersionedObject, DeletedVersionItem, ObjectState, VersionType,
};

const VERSION_COLUMNS: &str = "id, object_id, checksum, size, create_time, delete_time, \
     commit_time, mtime, object_state, version_id, etag, attrs, version_type";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<DbVersionedObject> {
    let object_id: String = row.get(1)?;
    Ok(DbVersionedObject {
        id: row.get(0)?,
        object_id: uuid_from_text(&object_id),
        checksum: row.get(2)?,
        size: row.get(3)?,
        create_time: row.get(4)?,
        delete_time: row.get(5)?,
        commit_time: row.get(6)?,
        mtime: row.get(7)?,
        object_state: row.get(8)?,
        version_id: row.get(9)?,
        etag: row.get(10)?,
        attrs: row.get(11)?,
        version_type: row.get(12)?,
    })
}

fn states_filter(states: &[ObjectState]) -> String {
    states
        .iter()
        .map(|s| (*s as i64).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One entry of a bucket listing: the live tip of each object.
#[derive(Debug, Clone)]
pub struct ListedObject {
    pub uuid: Uuid,
    pub name: String,
    pub version: DbVersionedObject,
}

/// Repository over the `versioned_objects` table.
pub struct SqliteVersionedObjects {
    conn: Arc<DbConn>,
    clock: Arc<dyn Clock>,
}

impl SqliteVersionedObjects {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self::with_clock(conn, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(conn: Arc<DbConn>, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    pub fn get_versioned_object(&self, id: i64) -> MetaResult<Option<DbVersionedObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let version = conn
            .query_row(
                &format!("SELECT {VERSION_COLUMNS} FROM versioned_objects WHERE id = ?1"),
                params![id],
                version_from_row,
            )
            .optional()?;
        Ok(version)
    }

    pub fn get_versioned_object_by_version_id(
        &self,
        object_id: Uuid,
        version_id: &str,
    ) -> MetaResult<Option<DbVersionedObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let version = conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versioned_objects
                     WHERE object_id = ?1 AND version_id = ?2"
                ),
                params![object_id.to_string(), version_id],
                version_from_row,
            )
            .optional()?;
        Ok(version)
    }

    pub fn get_versioned_objects(
        &self,
        object_id: Uuid,
        filter_deleted: bool,
    ) -> MetaResult<Vec<DbVersionedObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let sql = if filter_deleted {
            format!(
                "SELECT {VERSION_COLUMNS} FROM versioned_objects
                 WHERE object_id = ?1 AND object_state != {}
                 ORDER BY commit_time DESC",
                ObjectState::Deleted as i64
            )
        } else {
            format!(
                "SELECT {VERSION_COLUMNS} FROM versioned_objects
                 WHERE object_id = ?1 ORDER BY commit_time DESC"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![object_id.to_string()], version_from_row)?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }

    /// The highest-id version of the object, any state.
    pub fn get_last_versioned_object(
        &self,
        object_id: Uuid,
    ) -> MetaResult<Option<DbVersionedObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let version = conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versioned_objects
                     WHERE object_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![object_id.to_string()],
                version_from_row,
            )
            .optional()?;
        Ok(version)
    }

    /// The live tip of every object in a bucket, for listings:
    /// non-deleted versions grouped per object, newest first within
    /// the group, objects ordered by name.
    pub fn list_last_versioned_objects(&self, bucket_id: &str) -> MetaResult<Vec<ListedObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT o.uuid, o.name, {cols}
             FROM versioned_objects v
             INNER JOIN objects o ON o.uuid = v.object_id
             WHERE o.bucket_id = ?1 AND v.object_state != {deleted}
               AND v.id = (SELECT MAX(v2.id) FROM versioned_objects v2
                           WHERE v2.object_id = v.object_id
                             AND v2.object_state != {deleted})
             ORDER BY o.name",
            cols = VERSION_COLUMNS
                .split(", ")
                .map(|c| format!("v.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
            deleted = ObjectState::Deleted as i64,
        ))?;
        let rows = stmt.query_map(params![bucket_id], |row| {
            let uuid: String = row.get(0)?;
            let name: String = row.get(1)?;
            let object_id: String = row.get(3)?;
            Ok(ListedObject {
                uuid: uuid_from_text(&uuid),
                name,
                version: DbVersionedObject {
                    id: row.get(2)?,
                    object_id: uuid_from_text(&object_id),
                    checksum: row.get(4)?,
                    size: row.get(5)?,
                    create_time: row.get(6)?,
                    delete_time: row.get(7)?,
                    commit_time: row.get(8)?,
                    mtime: row.get(9)?,
                    object_state: row.get(10)?,
                    version_id: row.get(11)?,
                    etag: row.get(12)?,
                    attrs: row.get(13)?,
                    version_type: row.get(14)?,
                },
            })
        })?;
        let mut listed = Vec::new();
        for row in rows {
            listed.push(row?);
        }
        Ok(listed)
    }

    /// Insert a new row, returning its id.
    pub fn insert_versioned_object(&self, version: &DbVersionedObject) -> MetaResult<i64> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        Self::insert(&conn, version)?;
        Ok(conn.last_insert_rowid())
    }

    /// Update every column of the row identified by `version.id`.
    pub fn store_versioned_object(&self, version: &DbVersionedObject) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        Self::update_where_state(&conn, version, None)?;
        Ok(())
    }

    /// Update the row only while its current state is one of
    /// `allowed_states`.  Returns whether the transition happened --
    /// this is the state machine guard for OPEN -> COMMITTED and
    /// friends.
    pub fn store_versioned_object_if_state(
        &self,
        version: &DbVersionedObject,
        allowed_states: &[ObjectState],
    ) -> MetaResult<bool> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let changed = Self::update_where_state(&conn, version, Some(allowed_states))?;
        Ok(changed > 0)
    }

    /// Commit `version` and soft-delete every other COMMITTED version
    /// of the same object in one transaction.  OPEN versions are left
    /// alone, they may be an in-progress write racing us.
    pub fn store_versioned_object_delete_committed_transact_if_state(
        &self,
        version: &DbVersionedObject,
        allowed_states: &[ObjectState],
    ) -> MetaResult<bool> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut retry = RetrySqlite::new(|| {
            let tx = conn.unchecked_transaction()?;
            if Self::update_where_state(&tx, version, Some(allowed_states))? == 0 {
                return Ok(false);
            }
            tx.execute(
                &format!(
                    "UPDATE versioned_objects SET object_state = {deleted}
                     WHERE object_id = ?1 AND object_state = {committed} AND id != ?2",
                    deleted = ObjectState::Deleted as i64,
                    committed = ObjectState::Committed as i64,
                ),
                params![version.object_id.to_string(), version.id],
            )?;
            tx.commit()?;
            Ok(true)
        });
        Ok(retry.run()?.unwrap_or(false))
    }

    pub fn remove_versioned_object(&self, id: i64) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute("DELETE FROM versioned_objects WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Atomically ensure the object row exists and insert a new OPEN
    /// version with the given `version_id`.
    pub fn create_new_versioned_object_transact(
        &self,
        bucket_id: &str,
        object_name: &str,
        version_id: &str,
    ) -> MetaResult<Option<DbVersionedObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut retry = RetrySqlite::new(|| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT uuid FROM objects WHERE bucket_id = ?1 AND name = ?2",
                    params![bucket_id, object_name],
                    |row| row.get(0),
                )
                .optional()?;
            let uuid = match existing {
                Some(uuid) => uuid_from_text(&uuid),
                None => {
                    let uuid = Uuid::new_v4();
                    tx.execute(
                        "REPLACE INTO objects (uuid, bucket_id, name) VALUES (?1, ?2, ?3)",
                        params![uuid.to_string(), bucket_id, object_name],
                    )?;
                    uuid
                }
            };
            let mut version = DbVersionedObject {
                object_id: uuid,
                object_state: ObjectState::Open,
                version_type: VersionType::Regular,
                version_id: version_id.to_string(),
                create_time: self.clock.now(),
                ..DbVersionedObject::default()
            };
            Self::insert(&tx, &version)?;
            version.id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(version)
        });
        let version = retry.run()?;
        Ok(version)
    }

    /// Append a delete marker on top of the object's live tip.
    ///
    /// `added` is set only when a marker was actually inserted: the
    /// tip must be a regular OPEN or COMMITTED version.  When the tip
    /// is already a delete marker, or the object has no live versions
    /// at all, nothing happens.
    pub fn add_delete_marker_transact(
        &self,
        object_id: Uuid,
        delete_marker_id: &str,
        added: &mut bool,
    ) -> MetaResult<i64> {
        *added = false;
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let tx = conn.unchecked_transaction()?;
        let last = tx
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versioned_objects
                     WHERE object_id = ?1 AND object_state != {deleted}
                     ORDER BY version_type DESC, commit_time DESC, id DESC
                     LIMIT 1",
                    deleted = ObjectState::Deleted as i64,
                ),
                params![object_id.to_string()],
                version_from_row,
            )
            .optional()?;

        let Some(mut marker) = last else {
            return Ok(0);
        };
        if marker.version_type != VersionType::Regular
            || !matches!(
                marker.object_state,
                ObjectState::Open | ObjectState::Committed
            )
        {
            return Ok(0);
        }

        let now = self.clock.now();
        marker.version_type = VersionType::DeleteMarker;
        marker.object_state = ObjectState::Committed;
        marker.delete_time = now;
        marker.mtime = now;
        marker.version_id = delete_marker_id.to_string();
        Self::insert(&tx, &marker)?;
        let id = tx.last_insert_rowid();
        // only commit when the marker was indeed inserted, everything
        // else in this transaction is a read
        tx.commit()?;
        *added = true;
        Ok(id)
    }

    /// Remove one version and return the object's new live tip, in one
    /// transaction.  `None` when the id did not exist or no live
    /// version remains.
    pub fn delete_version_and_get_previous_transact(
        &self,
        object_id: Uuid,
        id: i64,
    ) -> MetaResult<Option<DbVersionedObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let tx = conn.unchecked_transaction()?;
        let removed = tx.execute("DELETE FROM versioned_objects WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Ok(None);
        }
        let previous = tx
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versioned_objects
                     WHERE object_id = ?1 AND object_state != {deleted}
                     ORDER BY version_type DESC, commit_time DESC, id DESC
                     LIMIT 1",
                    deleted = ObjectState::Deleted as i64,
                ),
                params![object_id.to_string()],
                version_from_row,
            )
            .optional()?;
        tx.commit()?;
        Ok(previous)
    }

    /// The next batch of DELETED versions to reclaim, largest payloads
    /// first.  The garbage collector removes their files before it
    /// comes back with [`remove_deleted_versions_transact`]; a crash
    /// in between leaves the tombstone rows for the next scan.
    ///
    /// [`remove_deleted_versions_transact`]:
    /// SqliteVersionedObjects::remove_deleted_versions_transact
    pub fn get_deleted_versions(&self, max_objects: u64) -> MetaResult<Vec<DeletedVersionItem>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT object_id, id, version_type FROM versioned_objects
             WHERE object_state = {deleted}
             ORDER BY size DESC
             LIMIT ?1",
            deleted = ObjectState::Deleted as i64,
        ))?;
        let rows = stmt.query_map(params![max_objects as i64], |row| {
            let object_id: String = row.get(0)?;
            Ok(DeletedVersionItem {
                object_id: uuid_from_text(&object_id),
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

    /// Remove reclaimed version rows and, for every object left
    /// without a regular version, its trailing delete markers and the
    /// object row itself.  Rows that left the DELETED state since the
    /// batch was selected are skipped.  `Ok(None)` when retries on
    /// contention were exhausted.
    pub fn remove_deleted_versions_transact(
        &self,
        items: &[DeletedVersionItem],
    ) -> MetaResult<Option<()>> {
        if items.is_empty() {
            return Ok(Some(()));
        }
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut retry = RetrySqlite::new(|| {
            let tx = conn.unchecked_transaction()?;
            for item in items {
                tx.execute(
                    &format!(
                        "DELETE FROM versioned_objects
                         WHERE id = ?1 AND object_state = {deleted}",
                        deleted = ObjectState::Deleted as i64,
                    ),
                    params![item.version_db_id],
                )?;
            }
            for item in items {
                let object_id = item.object_id.to_string();
                let regular_left: i64 = tx.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM versioned_objects
                         WHERE object_id = ?1 AND version_type = {regular}",
                        regular = VersionType::Regular as i64,
                    ),
                    params![object_id],
                    |row| row.get(0),
                )?;
                if regular_left == 0 {
                    // drop possible delete markers before the object
                    tx.execute(
                        &format!(
                            "DELETE FROM versioned_objects
                             WHERE object_id = ?1 AND version_type = {marker}",
                            marker = VersionType::DeleteMarker as i64,
                        ),
                        params![object_id],
                    )?;
                    tx.execute("DELETE FROM objects WHERE uuid = ?1", params![object_id])?;
                }
            }
            tx.commit()?;
            Ok(())
        });
        let done = retry.run()?;
        Ok(done)
    }

    fn insert(conn: &Connection, version: &DbVersionedObject) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO versioned_objects
                 (object_id, checksum, size, create_time, delete_time, commit_time,
                  mtime, object_state, version_id, etag, attrs, version_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                version.object_id.to_string(),
                version.checksum,
                version.size,
                version.create_time,
                version.delete_time,
                version.commit_time,
                version.mtime,
                version.object_state,
                version.version_id,
                version.etag,
                version.attrs,
                version.version_type,
            ],
        )
    }

    fn update_where_state(
        conn: &Connection,
        version: &DbVersionedObject,
        allowed_states: Option<&[ObjectState]>,
    ) -> rusqlite::Result<usize> {
        let mut sql = String::from(
            "UPDATE versioned_objects SET
                 object_id = ?1, checksum = ?2, size = ?3, create_time = ?4,
                 delete_time = ?5, commit_time = ?6, mtime = ?7, object_state = ?8,
                 version_id = ?9, etag = ?10, attrs = ?11, version_type = ?12
             WHERE id = ?13",
        );
        if let Some(states) = allowed_states {
            sql.push_str(&format!(" AND object_state IN ({})", states_filter(states)));
        }
        conn.execute(
            &sql,
            params![
                version.object_id.to_string(),
                version.checksum,
                version.size,
                version.create_time,
                version.delete_time,
                version.commit_time,
                version.mtime,
                version.object_state,
                version.version_id,
                version.etag,
                version.attrs,
                version.version_type,
                version.id,
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::metadata::buckets::SqliteBuckets;
    use crate::metadata::objects::SqliteObjects;
    use crate::metadata::types::{DbBucket, DbObject, DbUser};
    use crate::metadata::users::SqliteUsers;
    use tempfile::TempDir;

    fn test_conn(dir: &TempDir) -> Arc<DbConn> {
        DbConn::open(&StoreConfig {
            data_path: dir.path().to_path_buf(),
            ..StoreConfig::default()
        })
        .unwrap()
    }

    fn seed_bucket(conn: &Arc<DbConn>, bucket_id: &str) {
        SqliteUsers::new(Arc::clone(conn))
            .store_user(&DbUser {
                user_id: "u1".to_string(),
                ..DbUser::default()
            })
            .unwrap();
        SqliteBuckets::new(Arc::clone(conn))
            .store_bucket(&DbBucket {
                bucket_id: bucket_id.to_string(),
                bucket_name: format!("{bucket_id}-name"),
                owner_id: "u1".to_string(),
                ..DbBucket::default()
            })
            .unwrap();
    }

    #[test]
    fn create_new_versioned_object_creates_object_once() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let versions = SqliteVersionedObjects::new(Arc::clone(&conn));

        let v1 = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-1")
            .unwrap()
            .unwrap();
        assert_eq!(v1.object_state, ObjectState::Open);
        assert_eq!(v1.version_type, VersionType::Regular);

        let v2 = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-2")
            .unwrap()
            .unwrap();
        // same object, new version
        assert_eq!(v1.object_id, v2.object_id);
        assert_ne!(v1.id, v2.id);

        let objects = SqliteObjects::new(conn);
        assert_eq!(objects.get_object_ids("b1").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_version_id_per_object_is_rejected() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let versions = SqliteVersionedObjects::new(conn);

        versions
            .create_new_versioned_object_transact("b1", "o1", "ver-1")
            .unwrap()
            .unwrap();
        let err = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-1")
            .unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn state_guarded_store_only_fires_from_allowed_states() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let versions = SqliteVersionedObjects::new(conn);

        let mut version = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-1")
            .unwrap()
            .unwrap();

        version.object_state = ObjectState::Committed;
        assert!(versions
            .store_versioned_object_if_state(&version, &[ObjectState::Open])
            .unwrap());

        // already committed, the OPEN guard no longer matches
        version.object_state = ObjectState::Deleted;
        assert!(!versions
            .store_versioned_object_if_state(&version, &[ObjectState::Open])
            .unwrap());
        let current = versions.get_versioned_object(version.id).unwrap().unwrap();
        assert_eq!(current.object_state, ObjectState::Committed);
    }

    #[test]
    fn committing_soft_deletes_other_committed_versions() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let versions = SqliteVersionedObjects::new(conn);

        let mut v1 = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-1")
            .unwrap()
            .unwrap();
        v1.object_state = ObjectState::Committed;
        versions.store_versioned_object(&v1).unwrap();

        let mut v2 = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-2")
            .unwrap()
            .unwrap();
        let mut open_racer = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-3")
            .unwrap()
            .unwrap();

        v2.object_state = ObjectState::Committed;
        assert!(versions
            .store_versioned_object_delete_committed_transact_if_state(
                &v2,
                &[ObjectState::Open]
            )
            .unwrap());

        let v1_now = versions.get_versioned_object(v1.id).unwrap().unwrap();
        assert_eq!(v1_now.object_state, ObjectState::Deleted);
        let v2_now = versions.get_versioned_object(v2.id).unwrap().unwrap();
        assert_eq!(v2_now.object_state, ObjectState::Committed);
        // the racing OPEN upload is untouched
        open_racer = versions
            .get_versioned_object(open_racer.id)
            .unwrap()
            .unwrap();
        assert_eq!(open_racer.object_state, ObjectState::Open);
    }

    #[test]
    fn add_delete_marker_semantics() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let versions = SqliteVersionedObjects::new(conn);

        // unknown object: nothing added
        let mut added = true;
        versions
            .add_delete_marker_transact(Uuid::new_v4(), "m0", &mut added)
            .unwrap();
        assert!(!added);

        let mut v1 = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-1")
            .unwrap()
            .unwrap();
        v1.object_state = ObjectState::Committed;
        versions.store_versioned_object(&v1).unwrap();

        let marker_id = versions
            .add_delete_marker_transact(v1.object_id, "m1", &mut added)
            .unwrap();
        assert!(added);
        let marker = versions.get_versioned_object(marker_id).unwrap().unwrap();
        assert_eq!(marker.version_type, VersionType::DeleteMarker);
        assert_eq!(marker.object_state, ObjectState::Committed);
        assert_eq!(marker.version_id, "m1");

        // the tip is now a marker, a second marker is refused
        versions
            .add_delete_marker_transact(v1.object_id, "m2", &mut added)
            .unwrap();
        assert!(!added);

        let last = versions
            .get_last_versioned_object(v1.object_id)
            .unwrap()
            .unwrap();
        assert_eq!(last.id, marker_id);
    }

    #[test]
    fn delete_version_and_get_previous() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let versions = SqliteVersionedObjects::new(conn);

        let mut v1 = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-1")
            .unwrap()
            .unwrap();
        v1.object_state = ObjectState::Committed;
        v1.commit_time = 10;
        versions.store_versioned_object(&v1).unwrap();
        let mut v2 = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-2")
            .unwrap()
            .unwrap();
        v2.object_state = ObjectState::Committed;
        v2.commit_time = 20;
        versions.store_versioned_object(&v2).unwrap();

        let previous = versions
            .delete_version_and_get_previous_transact(v2.object_id, v2.id)
            .unwrap()
            .unwrap();
        assert_eq!(previous.id, v1.id);

        assert!(versions
            .delete_version_and_get_previous_transact(v1.object_id, v1.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn remove_deleted_versions_reclaims_rows_and_empty_objects() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let versions = SqliteVersionedObjects::new(Arc::clone(&conn));
        let objects = SqliteObjects::new(Arc::clone(&conn));

        let mut v1 = versions
            .create_new_versioned_object_transact("b1", "o1", "ver-1")
            .unwrap()
            .unwrap();
        v1.object_state = ObjectState::Committed;
        versions.store_versioned_object(&v1).unwrap();
        let mut added = false;
        versions
            .add_delete_marker_transact(v1.object_id, "m1", &mut added)
            .unwrap();

        // nothing is DELETED yet, there is nothing to reclaim
        assert!(versions.get_deleted_versions(100).unwrap().is_empty());

        v1.object_state = ObjectState::Deleted;
        versions.store_versioned_object(&v1).unwrap();
        let items = versions.get_deleted_versions(100).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].version_db_id, v1.id);
        versions
            .remove_deleted_versions_transact(&items)
            .unwrap()
            .unwrap();

        // the object lost its last regular version: marker and object
        // row are gone too
        assert!(objects.get_object(v1.object_id).unwrap().is_none());
        assert!(versions
            .get_last_versioned_object(v1.object_id)
            .unwrap()
            .is_none());

        // idempotent: a second pass finds nothing and errors on
        // nothing
        let items = versions.get_deleted_versions(100).unwrap();
        assert!(items.is_empty());
        versions
            .remove_deleted_versions_transact(&items)
            .unwrap()
            .unwrap();
    }

    #[test]
    fn list_last_versioned_objects_returns_live_tips() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let versions = SqliteVersionedObjects::new(conn);

        for name in ["a", "b"] {
            let mut v = versions
                .create_new_versioned_object_transact("b1", name, "ver-1")
                .unwrap()
                .unwrap();
            v.object_state = ObjectState::Committed;
            versions.store_versioned_object(&v).unwrap();
            let mut v2 = versions
                .create_new_versioned_object_transact("b1", name, "ver-2")
                .unwrap()
                .unwrap();
            v2.object_state = ObjectState::Committed;
            versions.store_versioned_object(&v2).unwrap();
        }

        let listed = versions.list_last_versioned_objects("b1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "a");
        assert_eq!(listed[1].name, "b");
        assert!(listed.iter().all(|l| l.version.version_id == "ver-2"));
    }
}
