//! Multipart upload repository.
//!
//! Upload state machine: INPROGRESS -> COMPLETE or ABORTED on client
//! action, COMPLETE -> AGGREGATING when the assembler picks the upload
//! up, AGGREGATING -> DONE when assembly succeeded.  DONE and ABORTED
//! uploads are reclaimed by the garbage collector, as is everything
//! under a tombstoned bucket regardless of state.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::clock::{Clock, SystemClock};
use crate::db::retry::RetrySqlite;
use crate::db::DbConn;
use crate::errors::MetaResult;
use crate::metadata::types::{
    uuid_from_text, DbMultipart, DbMultipartPart, DeletedPartItem, MultipartState,
};

const MULTIPART_COLUMNS: &str = "id, bucket_id, upload_id, state, state_change_time, \
     object_name, path_uuid, meta_str, owner_id, mtime, attrs, placement";

const PART_COLUMNS: &str = "id, upload_id, part_num, size, etag, mtime";

fn multipart_from_row(row: &Row<'_>) -> rusqlite::Result<DbMultipart> {
    let path_uuid: String = row.get(6)?;
    Ok(DbMultipart {
        id: row.get(0)?,
        bucket_id: row.get(1)?,
        upload_id: row.get(2)?,
        state: row.get(3)?,
        state_change_time: row.get(4)?,
        object_name: row.get(5)?,
        path_uuid: uuid_from_text(&path_uuid),
        meta_str: row.get(7)?,
        owner_id: row.get(8)?,
        mtime: row.get(9)?,
        attrs: row.get(10)?,
        placement: row.get(11)?,
    })
}

fn bucket_filter(bucket_id: &str) -> String {
    format!("m.bucket_id = '{}'", bucket_id.replace('\'', "''"))
}

fn done_or_aborted_filter() -> String {
    format!(
        "(m.state = {done} OR m.state = {aborted})",
        done = MultipartState::Done as i64,
        aborted = MultipartState::Aborted as i64,
    )
}

fn part_from_row(row: &Row<'_>) -> rusqlite::Result<DbMultipartPart> {
    Ok(DbMultipartPart {
        id: row.get(0)?,
        upload_id: row.get(1)?,
        part_num: row.get(2)?,
        size: row.get(3)?,
        etag: row.get(4)?,
        mtime: row.get(5)?,
    })
}

/// Repository over the `multiparts` and `multiparts_parts` tables.
pub struct SqliteMultipart {
    conn: Arc<DbConn>,
    clock: Arc<dyn Clock>,
}

impl SqliteMultipart {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self::with_clock(conn, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(conn: Arc<DbConn>, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    /// Insert a new upload, returning its id.  `upload_id` and
    /// `path_uuid` must be unused.
    pub fn insert(&self, multipart: &DbMultipart) -> MetaResult<i64> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute(
            "INSERT INTO multiparts
                 (bucket_id, upload_id, state, state_change_time, object_name,
                  path_uuid, meta_str, owner_id, mtime, attrs, placement)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                multipart.bucket_id,
                multipart.upload_id,
                multipart.state,
                multipart.state_change_time,
                multipart.object_name,
                multipart.path_uuid.to_string(),
                multipart.meta_str,
                multipart.owner_id,
                multipart.mtime,
                multipart.attrs,
                multipart.placement,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_multipart(&self, upload_id: &str) -> MetaResult<Option<DbMultipart>> {
        if upload_id.is_empty() {
            return Ok(None);
        }
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let multipart = conn
            .query_row(
                &format!("SELECT {MULTIPART_COLUMNS} FROM multiparts WHERE upload_id = ?1"),
                params![upload_id],
                multipart_from_row,
            )
            .optional()?;
        Ok(multipart)
    }

    pub fn get_multipart_by_id(&self, id: i64) -> MetaResult<Option<DbMultipart>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let multipart = conn
            .query_row(
                &format!("SELECT {MULTIPART_COLUMNS} FROM multiparts WHERE id = ?1"),
                params![id],
                multipart_from_row,
            )
            .optional()?;
        Ok(multipart)
    }

    pub fn list_multiparts_by_bucket_id(&self, bucket_id: &str) -> MetaResult<Vec<DbMultipart>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {MULTIPART_COLUMNS} FROM multiparts
             WHERE bucket_id = ?1 ORDER BY meta_str"
        ))?;
        let rows = stmt.query_map(params![bucket_id], multipart_from_row)?;
        let mut multiparts = Vec::new();
        for row in rows {
            multiparts.push(row?);
        }
        Ok(multiparts)
    }

    /// Create the part row for an incoming part upload, or reset it
    /// when the part is re-uploaded.  The parent upload must exist and
    /// be INPROGRESS.
    pub fn create_or_reset_part(
        &self,
        upload_id: &str,
        part_num: i64,
    ) -> MetaResult<Option<DbMultipartPart>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let tx = conn.unchecked_transaction()?;

        let uploads: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM multiparts
                 WHERE upload_id = ?1 AND state = {inprogress}",
                inprogress = MultipartState::InProgress as i64,
            ),
            params![upload_id],
            |row| row.get(0),
        )?;
        if uploads != 1 {
            return Ok(None);
        }

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {PART_COLUMNS} FROM multiparts_parts
                     WHERE upload_id = ?1 AND part_num = ?2"
                ),
                params![upload_id, part_num],
                part_from_row,
            )
            .optional()?;
        let part = match existing {
            Some(mut part) => {
                part.size = 0;
                part.etag = None;
                part.mtime = None;
                tx.execute(
                    "UPDATE multiparts_parts
                     SET size = 0, etag = NULL, mtime = NULL WHERE id = ?1",
                    params![part.id],
                )?;
                part
            }
            None => {
                tx.execute(
                    "INSERT INTO multiparts_parts (upload_id, part_num, size, etag, mtime)
                     VALUES (?1, ?2, 0, NULL, NULL)",
                    params![upload_id, part_num],
                )?;
                DbMultipartPart {
                    id: tx.last_insert_rowid(),
                    upload_id: upload_id.to_string(),
                    part_num,
                    size: 0,
                    etag: None,
                    mtime: None,
                }
            }
        };
        tx.commit()?;
        Ok(Some(part))
    }

    /// Seal a part after its bytes were written.  Only fires on a part
    /// that is still open (NULL etag); returns whether it did.
    pub fn finish_part(
        &self,
        upload_id: &str,
        part_num: i64,
        etag: &str,
        bytes_written: i64,
    ) -> MetaResult<bool> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let changed = conn.execute(
            "UPDATE multiparts_parts SET etag = ?1, mtime = ?2, size = ?3
             WHERE upload_id = ?4 AND part_num = ?5 AND etag IS NULL",
            params![etag, self.clock.now(), bytes_written, upload_id, part_num],
        )?;
        Ok(changed == 1)
    }

    /// All parts of an upload, by part number.
    pub fn get_parts(&self, upload_id: &str) -> MetaResult<Vec<DbMultipartPart>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {PART_COLUMNS} FROM multiparts_parts
             WHERE upload_id = ?1 ORDER BY part_num"
        ))?;
        let rows = stmt.query_map(params![upload_id], part_from_row)?;
        let mut parts = Vec::new();
        for row in rows {
            parts.push(row?);
        }
        Ok(parts)
    }

    pub fn get_part(&self, upload_id: &str, part_num: i64) -> MetaResult<Option<DbMultipartPart>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let part = conn
            .query_row(
                &format!(
                    "SELECT {PART_COLUMNS} FROM multiparts_parts
                     WHERE upload_id = ?1 AND part_num = ?2"
                ),
                params![upload_id, part_num],
                part_from_row,
            )
            .optional()?;
        Ok(part)
    }

    /// Finished parts (etag set) from `marker` on, at most `max_parts`
    /// of them, plus the next marker when the listing was truncated.
    pub fn list_parts(
        &self,
        upload_id: &str,
        max_parts: u32,
        marker: i64,
    ) -> MetaResult<(Vec<DbMultipartPart>, Option<i64>)> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {PART_COLUMNS} FROM multiparts_parts
             WHERE upload_id = ?1 AND etag IS NOT NULL AND id >= ?2
             ORDER BY id
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![upload_id, marker, i64::from(max_parts) + 1],
            part_from_row,
        )?;
        let mut parts = Vec::new();
        for row in rows {
            parts.push(row?);
        }
        let next_marker = if parts.len() > max_parts as usize {
            let next = parts.pop().expect("len > max_parts implies non-empty");
            Some(next.id)
        } else {
            None
        };
        Ok((parts, next_marker))
    }

    /// INPROGRESS -> ABORTED.  Returns whether the upload was aborted.
    pub fn abort(&self, upload_id: &str) -> MetaResult<bool> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let changed = self.transition(
            &conn,
            upload_id,
            &[MultipartState::InProgress],
            MultipartState::Aborted,
        )?;
        Ok(changed == 1)
    }

    /// Abort every upload of a bucket that has not completed yet.
    /// Used by the garbage collector on tombstoned buckets.  Returns
    /// the number of uploads aborted.
    pub fn abort_multiparts_by_bucket_id(&self, bucket_id: &str) -> MetaResult<usize> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let changed = conn.execute(
            &format!(
                "UPDATE multiparts SET state = {aborted}, state_change_time = ?1
                 WHERE bucket_id = ?2 AND state = {inprogress}",
                aborted = MultipartState::Aborted as i64,
                inprogress = MultipartState::InProgress as i64,
            ),
            params![self.clock.now(), bucket_id],
        )?;
        Ok(changed)
    }

    /// INPROGRESS -> COMPLETE.  `duplicate` is set when the upload is
    /// already DONE, which a client retrying CompleteMultipartUpload
    /// treats as success.
    pub fn mark_complete(&self, upload_id: &str, duplicate: &mut bool) -> MetaResult<bool> {
        *duplicate = false;
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let tx = conn.unchecked_transaction()?;
        let state: Option<MultipartState> = tx
            .query_row(
                "SELECT state FROM multiparts WHERE upload_id = ?1",
                params![upload_id],
                |row| row.get(0),
            )
            .optional()?;
        match state {
            None => return Ok(false),
            Some(MultipartState::Done) => {
                *duplicate = true;
                return Ok(true);
            }
            Some(_) => {}
        }
        let changed = self.transition(
            &tx,
            upload_id,
            &[MultipartState::InProgress],
            MultipartState::Complete,
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    /// COMPLETE -> AGGREGATING, claiming the upload for an assembler.
    pub fn mark_aggregating(&self, upload_id: &str) -> MetaResult<bool> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let changed = self.transition(
            &conn,
            upload_id,
            &[MultipartState::Complete],
            MultipartState::Aggregating,
        )?;
        Ok(changed == 1)
    }

    /// AGGREGATING -> DONE, and only that.  Returns whether the
    /// transition happened.
    pub fn mark_done(&self, upload_id: &str) -> MetaResult<bool> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let changed = self.transition(
            &conn,
            upload_id,
            &[MultipartState::Aggregating],
            MultipartState::Done,
        )?;
        Ok(changed == 1)
    }

    pub fn remove_parts(&self, upload_id: &str) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute(
            "DELETE FROM multiparts_parts WHERE upload_id = ?1",
            params![upload_id],
        )?;
        Ok(())
    }

    /// The next batch of part rows under a tombstoned bucket,
    /// regardless of upload state.  The garbage collector removes
    /// their files before it comes back with
    /// [`remove_multiparts_by_bucket_id_transact`].
    ///
    /// [`remove_multiparts_by_bucket_id_transact`]:
    /// SqliteMultipart::remove_multiparts_by_bucket_id_transact
    pub fn get_bucket_parts(
        &self,
        bucket_id: &str,
        max_items: u64,
    ) -> MetaResult<Vec<DeletedPartItem>> {
        self.get_parts_to_remove(&bucket_filter(bucket_id), max_items)
    }

    /// One GC draining step over every upload of a tombstoned bucket.
    pub fn remove_multiparts_by_bucket_id_transact(
        &self,
        bucket_id: &str,
        items: &[DeletedPartItem],
    ) -> MetaResult<Option<()>> {
        self.remove_multiparts_transact(&bucket_filter(bucket_id), items)
    }

    /// The next batch of part rows of DONE and ABORTED uploads in live
    /// buckets, for the same two-phase reclaim.
    pub fn get_done_or_aborted_parts(&self, max_items: u64) -> MetaResult<Vec<DeletedPartItem>> {
        self.get_parts_to_remove(&done_or_aborted_filter(), max_items)
    }

    /// One GC draining step over DONE and ABORTED uploads in live
    /// buckets.
    pub fn remove_done_or_aborted_multiparts_transact(
        &self,
        items: &[DeletedPartItem],
    ) -> MetaResult<Option<()>> {
        self.remove_multiparts_transact(&done_or_aborted_filter(), items)
    }

    fn get_parts_to_remove(
        &self,
        multipart_filter: &str,
        max_items: u64,
    ) -> MetaResult<Vec<DeletedPartItem>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT m.upload_id, m.path_uuid, p.id
             FROM multiparts_parts p
             INNER JOIN multiparts m ON m.upload_id = p.upload_id
             WHERE {multipart_filter}
             ORDER BY p.id
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![max_items as i64], |row| {
            let path_uuid: String = row.get(1)?;
            Ok(DeletedPartItem {
                upload_id: row.get(0)?,
                path_uuid: uuid_from_text(&path_uuid),
                part_db_id: row.get(2)?,
            })
        })?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Shared drain: remove the reclaimed part rows, then every upload
    /// row left without parts.  When the reclaimed batch is empty the
    /// remaining part-less uploads behind the filter are removed
    /// wholesale -- that final call finishes the drain and also covers
    /// uploads that never had parts.
    fn remove_multiparts_transact(
        &self,
        multipart_filter: &str,
        items: &[DeletedPartItem],
    ) -> MetaResult<Option<()>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut retry = RetrySqlite::new(|| {
            let tx = conn.unchecked_transaction()?;
            if items.is_empty() {
                tx.execute_batch(&format!(
                    "DELETE FROM multiparts WHERE upload_id IN
                         (SELECT m.upload_id FROM multiparts m WHERE {multipart_filter})"
                ))?;
                tx.commit()?;
                return Ok(());
            }

            for item in items {
                tx.execute(
                    "DELETE FROM multiparts_parts WHERE id = ?1",
                    params![item.part_db_id],
                )?;
            }
            let touched: BTreeSet<&str> =
                items.iter().map(|item| item.upload_id.as_str()).collect();
            for upload_id in touched {
                let parts_left: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM multiparts_parts WHERE upload_id = ?1",
                    params![upload_id],
                    |row| row.get(0),
                )?;
                if parts_left == 0 {
                    tx.execute(
                        "DELETE FROM multiparts WHERE upload_id = ?1",
                        params![upload_id],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        });
        let done = retry.run()?;
        Ok(done)
    }

    fn transition(
        &self,
        conn: &Connection,
        upload_id: &str,
        from: &[MultipartState],
        to: MultipartState,
    ) -> rusqlite::Result<usize> {
        let filter = from
            .iter()
            .map(|s| (*s as i64).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "UPDATE multiparts SET state = ?1, state_change_time = ?2
                 WHERE upload_id = ?3 AND state IN ({filter})"
            ),
            params![to, self.clock.now(), upload_id],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::metadata::buckets::SqliteBuckets;
    use crate::metadata::types::{DbBucket, DbUser};
    use crate::metadata::users::SqliteUsers;
    use tempfile::TempDir;
    use uuid::Uuid;

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

    fn test_multipart(bucket_id: &str, upload_id: &str) -> DbMultipart {
        DbMultipart {
            bucket_id: bucket_id.to_string(),
            upload_id: upload_id.to_string(),
            object_name: format!("{upload_id}-object"),
            path_uuid: Uuid::new_v4(),
            ..DbMultipart::default()
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let multiparts = SqliteMultipart::new(conn);

        let mut mp = test_multipart("b1", "up1");
        mp.id = multiparts.insert(&mp).unwrap();
        assert_eq!(multiparts.get_multipart("up1").unwrap().unwrap(), mp);
        assert_eq!(multiparts.get_multipart_by_id(mp.id).unwrap().unwrap(), mp);
        assert!(multiparts.get_multipart("").unwrap().is_none());
    }

    #[test]
    fn upload_id_and_path_uuid_must_be_unique() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let multiparts = SqliteMultipart::new(conn);

        let first = test_multipart("b1", "up1");
        multiparts.insert(&first).unwrap();

        let err = multiparts.insert(&test_multipart("b1", "up1")).unwrap_err();
        assert!(err.is_constraint());

        let mut same_path = test_multipart("b1", "up2");
        same_path.path_uuid = first.path_uuid;
        let err = multiparts.insert(&same_path).unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn part_insert_requires_parent_upload() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let multiparts = SqliteMultipart::new(conn);

        assert!(multiparts
            .create_or_reset_part("missing", 1)
            .unwrap()
            .is_none());

        multiparts.insert(&test_multipart("b1", "up1")).unwrap();
        let part = multiparts
            .create_or_reset_part("up1", 1)
            .unwrap()
            .unwrap();
        assert_eq!(part.part_num, 1);
        assert!(part.etag.is_none());

        assert!(multiparts.finish_part("up1", 1, "etag-1", 123).unwrap());
        // already sealed, a second finish is refused
        assert!(!multiparts.finish_part("up1", 1, "etag-2", 456).unwrap());

        // re-uploading the part resets it in place
        let reset = multiparts
            .create_or_reset_part("up1", 1)
            .unwrap()
            .unwrap();
        assert_eq!(reset.id, part.id);
        assert_eq!(reset.size, 0);
        assert!(reset.etag.is_none());
    }

    #[test]
    fn list_parts_paginates_finished_parts() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let multiparts = SqliteMultipart::new(conn);
        multiparts.insert(&test_multipart("b1", "up1")).unwrap();

        for n in 1..=5 {
            multiparts.create_or_reset_part("up1", n).unwrap().unwrap();
            multiparts
                .finish_part("up1", n, &format!("etag-{n}"), 100)
                .unwrap();
        }
        // a sixth, unfinished part stays invisible
        multiparts.create_or_reset_part("up1", 6).unwrap().unwrap();

        let (page, next) = multiparts.list_parts("up1", 3, 0).unwrap();
        assert_eq!(page.len(), 3);
        let next = next.expect("truncated listing carries a marker");
        let (rest, none) = multiparts.list_parts("up1", 10, next).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(none.is_none());
    }

    #[test]
    fn state_machine_transitions() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let multiparts = SqliteMultipart::new(conn);
        multiparts.insert(&test_multipart("b1", "up1")).unwrap();

        // done only follows aggregating
        assert!(!multiparts.mark_done("up1").unwrap());

        let mut duplicate = false;
        assert!(multiparts.mark_complete("up1", &mut duplicate).unwrap());
        assert!(!duplicate);
        assert!(multiparts.mark_aggregating("up1").unwrap());
        assert!(multiparts.mark_done("up1").unwrap());
        assert_eq!(
            multiparts.get_multipart("up1").unwrap().unwrap().state,
            MultipartState::Done
        );

        // a retried complete on a DONE upload reports duplicate
        assert!(multiparts.mark_complete("up1", &mut duplicate).unwrap());
        assert!(duplicate);

        // aborted uploads stay aborted
        multiparts.insert(&test_multipart("b1", "up2")).unwrap();
        assert!(multiparts.abort("up2").unwrap());
        assert!(!multiparts.abort("up2").unwrap());
        assert!(!multiparts.mark_complete("up2", &mut duplicate).unwrap());
    }

    #[test]
    fn abort_by_bucket_only_touches_in_progress() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let multiparts = SqliteMultipart::new(conn);

        multiparts.insert(&test_multipart("b1", "up1")).unwrap();
        multiparts.insert(&test_multipart("b1", "up2")).unwrap();
        let mut duplicate = false;
        multiparts.mark_complete("up2", &mut duplicate).unwrap();

        assert_eq!(multiparts.abort_multiparts_by_bucket_id("b1").unwrap(), 1);
        assert_eq!(
            multiparts.get_multipart("up1").unwrap().unwrap().state,
            MultipartState::Aborted
        );
        assert_eq!(
            multiparts.get_multipart("up2").unwrap().unwrap().state,
            MultipartState::Complete
        );
    }

    #[test]
    fn drain_done_or_aborted_respects_budget() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        let multiparts = SqliteMultipart::new(conn);

        let mut done = test_multipart("b1", "done");
        done.state = MultipartState::Done;
        multiparts.insert(&done).unwrap();
        for n in 1..=3 {
            multiparts
                .conn
                .handle()
                .lock()
                .unwrap()
                .execute(
                    "INSERT INTO multiparts_parts (upload_id, part_num, size, etag, mtime)
                     VALUES ('done', ?1, 1, 'e', 0)",
                    params![n],
                )
                .unwrap();
        }
        let mut live = test_multipart("b1", "live");
        live.state = MultipartState::InProgress;
        multiparts.insert(&live).unwrap();

        // budget 2: first batch carries two parts, upload survives
        let items = multiparts.get_done_or_aborted_parts(2).unwrap();
        assert_eq!(items.len(), 2);
        multiparts
            .remove_done_or_aborted_multiparts_transact(&items)
            .unwrap()
            .unwrap();
        assert!(multiparts.get_multipart("done").unwrap().is_some());

        // second batch drains the last part and the upload row
        let items = multiparts.get_done_or_aborted_parts(2).unwrap();
        assert_eq!(items.len(), 1);
        multiparts
            .remove_done_or_aborted_multiparts_transact(&items)
            .unwrap()
            .unwrap();
        assert!(multiparts.get_multipart("done").unwrap().is_none());

        // nothing left: the empty call finishes the drain
        let items = multiparts.get_done_or_aborted_parts(2).unwrap();
        assert!(items.is_empty());
        multiparts
            .remove_done_or_aborted_multiparts_transact(&items)
            .unwrap()
            .unwrap();
        assert!(multiparts.get_multipart("live").unwrap().is_some());
    }

    #[test]
    fn drain_by_bucket_removes_all_states() {
        let dir = TempDir::new().unwrap();
        let conn = test_conn(&dir);
        seed_bucket(&conn, "b1");
        seed_bucket(&conn, "b2");
        let multiparts = SqliteMultipart::new(conn);

        multiparts.insert(&test_multipart("b1", "up1")).unwrap();
        multiparts.create_or_reset_part("up1", 1).unwrap().unwrap();
        multiparts.insert(&test_multipart("b2", "other")).unwrap();

        let items = multiparts.get_bucket_parts("b1", 100).unwrap();
        assert_eq!(items.len(), 1);
        multiparts
            .remove_multiparts_by_bucket_id_transact("b1", &items)
            .unwrap()
            .unwrap();
        let items = multiparts.get_bucket_parts("b1", 100).unwrap();
        assert!(items.is_empty());
        multiparts
            .remove_multiparts_by_bucket_id_transact("b1", &items)
            .unwrap()
            .unwrap();

        assert!(multiparts.get_multipart("up1").unwrap().is_none());
        assert!(multiparts.get_multipart("other").unwrap().is_some());
    }
}
