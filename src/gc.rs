//! Garbage collector.
//!
//! Client traffic only ever tombstones: buckets get `deleted = true`,
//! versions go DELETED, multiparts go DONE or ABORTED.  The collector
//! turns those tombstones into freed disk space and removed rows
//! without blocking the write path.
//!
//! One scan walks the categories in order -- deleted buckets, deleted
//! versions in live buckets, finished multiparts -- draining each in
//! batches of at most `gc.max_objects_per_iteration` rows per
//! transaction.  Payload files are removed before their rows: a crash
//! in between leaves tombstone rows the next scan retries, never an
//! unreachable file.  A missing file is not an error, and no error in
//! here ever takes the process down.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::db::DbConn;
use crate::metadata::types::{DeletedPartItem, DeletedVersionItem, VersionType};
use crate::metadata::{SqliteBuckets, SqliteMultipart, SqliteVersionedObjects};
use crate::paths::{MultipartPartPath, UuidPath};

const GC_TARGET: &str = "sfstore::gc";

/// Background reclamation engine.  Owned by the store; `initialize`
/// starts the worker, `process` runs exactly one scan synchronously
/// (the scheduler tick and the test hook share it).
pub struct GarbageCollector {
    inner: Arc<GcInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct GcInner {
    conn: Arc<DbConn>,
    data_path: PathBuf,
    max_objects_per_iteration: u64,
    period: Duration,
    suspended: AtomicBool,
    down: AtomicBool,
    wakeup: Mutex<()>,
    cond: Condvar,
}

impl GarbageCollector {
    pub fn new(conn: Arc<DbConn>, cfg: &StoreConfig) -> Self {
        Self {
            inner: Arc::new(GcInner {
                conn,
                data_path: cfg.data_path.clone(),
                max_objects_per_iteration: cfg.gc.max_objects_per_iteration.max(1),
                period: Duration::from_secs(cfg.gc.processor_period_secs.max(1)),
                suspended: AtomicBool::new(false),
                down: AtomicBool::new(false),
                wakeup: Mutex::new(()),
                cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread; one scan per period.
    pub fn initialize(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("sfs_gc".to_string())
            .spawn(move || inner.worker_loop())
            .expect("failed to spawn gc worker");
        *self.worker.lock().expect("gc worker lock poisoned") = Some(handle);
        info!(target: GC_TARGET, "garbage collection worker started");
    }

    /// Pause the next scan.  A scan already underway finishes its
    /// current batch first; nothing is interrupted mid-transaction.
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::Release);
    }

    pub fn suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    /// Run exactly one scan synchronously.
    pub fn process(&self) {
        self.inner.process();
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.inner.down.store(true, Ordering::Release);
        self.inner.cond.notify_all();
        if let Some(handle) = self
            .worker
            .lock()
            .expect("gc worker lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl GcInner {
    fn worker_loop(&self) {
        loop {
            if self.down.load(Ordering::Acquire) {
                break;
            }
            if !self.suspended.load(Ordering::Acquire) {
                debug!(target: GC_TARGET, "start");
                self.process();
                debug!(target: GC_TARGET, "stop");
            }
            let guard = self.wakeup.lock().expect("gc wakeup lock poisoned");
            let _unused = self
                .cond
                .wait_timeout(guard, self.period)
                .expect("gc wakeup lock poisoned");
            if self.down.load(Ordering::Acquire) {
                break;
            }
        }
    }

    /// True when the scan should stop between batches.  Suspension is
    /// deliberately not checked here: `suspend` gates the worker's
    /// next scan, while a synchronously driven `process` always runs
    /// to completion.
    fn stopping(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    fn process(&self) {
        self.process_deleted_buckets();
        if self.stopping() {
            return;
        }
        self.process_deleted_versions();
        if self.stopping() {
            return;
        }
        self.process_done_and_aborted_multiparts();
    }

    /// Category 1: tombstoned buckets and everything under them.
    fn process_deleted_buckets(&self) {
        let buckets = SqliteBuckets::new(Arc::clone(&self.conn));
        let multiparts = SqliteMultipart::new(Arc::clone(&self.conn));
        let deleted_buckets = match buckets.get_deleted_buckets_ids() {
            Ok(ids) => ids,
            Err(e) => {
                error!(target: GC_TARGET, %e, "listing deleted buckets failed");
                return;
            }
        };
        debug!(
            target: GC_TARGET,
            count = deleted_buckets.len(),
            "deleted buckets found"
        );
        for bucket_id in deleted_buckets {
            if self.stopping() {
                return;
            }
            if let Err(e) = multiparts.abort_multiparts_by_bucket_id(&bucket_id) {
                error!(target: GC_TARGET, bucket_id, %e, "aborting bucket multiparts failed");
                continue;
            }
            if !self.drain_bucket_multiparts(&multiparts, &bucket_id) {
                continue;
            }
            self.drain_bucket_objects(&buckets, &bucket_id);
        }
    }

    /// Remove every multipart under a tombstoned bucket, parts' files
    /// first.  Returns whether the bucket's multiparts are fully gone.
    fn drain_bucket_multiparts(&self, multiparts: &SqliteMultipart, bucket_id: &str) -> bool {
        loop {
            if self.stopping() {
                return false;
            }
            let items = match multiparts.get_bucket_parts(bucket_id, self.max_objects_per_iteration)
            {
                Ok(items) => items,
                Err(e) => {
                    error!(target: GC_TARGET, bucket_id, %e, "listing bucket parts failed");
                    return false;
                }
            };
            self.delete_part_files(&items);
            match multiparts.remove_multiparts_by_bucket_id_transact(bucket_id, &items) {
                Ok(Some(())) => {
                    if items.is_empty() {
                        return true;
                    }
                }
                Ok(None) => {
                    warn!(
                        target: GC_TARGET,
                        bucket_id, "bucket multipart drain exhausted retries"
                    );
                    return false;
                }
                Err(e) => {
                    error!(target: GC_TARGET, bucket_id, %e, "bucket multipart drain failed");
                    return false;
                }
            }
        }
    }

    /// Remove every version and object under a tombstoned bucket and
    /// finally the bucket row, payload files first.
    fn drain_bucket_objects(&self, buckets: &SqliteBuckets, bucket_id: &str) {
        loop {
            if self.stopping() {
                return;
            }
            let items = match buckets.get_bucket_versions(bucket_id, self.max_objects_per_iteration)
            {
                Ok(items) => items,
                Err(e) => {
                    error!(target: GC_TARGET, bucket_id, %e, "listing bucket versions failed");
                    return;
                }
            };
            self.delete_version_files(&items);
            match buckets.delete_bucket_transact(bucket_id, &items) {
                Ok(Some(true)) => return,
                Ok(Some(false)) => {
                    if items.is_empty() {
                        // nothing left to drain and the row still has
                        // dependents; a later scan finishes the job
                        warn!(
                            target: GC_TARGET,
                            bucket_id, "bucket row still referenced after drain"
                        );
                        return;
                    }
                }
                Ok(None) => {
                    warn!(target: GC_TARGET, bucket_id, "bucket drain exhausted retries");
                    return;
                }
                Err(e) => {
                    error!(target: GC_TARGET, bucket_id, %e, "bucket drain failed");
                    return;
                }
            }
        }
    }

    /// Category 2: DELETED versions in live buckets.
    fn process_deleted_versions(&self) {
        let versions = SqliteVersionedObjects::new(Arc::clone(&self.conn));
        loop {
            if self.stopping() {
                return;
            }
            let items = match versions.get_deleted_versions(self.max_objects_per_iteration) {
                Ok(items) => items,
                Err(e) => {
                    error!(target: GC_TARGET, %e, "listing deleted versions failed");
                    return;
                }
            };
            if items.is_empty() {
                return;
            }
            self.delete_version_files(&items);
            match versions.remove_deleted_versions_transact(&items) {
                Ok(Some(())) => {}
                Ok(None) => {
                    warn!(target: GC_TARGET, "deleted version drain exhausted retries");
                    return;
                }
                Err(e) => {
                    error!(target: GC_TARGET, %e, "deleted version drain failed");
                    return;
                }
            }
        }
    }

    /// Category 3: DONE and ABORTED multiparts in live buckets.
    fn process_done_and_aborted_multiparts(&self) {
        let multiparts = SqliteMultipart::new(Arc::clone(&self.conn));
        loop {
            if self.stopping() {
                return;
            }
            let items = match multiparts.get_done_or_aborted_parts(self.max_objects_per_iteration)
            {
                Ok(items) => items,
                Err(e) => {
                    error!(target: GC_TARGET, %e, "listing finished multipart parts failed");
                    return;
                }
            };
            self.delete_part_files(&items);
            match multiparts.remove_done_or_aborted_multiparts_transact(&items) {
                Ok(Some(())) => {
                    if items.is_empty() {
                        return;
                    }
                }
                Ok(None) => {
                    warn!(target: GC_TARGET, "multipart drain exhausted retries");
                    return;
                }
                Err(e) => {
                    error!(target: GC_TARGET, %e, "multipart drain failed");
                    return;
                }
            }
        }
    }

    fn delete_version_files(&self, items: &[DeletedVersionItem]) {
        for item in items {
            // delete markers carry no payload
            if item.version_type == VersionType::DeleteMarker {
                continue;
            }
            let path = self
                .data_path
                .join(UuidPath::new(item.object_id, item.version_db_id).to_path());
            remove_payload_file(&path);
        }
    }

    fn delete_part_files(&self, items: &[DeletedPartItem]) {
        for item in items {
            let path = self
                .data_path
                .join(MultipartPartPath::new(item.path_uuid, item.part_db_id).to_path());
            remove_payload_file(&path);
        }
    }
}

/// Remove one payload file.  Already-missing files are the idempotent
/// case; anything else is logged and retried on the next scan because
/// the owning row is only removed after this returns.
fn remove_payload_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            error!(
                target: GC_TARGET,
                path = %path.display(),
                %e,
                "could not remove payload file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::types::{
        DbBucket, DbMultipart, DbUser, DbVersionedObject, MultipartState, ObjectState,
    };
    use crate::metadata::{SqliteBuckets, SqliteMultipart, SqliteUsers, SqliteVersionedObjects};
    use crate::store::Store;
    use rusqlite::params;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn open_store(dir: &TempDir, max_objects_per_iteration: u64) -> Store {
        let mut cfg = StoreConfig {
            data_path: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        cfg.gc.max_objects_per_iteration = max_objects_per_iteration;
        Store::open(cfg).unwrap()
    }

    fn seed_user(store: &Store, id: &str) {
        SqliteUsers::new(store.db())
            .store_user(&DbUser {
                user_id: id.to_string(),
                ..DbUser::default()
            })
            .unwrap();
    }

    fn seed_bucket(store: &Store, id: &str) {
        SqliteBuckets::new(store.db())
            .store_bucket(&DbBucket {
                bucket_id: id.to_string(),
                bucket_name: format!("{id}-name"),
                owner_id: "u1".to_string(),
                ..DbBucket::default()
            })
            .unwrap();
    }

    fn tombstone_bucket(store: &Store, id: &str) {
        let buckets = SqliteBuckets::new(store.db());
        let mut bucket = buckets.get_bucket(id).unwrap().unwrap();
        bucket.deleted = true;
        buckets.store_bucket(&bucket).unwrap();
    }

    fn bucket_exists(store: &Store, id: &str) -> bool {
        SqliteBuckets::new(store.db())
            .get_bucket(id)
            .unwrap()
            .is_some()
    }

    /// Create a committed version with a payload file; returns the
    /// version row id.
    fn committed_version(store: &Store, bucket_id: &str, name: &str, version_id: &str) -> i64 {
        let versions = SqliteVersionedObjects::new(store.db());
        let mut version = versions
            .create_new_versioned_object_transact(bucket_id, name, version_id)
            .unwrap()
            .unwrap();
        version.object_state = ObjectState::Committed;
        version.size = 123;
        versions.store_versioned_object(&version).unwrap();
        let path = store.version_payload_path(version.object_id, version.id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"payload").unwrap();
        version.id
    }

    fn set_version_state(store: &Store, id: i64, state: ObjectState) {
        let versions = SqliteVersionedObjects::new(store.db());
        let mut version = versions.get_versioned_object(id).unwrap().unwrap();
        version.object_state = state;
        versions.store_versioned_object(&version).unwrap();
    }

    /// Create a multipart upload in `state` with `num_parts` sealed
    /// parts, each with a payload file.
    fn multipart_with_parts(
        store: &Store,
        bucket_id: &str,
        upload_id: &str,
        state: MultipartState,
        num_parts: u32,
    ) {
        let multiparts = SqliteMultipart::new(store.db());
        let path_uuid = Uuid::new_v4();
        multiparts
            .insert(&DbMultipart {
                bucket_id: bucket_id.to_string(),
                upload_id: upload_id.to_string(),
                state,
                object_name: format!("{upload_id}-object"),
                path_uuid,
                ..DbMultipart::default()
            })
            .unwrap();
        let db = store.db();
        let handle = db.handle();
        let conn = handle.lock().unwrap();
        for part_num in 1..=num_parts {
            conn.execute(
                "INSERT INTO multiparts_parts (upload_id, part_num, size, etag, mtime)
                 VALUES (?1, ?2, 123, 'etag', 0)",
                params![upload_id, part_num],
            )
            .unwrap();
            let path = store.part_payload_path(path_uuid, conn.last_insert_rowid());
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"part").unwrap();
        }
    }

    fn multipart_exists(store: &Store, upload_id: &str) -> bool {
        SqliteMultipart::new(store.db())
            .get_multipart(upload_id)
            .unwrap()
            .is_some()
    }

    /// Payload files under the data root, ignoring the database
    /// triplet.
    fn payload_file_count(store: &Store) -> usize {
        fn visit(dir: &Path, count: &mut usize) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                let path = entry.path();
                if path.is_dir() {
                    visit(&path, count);
                } else if !entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("sfs.db")
                {
                    *count += 1;
                }
            }
        }
        let mut count = 0;
        visit(store.data_path(), &mut count);
        count
    }

    #[test]
    fn deleted_bucket_reclamation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1000);
        seed_user(&store, "u1");
        seed_bucket(&store, "b1");
        seed_bucket(&store, "b2");

        for v in ["v1", "v2", "v3"] {
            committed_version(&store, "b1", "o1", v);
        }
        let o2_version = committed_version(&store, "b2", "o2", "v1");
        committed_version(&store, "b2", "o2", "v2");
        assert_eq!(payload_file_count(&store), 5);

        // a payload that disappeared underneath us is not an error
        let versions = SqliteVersionedObjects::new(store.db());
        let o2 = versions.get_versioned_object(o2_version).unwrap().unwrap();
        std::fs::remove_file(store.version_payload_path(o2.object_id, o2.id)).unwrap();

        tombstone_bucket(&store, "b2");
        store.gc().process();
        assert_eq!(payload_file_count(&store), 3);
        assert!(!bucket_exists(&store, "b2"));
        assert!(bucket_exists(&store, "b1"));

        // idempotent: an immediate second scan removes nothing
        store.gc().process();
        assert_eq!(payload_file_count(&store), 3);
        assert!(bucket_exists(&store, "b1"));

        tombstone_bucket(&store, "b1");
        store.gc().process();
        assert_eq!(payload_file_count(&store), 0);
        assert!(!bucket_exists(&store, "b1"));
        assert!(!bucket_exists(&store, "b2"));
    }

    #[test]
    fn per_version_deletion() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1000);
        seed_user(&store, "u1");
        seed_bucket(&store, "b1");

        let v1 = committed_version(&store, "b1", "o1", "v1");
        let v2 = committed_version(&store, "b1", "o1", "v2");
        let v3 = committed_version(&store, "b1", "o1", "v3");
        assert_eq!(payload_file_count(&store), 3);

        let versions = SqliteVersionedObjects::new(store.db());
        let object_id = versions
            .get_versioned_object(v1)
            .unwrap()
            .unwrap()
            .object_id;
        let mut added = false;
        versions
            .add_delete_marker_transact(object_id, "marker-1", &mut added)
            .unwrap();
        assert!(added);

        // a delete marker alone frees nothing
        store.gc().process();
        assert_eq!(payload_file_count(&store), 3);

        set_version_state(&store, v1, ObjectState::Deleted);
        store.gc().process();
        assert_eq!(payload_file_count(&store), 2);

        set_version_state(&store, v2, ObjectState::Deleted);
        set_version_state(&store, v3, ObjectState::Deleted);
        store.gc().process();
        assert_eq!(payload_file_count(&store), 0);

        // no regular version was left, so the marker and the object
        // went away with the last scan
        assert!(versions
            .get_last_versioned_object(object_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn done_and_aborted_multiparts_with_budget_of_one() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1);
        seed_user(&store, "u1");
        seed_bucket(&store, "b1");

        multipart_with_parts(&store, "b1", "mp-inprogress", MultipartState::InProgress, 10);
        multipart_with_parts(&store, "b1", "mp-complete", MultipartState::Complete, 5);
        multipart_with_parts(&store, "b1", "mp-aggregating", MultipartState::Aggregating, 20);
        multipart_with_parts(&store, "b1", "mp-done", MultipartState::Done, 10);
        multipart_with_parts(&store, "b1", "mp-aborted", MultipartState::Aborted, 5);
        assert_eq!(payload_file_count(&store), 50);

        // one scan drains DONE and ABORTED completely despite the
        // one-row budget; in-flight uploads are untouched
        store.gc().process();
        assert_eq!(payload_file_count(&store), 35);
        assert!(!multipart_exists(&store, "mp-done"));
        assert!(!multipart_exists(&store, "mp-aborted"));
        assert!(multipart_exists(&store, "mp-inprogress"));
        assert!(multipart_exists(&store, "mp-complete"));
        assert!(multipart_exists(&store, "mp-aggregating"));

        SqliteMultipart::new(store.db())
            .mark_done("mp-aggregating")
            .unwrap();
        store.gc().process();
        assert_eq!(payload_file_count(&store), 15);
        assert!(!multipart_exists(&store, "mp-aggregating"));
        assert!(multipart_exists(&store, "mp-inprogress"));
        assert!(multipart_exists(&store, "mp-complete"));
    }

    #[test]
    fn deleted_bucket_takes_its_multiparts_along() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1);
        seed_user(&store, "u1");
        seed_bucket(&store, "b1");
        seed_bucket(&store, "b2");

        for v in ["v1", "v2", "v3"] {
            committed_version(&store, "b1", "o1", v);
        }
        committed_version(&store, "b2", "o2", "v1");
        committed_version(&store, "b2", "o2", "v2");
        multipart_with_parts(&store, "b1", "mp1", MultipartState::Complete, 4);
        multipart_with_parts(&store, "b2", "mp2", MultipartState::Complete, 2);
        assert_eq!(payload_file_count(&store), 11);

        tombstone_bucket(&store, "b2");
        store.gc().process();
        assert_eq!(payload_file_count(&store), 7);
        assert!(!bucket_exists(&store, "b2"));
        assert!(!multipart_exists(&store, "mp2"));
        assert!(multipart_exists(&store, "mp1"));

        tombstone_bucket(&store, "b1");
        store.gc().process();
        assert_eq!(payload_file_count(&store), 0);
        assert!(!bucket_exists(&store, "b1"));
        assert!(!multipart_exists(&store, "mp1"));
    }

    #[test]
    fn worker_starts_suspends_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1000);
        store.gc().initialize();
        store.gc().suspend();
        assert!(store.gc().suspended());
        store.gc().resume();
        assert!(!store.gc().suspended());
        // dropping the store joins the worker without hanging
        drop(store);
    }
}
