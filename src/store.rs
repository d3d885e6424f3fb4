//! Store entry point: one data directory, one metadata database, one
//! garbage collector.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::StoreConfig;
use crate::db::DbConn;
use crate::errors::MetaResult;
use crate::gc::GarbageCollector;
use crate::paths::{MultipartPartPath, UuidPath};

/// The metadata and reclamation core of the object store.
///
/// Opening runs the whole startup sequence (legacy rename, migration,
/// shadow-copy compatibility check, schema sync) on the calling
/// thread.  The garbage collector is constructed but not started;
/// call [`GarbageCollector::initialize`] through [`Store::gc`] to run
/// it in the background, or drive scans directly with
/// [`GarbageCollector::process`].
pub struct Store {
    cfg: StoreConfig,
    db: Arc<DbConn>,
    gc: GarbageCollector,
}

impl Store {
    pub fn open(cfg: StoreConfig) -> MetaResult<Store> {
        let db = DbConn::open(&cfg)?;
        let gc = GarbageCollector::new(Arc::clone(&db), &cfg);
        Ok(Store { cfg, db, gc })
    }

    /// Connection manager handed to the repositories.
    pub fn db(&self) -> Arc<DbConn> {
        Arc::clone(&self.db)
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn data_path(&self) -> &Path {
        &self.cfg.data_path
    }

    /// Absolute path of a version's payload file.
    pub fn version_payload_path(&self, object_id: Uuid, version_db_id: i64) -> PathBuf {
        self.cfg
            .data_path
            .join(UuidPath::new(object_id, version_db_id).to_path())
    }

    /// Absolute path of a multipart part's payload file.
    pub fn part_payload_path(&self, path_uuid: Uuid, part_db_id: i64) -> PathBuf {
        self.cfg
            .data_path
            .join(MultipartPartPath::new(path_uuid, part_db_id).to_path())
    }
}
