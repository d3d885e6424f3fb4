//! Embedded-database connection management.
//!
//! One logical database, many threads.  [`DbConn`] opens the file once
//! from the process main thread (running migration and the
//! compatibility check against that privileged handle) and afterwards
//! hands every calling thread its own connection on demand.  Handles
//! are kept open for the life of the process; the pool map is only
//! ever appended to.
//!
//! A handle-per-operation design was measured to blow the WAL past
//! several hundred MB under concurrent writers, and a single shared
//! handle serializes them.  Per-thread open-forever handles plus the
//! WAL checkpoint hook keep both parallelism and a bounded WAL.

pub mod migrations;
pub mod retry;
pub mod schema;

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use rusqlite::{ffi, Connection};
use tracing::{debug, info, trace};

use crate::config::StoreConfig;
use crate::errors::MetaResult;

/// A single thread's connection.  The mutex is uncontended in normal
/// operation -- each thread locks only its own handle -- and exists to
/// make the handle shareable with the pool map.
pub type DbHandle = Arc<Mutex<Connection>>;

/// Slow-statement threshold for the profile callback.  A static
/// because rusqlite's profile hook takes a plain `fn`.
static PROFILE_SLOWLOG_MS: AtomicU64 = AtomicU64::new(u64::MAX);

/// Thresholds handed to the WAL hook; boxed per connection and leaked
/// because handles stay open until process exit.
struct WalHookCtx {
    passive_frames: c_int,
    truncate_frames: c_int,
}

/// Connection manager for the metadata database.
pub struct DbConn {
    db_path: PathBuf,
    wal_size_limit: i64,
    wal_passive_frames: i64,
    wal_truncate_frames: i64,
    wal_use_sqlite_default: bool,
    profile_enabled: bool,
    pool: RwLock<HashMap<ThreadId, DbHandle>>,
    main_thread: ThreadId,
}

impl DbConn {
    /// Open (or create) the database under `cfg.data_path`.
    ///
    /// The calling thread becomes the pool's main thread: the legacy
    /// rename, the version migration, the shadow-copy compatibility
    /// check and the schema sync all run against its handle before any
    /// other thread can observe the pool.
    pub fn open(cfg: &StoreConfig) -> MetaResult<Arc<DbConn>> {
        std::fs::create_dir_all(&cfg.data_path)?;
        migrations::migrate_legacy_file(&cfg.data_path)?;

        if cfg.sqlite_profile {
            PROFILE_SLOWLOG_MS.store(cfg.sqlite_profile_slowlog_time_ms, Ordering::Relaxed);
        }

        let conn = DbConn {
            db_path: cfg.data_path.join(schema::DB_NAME),
            wal_size_limit: cfg.wal_size_limit,
            wal_passive_frames: cfg.wal_checkpoint.passive_frames,
            wal_truncate_frames: cfg.wal_checkpoint.truncate_frames,
            wal_use_sqlite_default: cfg.wal_checkpoint.use_sqlite_default,
            profile_enabled: cfg.sqlite_profile,
            pool: RwLock::new(HashMap::new()),
            main_thread: thread::current().id(),
        };

        let main = conn.open_connection()?;
        migrations::maybe_upgrade(&main)?;
        migrations::check_compatibility(&main, &cfg.data_path)?;
        schema::sync_schema(&main, true)?;
        info!(
            target: "sfstore::db",
            path = %conn.db_path.display(),
            "metadata database ready"
        );

        conn.pool
            .write()
            .expect("pool lock poisoned")
            .insert(conn.main_thread, Arc::new(Mutex::new(main)));
        Ok(Arc::new(conn))
    }

    /// The calling thread's handle, created on first use.
    ///
    /// Creation clones the main handle's configuration (pragmas and
    /// hooks) but never re-runs migration.
    pub fn handle(&self) -> DbHandle {
        let tid = thread::current().id();
        {
            let pool = self.pool.read().expect("pool lock poisoned");
            if let Some(handle) = pool.get(&tid) {
                return Arc::clone(handle);
            }
        }

        // first call from this thread; the open is deliberately done
        // outside the write lock, other threads insert under their own
        // keys so there is nothing to race with
        let conn = self
            .open_connection()
            .expect("failed to open per-thread database handle");
        let handle: DbHandle = Arc::new(Mutex::new(conn));
        let mut pool = self.pool.write().expect("pool lock poisoned");
        Arc::clone(pool.entry(tid).or_insert(handle))
    }

    /// Number of handles the pool currently holds.
    pub fn handle_count(&self) -> usize {
        self.pool.read().expect("pool lock poisoned").len()
    }

    /// Path of the database file.
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    fn open_connection(&self) -> MetaResult<Connection> {
        let mut conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_millis(10_000))?;
        // SAFETY: the handle is valid for the lifetime of `conn` and
        // extended result codes have no callback side effects.
        unsafe {
            ffi::sqlite3_extended_result_codes(conn.handle(), 1);
        }
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = normal;
             PRAGMA temp_store = memory;
             PRAGMA case_sensitive_like = ON;
             PRAGMA mmap_size = 30000000000;
             PRAGMA foreign_keys = ON;
             PRAGMA journal_size_limit = {};",
            self.wal_size_limit
        ))?;
        if !self.wal_use_sqlite_default {
            self.install_wal_hook(&conn);
        }
        if self.profile_enabled {
            conn.profile(Some(profile_callback));
        }
        Ok(conn)
    }

    fn install_wal_hook(&self, conn: &Connection) {
        let ctx = Box::into_raw(Box::new(WalHookCtx {
            passive_frames: self.wal_passive_frames as c_int,
            truncate_frames: self.wal_truncate_frames as c_int,
        }));
        // SAFETY: ctx outlives the connection (it is intentionally
        // leaked; handles stay open until process exit) and the hook
        // only reads it.
        unsafe {
            ffi::sqlite3_wal_hook(conn.handle(), Some(wal_hook_callback), ctx as *mut c_void);
        }
    }
}

/// Commit-time WAL hook.  Below the passive threshold this does
/// nothing; past it a passive checkpoint is requested, and past the
/// truncate threshold a truncating one.  A failed checkpoint never
/// fails the writer.
unsafe extern "C" fn wal_hook_callback(
    ctx: *mut c_void,
    db: *mut ffi::sqlite3,
    db_name: *const c_char,
    frames: c_int,
) -> c_int {
    let ctx = &*(ctx as *const WalHookCtx);
    if frames <= ctx.passive_frames {
        return ffi::SQLITE_OK;
    }
    let mode = if frames > ctx.truncate_frames {
        ffi::SQLITE_CHECKPOINT_TRUNCATE
    } else {
        ffi::SQLITE_CHECKPOINT_PASSIVE
    };
    let mut total_frames: c_int = 0;
    let mut checkpointed_frames: c_int = 0;
    let rc = ffi::sqlite3_wal_checkpoint_v2(
        db,
        db_name,
        mode,
        &mut total_frames,
        &mut checkpointed_frames,
    );
    debug!(
        target: "sfstore::db",
        mode = if mode == ffi::SQLITE_CHECKPOINT_PASSIVE { "passive" } else { "truncate" },
        rc,
        total_frames,
        checkpointed_frames,
        "WAL checkpoint"
    );
    ffi::SQLITE_OK
}

fn profile_callback(sql: &str, duration: Duration) {
    let runtime_ms = duration.as_millis() as u64;
    if runtime_ms > PROFILE_SLOWLOG_MS.load(Ordering::Relaxed) {
        info!(target: "sfstore::db", "[SQLITE SLOW QUERY] {runtime_ms}ms {sql}");
    }
    trace!(target: "sfstore::db", "[SQLITE PROFILE] {runtime_ms}ms {sql}");
}
