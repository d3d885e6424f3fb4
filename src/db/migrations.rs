//! Schema-version migration and the shadow-copy compatibility check.
//!
//! The file's `user_version` pragma is the schema revision.  A freshly
//! created file is stamped with [`CURRENT_VERSION`]; older files are
//! upgraded step by step, each step an idempotent DDL script.  Before
//! the declarative schema is synchronized against the real file, the
//! sync is rehearsed against a disposable backup copy so a sync that
//! would drop a table can never reach production data.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db::schema::{
    self, SyncResult, CURRENT_VERSION, DB_NAME, LEGACY_DB_NAME, MIN_VERSION,
    MULTIPARTS_PARTS_TABLE, MULTIPARTS_TABLE,
};
use crate::errors::{MetaError, MetaResult};

/// Read the schema revision from the file.
pub fn db_version(conn: &Connection) -> MetaResult<i64> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_db_version(conn: &Connection, version: i64) -> MetaResult<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// -- Upgrade steps -----------------------------------------------------------

/// v1 -> v2: introduce the multipart tables.  The parts table still
/// carries the legacy `len` column at this revision.
fn upgrade_from_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{mp}\" (
            \"id\" INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            \"bucket_id\" TEXT NOT NULL,
            \"upload_id\" TEXT NOT NULL,
            \"state\" INTEGER NOT NULL,
            \"state_change_time\" INTEGER NOT NULL,
            \"object_name\" TEXT NOT NULL,
            \"path_uuid\" TEXT NOT NULL,
            \"meta_str\" TEXT NOT NULL,
            \"owner_id\" TEXT NOT NULL,
            \"mtime\" INTEGER NOT NULL,
            \"attrs\" BLOB NOT NULL,
            UNIQUE (\"upload_id\"),
            UNIQUE (\"bucket_id\", \"upload_id\"),
            UNIQUE (\"path_uuid\"),
            FOREIGN KEY (\"bucket_id\") REFERENCES \"buckets\" (\"bucket_id\")
        );
        CREATE TABLE IF NOT EXISTS \"{parts}\" (
            \"id\" INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            \"upload_id\" TEXT NOT NULL,
            \"part_num\" INTEGER NOT NULL,
            \"len\" INTEGER NOT NULL,
            \"etag\" TEXT,
            \"mtime\" INTEGER,
            UNIQUE (\"upload_id\", \"part_num\"),
            FOREIGN KEY (\"upload_id\") REFERENCES \"{mp}\" (\"upload_id\")
        );",
        mp = MULTIPARTS_TABLE,
        parts = MULTIPARTS_PARTS_TABLE,
    ))
}

/// v2 -> v3: the parts length column becomes `size`.
fn upgrade_from_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    if !has_column(conn, MULTIPARTS_PARTS_TABLE, "len")? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE \"{MULTIPARTS_PARTS_TABLE}\" RENAME COLUMN \"len\" TO \"size\""
    ))
}

/// v3 -> v4: multiparts gain a placement column.
fn upgrade_from_v3(conn: &Connection) -> Result<(), rusqlite::Error> {
    if has_column(conn, MULTIPARTS_TABLE, "placement")? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE \"{MULTIPARTS_TABLE}\" ADD COLUMN \"placement\" TEXT NOT NULL DEFAULT ''"
    ))
}

/// Inspect `user_version` and bring the file to [`CURRENT_VERSION`].
///
/// A version of 0 means the file was just created and is simply
/// stamped.  Versions between [`MIN_VERSION`] and [`CURRENT_VERSION`]
/// are upgraded one step at a time, bumping `user_version` after each
/// step so a crash mid-upgrade resumes where it left off.  Anything
/// outside that range is fatal.
pub fn maybe_upgrade(conn: &Connection) -> MetaResult<()> {
    let version = db_version(conn)?;
    debug!(target: "sfstore::db", version, "db user version");

    if version == 0 {
        set_db_version(conn, CURRENT_VERSION)?;
        return Ok(());
    }
    if version > CURRENT_VERSION {
        return Err(MetaError::SchemaTooFarAhead {
            found: version,
            current: CURRENT_VERSION,
        });
    }
    if version < MIN_VERSION {
        return Err(MetaError::SchemaTooFarBehind {
            found: version,
            min: MIN_VERSION,
        });
    }

    let mut current = version;
    while current < CURRENT_VERSION {
        let step = match current {
            1 => upgrade_from_v1(conn),
            2 => upgrade_from_v2(conn),
            3 => upgrade_from_v3(conn),
            _ => Ok(()),
        };
        if let Err(e) = step {
            return Err(MetaError::MigrationFailed {
                from: current,
                message: e.to_string(),
            });
        }
        info!(
            target: "sfstore::db",
            "upgraded metadata from version {} to version {}",
            current,
            current + 1
        );
        current += 1;
        set_db_version(conn, current)?;
    }
    Ok(())
}

// -- Shadow-copy compatibility check -----------------------------------------

fn temporary_db_path(data_path: &Path) -> PathBuf {
    data_path.join(format!("{DB_NAME}_tmp"))
}

fn backup_into(src: &Connection, dst_path: &Path) -> MetaResult<()> {
    let mut dst = Connection::open(dst_path)?;
    let backup = Backup::new(src, &mut dst)?;
    backup.run_to_completion(128, Duration::from_millis(0), None)?;
    Ok(())
}

/// Rehearse the schema sync against a backup copy of the live file.
///
/// The copy lands at `<data_path>/sfs.db_tmp`, is synchronized for
/// real, and the per-table results are inspected: any table that would
/// be dropped and recreated -- or any error at all -- fails startup
/// with the offending tables named.  The temporary file is removed on
/// every exit path.
pub fn check_compatibility(main: &Connection, data_path: &Path) -> MetaResult<()> {
    let tmp_path = temporary_db_path(data_path);
    let result = (|| {
        backup_into(main, &tmp_path)?;
        let tmp = Connection::open(&tmp_path)?;
        let results = schema::sync_schema(&tmp, true)?;
        let incompatible: Vec<String> = results
            .into_iter()
            .filter(|(_, r)| *r == SyncResult::DroppedAndRecreated)
            .map(|(table, _)| table)
            .collect();
        if !incompatible.is_empty() {
            return Err(MetaError::SchemaIncompatible {
                tables: incompatible,
            });
        }
        Ok(())
    })();
    for suffix in ["", "-wal", "-shm"] {
        let mut p = tmp_path.clone().into_os_string();
        p.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(p));
    }
    result
}

// -- Legacy file rename ------------------------------------------------------

/// Move a legacy-named database to the current name.
///
/// Runs before the main handle opens: when `s3gw.db` exists and
/// `sfs.db` does not, the legacy file is copied with the online backup
/// API and the legacy main/WAL/shm triplet is removed.  Failure is
/// fatal -- continuing would silently start from an empty store.
pub fn migrate_legacy_file(data_path: &Path) -> MetaResult<()> {
    let legacy = data_path.join(LEGACY_DB_NAME);
    let current = data_path.join(DB_NAME);
    if !legacy.exists() || current.exists() {
        return Ok(());
    }
    info!(
        target: "sfstore::db",
        legacy = %legacy.display(),
        current = %current.display(),
        "migrating legacy database file"
    );
    let copy = || -> MetaResult<()> {
        let src = Connection::open(&legacy)?;
        backup_into(&src, &current)?;
        Ok(())
    };
    if let Err(e) = copy() {
        return Err(MetaError::LegacyMigrationFailed {
            legacy,
            message: e.to_string(),
        });
    }
    for suffix in ["", "-wal", "-shm"] {
        let mut p = legacy.clone().into_os_string();
        p.push(suffix);
        let p = PathBuf::from(p);
        if p.exists() {
            if let Err(e) = std::fs::remove_file(&p) {
                warn!(
                    target: "sfstore::db",
                    path = %p.display(),
                    %e,
                    "could not remove legacy database file"
                );
            }
        }
    }
    Ok(())
}
