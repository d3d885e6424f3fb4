//! Object repository.
//!
//! An object row is just a name within a bucket; payloads and state
//! live on its versions.  Most object creation happens inside
//! [`SqliteVersionedObjects::create_new_versioned_object_transact`],
//! which ensures the row exists atomically with the first version.
//!
//! [`SqliteVersionedObjects::create_new_versioned_object_transact`]:
//! crate::metadata::versioned_objects::SqliteVersionedObjects::create_new_versioned_object_transact

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::DbConn;
use crate::errors::MetaResult;
use crate::metadata::types::{uuid_from_text, DbObject};

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<DbObject> {
    let uuid: String = row.get(0)?;
    Ok(DbObject {
        uuid: uuid_from_text(&uuid),
        bucket_id: row.get(1)?,
        name: row.get(2)?,
    })
}

/// Repository over the `objects` table.
pub struct SqliteObjects {
    conn: Arc<DbConn>,
}

impl SqliteObjects {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self { conn }
    }

    pub fn get_object(&self, uuid: Uuid) -> MetaResult<Option<DbObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let object = conn
            .query_row(
                "SELECT uuid, bucket_id, name FROM objects WHERE uuid = ?1",
                params![uuid.to_string()],
                object_from_row,
            )
            .optional()?;
        Ok(object)
    }

    pub fn get_object_by_name(&self, bucket_id: &str, name: &str) -> MetaResult<Option<DbObject>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let object = conn
            .query_row(
                "SELECT uuid, bucket_id, name FROM objects WHERE bucket_id = ?1 AND name = ?2",
                params![bucket_id, name],
                object_from_row,
            )
            .optional()?;
        Ok(object)
    }

    pub fn get_object_ids(&self, bucket_id: &str) -> MetaResult<Vec<Uuid>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare("SELECT uuid FROM objects WHERE bucket_id = ?1")?;
        let rows = stmt.query_map(params![bucket_id], |row| {
            let uuid: String = row.get(0)?;
            Ok(uuid_from_text(&uuid))
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Upsert by uuid.  A new `(bucket_id, name)` pair must be unused;
    /// the unique index rejects a second object under the same name.
    pub fn store_object(&self, object: &DbObject) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute(
            "REPLACE INTO objects (uuid, bucket_id, name) VALUES (?1, ?2, ?3)",
            params![object.uuid.to_string(), object.bucket_id, object.name],
        )?;
        Ok(())
    }

    pub fn remove_object(&self, uuid: Uuid) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute(
            "DELETE FROM objects WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        Ok(())
    }
}
