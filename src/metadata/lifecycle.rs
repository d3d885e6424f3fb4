//! Lifecycle bookkeeping repository.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};

use crate::db::DbConn;
use crate::errors::MetaResult;
use crate::metadata::types::{DbLcEntry, DbLcHead};

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<DbLcEntry> {
    Ok(DbLcEntry {
        lc_index: row.get(0)?,
        bucket_name: row.get(1)?,
        start_time: row.get(2)?,
        status: row.get(3)?,
    })
}

/// Repository over the `lc_head` and `lc_entries` tables.
pub struct SqliteLifecycle {
    conn: Arc<DbConn>,
}

impl SqliteLifecycle {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self { conn }
    }

    /// The head for `lc_index`.  Before the first lifecycle run there
    /// is none yet; an empty head is created and returned.
    pub fn get_head(&self, lc_index: &str) -> MetaResult<DbLcHead> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let head = conn
            .query_row(
                "SELECT lc_index, marker, start_date FROM lc_head WHERE lc_index = ?1",
                params![lc_index],
                |row| {
                    Ok(DbLcHead {
                        lc_index: row.get(0)?,
                        marker: row.get(1)?,
                        start_date: row.get(2)?,
                    })
                },
            )
            .optional()?;
        match head {
            Some(head) => Ok(head),
            None => {
                let head = DbLcHead {
                    lc_index: lc_index.to_string(),
                    marker: String::new(),
                    start_date: 0,
                };
                conn.execute(
                    "REPLACE INTO lc_head (lc_index, marker, start_date) VALUES (?1, ?2, ?3)",
                    params![head.lc_index, head.marker, head.start_date],
                )?;
                Ok(head)
            }
        }
    }

    pub fn store_head(&self, head: &DbLcHead) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute(
            "REPLACE INTO lc_head (lc_index, marker, start_date) VALUES (?1, ?2, ?3)",
            params![head.lc_index, head.marker, head.start_date],
        )?;
        Ok(())
    }

    pub fn remove_head(&self, lc_index: &str) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute("DELETE FROM lc_head WHERE lc_index = ?1", params![lc_index])?;
        Ok(())
    }

    pub fn get_entry(&self, lc_index: &str, bucket_name: &str) -> MetaResult<Option<DbLcEntry>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let entry = conn
            .query_row(
                "SELECT lc_index, bucket_name, start_time, status FROM lc_entries
                 WHERE lc_index = ?1 AND bucket_name = ?2",
                params![lc_index, bucket_name],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// The next entry after `marker`, in bucket-name order.
    pub fn get_next_entry(
        &self,
        lc_index: &str,
        marker: &str,
    ) -> MetaResult<Option<DbLcEntry>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let entry = conn
            .query_row(
                "SELECT lc_index, bucket_name, start_time, status FROM lc_entries
                 WHERE lc_index = ?1 AND bucket_name > ?2
                 ORDER BY bucket_name
                 LIMIT 1",
                params![lc_index, marker],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn store_entry(&self, entry: &DbLcEntry) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute(
            "REPLACE INTO lc_entries (lc_index, bucket_name, start_time, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.lc_index,
                entry.bucket_name,
                entry.start_time,
                entry.status
            ],
        )?;
        Ok(())
    }

    pub fn remove_entry(&self, lc_index: &str, bucket_name: &str) -> MetaResult<()> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        conn.execute(
            "DELETE FROM lc_entries WHERE lc_index = ?1 AND bucket_name = ?2",
            params![lc_index, bucket_name],
        )?;
        Ok(())
    }

    pub fn list_entries(
        &self,
        lc_index: &str,
        marker: &str,
        max_entries: u32,
    ) -> MetaResult<Vec<DbLcEntry>> {
        let handle = self.conn.handle();
        let conn = handle.lock().expect("connection mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT lc_index, bucket_name, start_time, status FROM lc_entries
             WHERE lc_index = ?1 AND bucket_name > ?2
             ORDER BY bucket_name
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![lc_index, marker, max_entries], entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}
