//! Declarative metadata schema.
//!
//! The table, index, uniqueness and foreign-key declarations below are
//! the single source of truth for the on-disk schema: initial creation,
//! the shadow-copy compatibility check and the startup sync all derive
//! from them.  The shape is pinned by [`CURRENT_VERSION`]; anything
//! older than [`MIN_VERSION`] cannot be upgraded.

use rusqlite::Connection;
use tracing::debug;

use crate::errors::MetaResult;

/// Current schema version, stored in the file's `user_version` pragma.
pub const CURRENT_VERSION: i64 = 4;
/// Oldest schema version the migrator can upgrade from.
pub const MIN_VERSION: i64 = 1;

/// Name of the database file under the data root.
pub const DB_NAME: &str = "sfs.db";
/// Legacy database name honored (and migrated away from) at startup.
pub const LEGACY_DB_NAME: &str = "s3gw.db";

pub const USERS_TABLE: &str = "users";
pub const ACCESS_KEYS_TABLE: &str = "access_keys";
pub const BUCKETS_TABLE: &str = "buckets";
pub const OBJECTS_TABLE: &str = "objects";
pub const VERSIONED_OBJECTS_TABLE: &str = "versioned_objects";
pub const MULTIPARTS_TABLE: &str = "multiparts";
pub const MULTIPARTS_PARTS_TABLE: &str = "multiparts_parts";
pub const LC_HEAD_TABLE: &str = "lc_head";
pub const LC_ENTRIES_TABLE: &str = "lc_entries";

/// Storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    Integer,
    Text,
    Blob,
}

impl ColType {
    fn sql(self) -> &'static str {
        match self {
            ColType::Integer => "INTEGER",
            ColType::Text => "TEXT",
            ColType::Blob => "BLOB",
        }
    }
}

/// One column declaration.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColType,
    pub not_null: bool,
    pub default: Option<&'static str>,
    pub pk: bool,
    pub autoincrement: bool,
}

/// Foreign-key declaration: `column` references `ref_table(ref_column)`.
#[derive(Debug, Clone, Copy)]
pub struct ForeignKeyDef {
    pub column: &'static str,
    pub ref_table: &'static str,
    pub ref_column: &'static str,
}

/// One table declaration.
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    /// Table-level UNIQUE constraints.
    pub uniques: &'static [&'static [&'static str]],
    pub foreign_keys: &'static [ForeignKeyDef],
    /// Composite primary key; empty when a single column carries `pk`.
    pub compound_pk: &'static [&'static str],
}

/// Secondary index declaration.
#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

const fn col(name: &'static str, ty: ColType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        not_null: true,
        default: None,
        pk: false,
        autoincrement: false,
    }
}

const fn col_null(name: &'static str, ty: ColType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        not_null: false,
        default: None,
        pk: false,
        autoincrement: false,
    }
}

const fn col_default(name: &'static str, ty: ColType, default: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        not_null: true,
        default: Some(default),
        pk: false,
        autoincrement: false,
    }
}

const fn pk_text(name: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        ty: ColType::Text,
        not_null: true,
        default: None,
        pk: true,
        autoincrement: false,
    }
}

const fn pk_auto(name: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        ty: ColType::Integer,
        not_null: true,
        default: None,
        pk: true,
        autoincrement: true,
    }
}

const USERS_COLUMNS: &[ColumnDef] = &[
    pk_text("user_id"),
    col("tenant", ColType::Text),
    col("ns", ColType::Text),
    col("display_name", ColType::Text),
    col_null("user_email", ColType::Text),
    col("access_keys", ColType::Text),
    col("swift_keys", ColType::Text),
    col("sub_users", ColType::Text),
    col("suspended", ColType::Integer),
    col("max_buckets", ColType::Integer),
    col("op_mask", ColType::Integer),
    col("user_caps", ColType::Text),
    col("admin", ColType::Integer),
    col("system", ColType::Integer),
    col("placement_name", ColType::Text),
    col("placement_storage_class", ColType::Text),
    col("placement_tags", ColType::Text),
    col("bucket_quota", ColType::Text),
    col("temp_url_keys", ColType::Text),
    col("user_quota", ColType::Text),
    col("type", ColType::Integer),
    col("mfa_ids", ColType::Text),
    col("assumed_role_arn", ColType::Text),
    col("user_attrs", ColType::Blob),
    col("user_version", ColType::Integer),
    col("user_version_tag", ColType::Text),
];

const ACCESS_KEYS_COLUMNS: &[ColumnDef] = &[
    pk_auto("id"),
    col("access_key", ColType::Text),
    col("user_id", ColType::Text),
];

const BUCKETS_COLUMNS: &[ColumnDef] = &[
    pk_text("bucket_id"),
    col("bucket_name", ColType::Text),
    col("tenant", ColType::Text),
    col("marker", ColType::Text),
    col("owner_id", ColType::Text),
    col("flags", ColType::Integer),
    col("zone_group", ColType::Text),
    col("quota", ColType::Text),
    col("creation_time", ColType::Integer),
    col("mtime", ColType::Integer),
    col("placement_name", ColType::Text),
    col("placement_storage_class", ColType::Text),
    col("deleted", ColType::Integer),
    col("bucket_attrs", ColType::Blob),
    col("object_lock", ColType::Blob),
];

const OBJECTS_COLUMNS: &[ColumnDef] = &[
    pk_text("uuid"),
    col("bucket_id", ColType::Text),
    col("name", ColType::Text),
];

const VERSIONED_OBJECTS_COLUMNS: &[ColumnDef] = &[
    pk_auto("id"),
    col("object_id", ColType::Text),
    col("checksum", ColType::Text),
    col("size", ColType::Integer),
    col("create_time", ColType::Integer),
    col("delete_time", ColType::Integer),
    col("commit_time", ColType::Integer),
    col("mtime", ColType::Integer),
    col("object_state", ColType::Integer),
    col("version_id", ColType::Text),
    col("etag", ColType::Text),
    col("attrs", ColType::Blob),
    col("version_type", ColType::Integer),
];

const MULTIPARTS_COLUMNS: &[ColumnDef] = &[
    pk_auto("id"),
    col("bucket_id", ColType::Text),
    col("upload_id", ColType::Text),
    col("state", ColType::Integer),
    col("state_change_time", ColType::Integer),
    col("object_name", ColType::Text),
    col("path_uuid", ColType::Text),
    col("meta_str", ColType::Text),
    col("owner_id", ColType::Text),
    col("mtime", ColType::Integer),
    col("attrs", ColType::Blob),
    col_default("placement", ColType::Text, "''"),
];

const MULTIPARTS_PARTS_COLUMNS: &[ColumnDef] = &[
    pk_auto("id"),
    col("upload_id", ColType::Text),
    col("part_num", ColType::Integer),
    col("size", ColType::Integer),
    col_null("etag", ColType::Text),
    col_null("mtime", ColType::Integer),
];

const LC_HEAD_COLUMNS: &[ColumnDef] = &[
    pk_text("lc_index"),
    col("marker", ColType::Text),
    col("start_date", ColType::Integer),
];

const LC_ENTRIES_COLUMNS: &[ColumnDef] = &[
    col("lc_index", ColType::Text),
    col("bucket_name", ColType::Text),
    col("start_time", ColType::Integer),
    col("status", ColType::Integer),
];

/// All tables, dependency order (referenced tables first).
pub const TABLES: &[TableDef] = &[
    TableDef {
        name: USERS_TABLE,
        columns: USERS_COLUMNS,
        uniques: &[],
        foreign_keys: &[],
        compound_pk: &[],
    },
    TableDef {
        name: ACCESS_KEYS_TABLE,
        columns: ACCESS_KEYS_COLUMNS,
        uniques: &[],
        foreign_keys: &[ForeignKeyDef {
            column: "user_id",
            ref_table: USERS_TABLE,
            ref_column: "user_id",
        }],
        compound_pk: &[],
    },
    TableDef {
        name: BUCKETS_TABLE,
        columns: BUCKETS_COLUMNS,
        uniques: &[],
        foreign_keys: &[ForeignKeyDef {
            column: "owner_id",
            ref_table: USERS_TABLE,
            ref_column: "user_id",
        }],
        compound_pk: &[],
    },
    TableDef {
        name: OBJECTS_TABLE,
        columns: OBJECTS_COLUMNS,
        uniques: &[],
        foreign_keys: &[ForeignKeyDef {
            column: "bucket_id",
            ref_table: BUCKETS_TABLE,
            ref_column: "bucket_id",
        }],
        compound_pk: &[],
    },
    TableDef {
        name: VERSIONED_OBJECTS_TABLE,
        columns: VERSIONED_OBJECTS_COLUMNS,
        uniques: &[],
        foreign_keys: &[ForeignKeyDef {
            column: "object_id",
            ref_table: OBJECTS_TABLE,
            ref_column: "uuid",
        }],
        compound_pk: &[],
    },
    TableDef {
        name: MULTIPARTS_TABLE,
        columns: MULTIPARTS_COLUMNS,
        uniques: &[
            &["upload_id"],
            &["bucket_id", "upload_id"],
            &["path_uuid"],
        ],
        foreign_keys: &[ForeignKeyDef {
            column: "bucket_id",
            ref_table: BUCKETS_TABLE,
            ref_column: "bucket_id",
        }],
        compound_pk: &[],
    },
    TableDef {
        name: MULTIPARTS_PARTS_TABLE,
        columns: MULTIPARTS_PARTS_COLUMNS,
        uniques: &[&["upload_id", "part_num"]],
        foreign_keys: &[ForeignKeyDef {
            column: "upload_id",
            ref_table: MULTIPARTS_TABLE,
            ref_column: "upload_id",
        }],
        compound_pk: &[],
    },
    TableDef {
        name: LC_HEAD_TABLE,
        columns: LC_HEAD_COLUMNS,
        uniques: &[],
        foreign_keys: &[],
        compound_pk: &[],
    },
    TableDef {
        name: LC_ENTRIES_TABLE,
        columns: LC_ENTRIES_COLUMNS,
        uniques: &[],
        foreign_keys: &[],
        compound_pk: &["lc_index", "bucket_name"],
    },
];

/// Secondary indexes.
pub const INDEXES: &[IndexDef] = &[
    IndexDef {
        name: "versioned_object_objid_vid_unique",
        table: VERSIONED_OBJECTS_TABLE,
        columns: &["object_id", "version_id"],
        unique: true,
    },
    IndexDef {
        name: "object_bucketid_name",
        table: OBJECTS_TABLE,
        columns: &["bucket_id", "name"],
        unique: true,
    },
    IndexDef {
        name: "bucket_ownerid_idx",
        table: BUCKETS_TABLE,
        columns: &["owner_id"],
        unique: false,
    },
    IndexDef {
        name: "bucket_name_idx",
        table: BUCKETS_TABLE,
        columns: &["bucket_name"],
        unique: false,
    },
    IndexDef {
        name: "objects_bucketid_idx",
        table: OBJECTS_TABLE,
        columns: &["bucket_id"],
        unique: false,
    },
    IndexDef {
        name: "vobjs_versionid_idx",
        table: VERSIONED_OBJECTS_TABLE,
        columns: &["version_id"],
        unique: false,
    },
    IndexDef {
        name: "vobjs_object_id_idx",
        table: VERSIONED_OBJECTS_TABLE,
        columns: &["object_id"],
        unique: false,
    },
];

impl TableDef {
    /// Render the `CREATE TABLE` statement for this declaration.
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for c in self.columns {
            let mut s = format!("\"{}\" {}", c.name, c.ty.sql());
            if c.pk && self.compound_pk.is_empty() {
                s.push_str(" PRIMARY KEY");
                if c.autoincrement {
                    s.push_str(" AUTOINCREMENT");
                }
            }
            if c.not_null {
                s.push_str(" NOT NULL");
            }
            if let Some(d) = c.default {
                s.push_str(" DEFAULT ");
                s.push_str(d);
            }
            parts.push(s);
        }
        if !self.compound_pk.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", quoted_list(self.compound_pk)));
        }
        for u in self.uniques {
            parts.push(format!("UNIQUE ({})", quoted_list(u)));
        }
        for fk in self.foreign_keys {
            parts.push(format!(
                "FOREIGN KEY (\"{}\") REFERENCES \"{}\" (\"{}\")",
                fk.column, fk.ref_table, fk.ref_column
            ));
        }
        format!("CREATE TABLE \"{}\" ({})", self.name, parts.join(", "))
    }
}

impl IndexDef {
    pub fn create_sql(&self) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            quoted_list(self.columns)
        )
    }
}

fn quoted_list(cols: &[&str]) -> String {
    cols.iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of synchronizing one declared table against the live file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    AlreadyInSync,
    NewTableCreated,
    ColumnsAdded(Vec<String>),
    /// The live table cannot be reconciled without dropping it.  The
    /// sync never performs the drop; callers must treat this as a
    /// compatibility failure.
    DroppedAndRecreated,
}

/// Shape of one live column as reported by `PRAGMA table_info`.
#[derive(Debug)]
struct LiveColumn {
    ty: String,
    not_null: bool,
    pk: bool,
}

fn live_columns(
    conn: &Connection,
    table: &str,
) -> MetaResult<Vec<(String, LiveColumn)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let ty: String = row.get(2)?;
        let not_null: i64 = row.get(3)?;
        let pk: i64 = row.get(5)?;
        Ok((
            name,
            LiveColumn {
                ty: ty.to_ascii_uppercase(),
                not_null: not_null != 0,
                pk: pk != 0,
            },
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn table_exists(conn: &Connection, table: &str) -> MetaResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn sync_table(conn: &Connection, table: &TableDef, apply: bool) -> MetaResult<SyncResult> {
    if !table_exists(conn, table.name)? {
        if apply {
            conn.execute_batch(&table.create_sql())?;
        }
        return Ok(SyncResult::NewTableCreated);
    }

    let live = live_columns(conn, table.name)?;

    // a live column the declaration does not know about, or a column
    // whose shape changed, forces a drop-and-recreate
    for (name, live_col) in &live {
        match table.columns.iter().find(|c| c.name == name) {
            None => return Ok(SyncResult::DroppedAndRecreated),
            Some(decl) => {
                let decl_pk = decl.pk || table.compound_pk.contains(&decl.name);
                if live_col.ty != decl.ty.sql()
                    || live_col.pk != decl_pk
                    || live_col.not_null != decl.not_null
                {
                    return Ok(SyncResult::DroppedAndRecreated);
                }
            }
        }
    }

    // declared columns missing from the live table can be added in
    // place when ALTER TABLE supports them
    let mut added = Vec::new();
    for decl in table.columns {
        if live.iter().any(|(name, _)| name == decl.name) {
            continue;
        }
        let addable = !decl.pk && (!decl.not_null || decl.default.is_some());
        if !addable {
            return Ok(SyncResult::DroppedAndRecreated);
        }
        if apply {
            let mut sql = format!(
                "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
                table.name,
                decl.name,
                decl.ty.sql()
            );
            if decl.not_null {
                sql.push_str(" NOT NULL");
            }
            if let Some(d) = decl.default {
                sql.push_str(" DEFAULT ");
                sql.push_str(d);
            }
            conn.execute_batch(&sql)?;
        }
        added.push(decl.name.to_string());
    }

    if added.is_empty() {
        Ok(SyncResult::AlreadyInSync)
    } else {
        Ok(SyncResult::ColumnsAdded(added))
    }
}

/// Synchronize the declared schema against `conn`.
///
/// With `apply` set, missing tables and columns are created; indexes
/// are ensured.  With `apply` unset this is a dry run reporting what a
/// real sync would do.  A [`SyncResult::DroppedAndRecreated`] outcome
/// is only ever reported, never executed.
pub fn sync_schema(conn: &Connection, apply: bool) -> MetaResult<Vec<(String, SyncResult)>> {
    let mut results = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        let result = sync_table(conn, table, apply)?;
        debug!(target: "sfstore::db", table = table.name, ?result, "schema sync");
        results.push((table.name.to_string(), result));
    }
    if apply {
        for index in INDEXES {
            conn.execute_batch(&index.create_sql())?;
        }
    }
    Ok(results)
}
