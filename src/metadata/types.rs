//! Row types and enumerations of the metadata schema.
//!
//! Enumerations map to small-integer columns; they are tagged values,
//! not subclasses.  Decoding NULL or an out-of-range integer into one
//! of them means the schema and the code have drifted apart, which is
//! a programming error: the decoder panics with a message instead of
//! guessing.

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use uuid::Uuid;

use crate::clock::DbTime;

/// State of one object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectState {
    /// An upload may still be in flight.
    #[default]
    Open = 0,
    /// Durable and visible.
    Committed = 1,
    /// Tombstoned, waiting for the garbage collector.
    Deleted = 2,
}

/// Kind of one object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionType {
    #[default]
    Regular = 0,
    /// Tombstones the object name at a point in time; carries no
    /// payload.
    DeleteMarker = 1,
}

/// State of a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultipartState {
    #[default]
    InProgress = 0,
    Complete = 1,
    Aggregating = 2,
    Done = 3,
    Aborted = 4,
}

macro_rules! int_enum_sql {
    ($ty:ident { $($value:literal => $variant:ident),+ $(,)? }) => {
        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                match value {
                    ValueRef::Integer(i) => match i {
                        $($value => Ok($ty::$variant),)+
                        other => panic!(
                            concat!("cannot decode ", stringify!($ty), " from out-of-range value {}"),
                            other
                        ),
                    },
                    ValueRef::Null => {
                        panic!(concat!("cannot decode ", stringify!($ty), " from NULL"))
                    }
                    other => panic!(
                        concat!("cannot decode ", stringify!($ty), " from non-integer column {:?}"),
                        other
                    ),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(*self as i64))
            }
        }
    };
}

int_enum_sql!(ObjectState { 0 => Open, 1 => Committed, 2 => Deleted });
int_enum_sql!(VersionType { 0 => Regular, 1 => DeleteMarker });
int_enum_sql!(MultipartState {
    0 => InProgress,
    1 => Complete,
    2 => Aggregating,
    3 => Done,
    4 => Aborted,
});

/// One user row.  The keyed sub-structures (access keys, swift keys,
/// caps, quotas, ...) are opaque to the metadata core and stored as
/// serialized TEXT/BLOB columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbUser {
    pub user_id: String,
    pub tenant: String,
    pub ns: String,
    pub display_name: String,
    pub user_email: Option<String>,
    pub access_keys: String,
    pub swift_keys: String,
    pub sub_users: String,
    pub suspended: bool,
    pub max_buckets: i64,
    pub op_mask: i64,
    pub user_caps: String,
    pub admin: bool,
    pub system: bool,
    pub placement_name: String,
    pub placement_storage_class: String,
    pub placement_tags: String,
    pub bucket_quota: String,
    pub temp_url_keys: String,
    pub user_quota: String,
    pub user_type: i64,
    pub mfa_ids: String,
    pub assumed_role_arn: String,
    pub user_attrs: Vec<u8>,
    pub user_version: i64,
    pub user_version_tag: String,
}

/// One access-key row; many per user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbAccessKey {
    pub id: i64,
    pub access_key: String,
    pub user_id: String,
}

/// One bucket row.  `deleted` is the tombstone the garbage collector
/// acts on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbBucket {
    pub bucket_id: String,
    pub bucket_name: String,
    pub tenant: String,
    pub marker: String,
    pub owner_id: String,
    pub flags: i64,
    pub zone_group: String,
    pub quota: String,
    pub creation_time: DbTime,
    pub mtime: DbTime,
    pub placement_name: String,
    pub placement_storage_class: String,
    pub deleted: bool,
    pub bucket_attrs: Vec<u8>,
    pub object_lock: Vec<u8>,
}

/// One object row: a name within a bucket.  Payloads live on its
/// versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbObject {
    pub uuid: Uuid,
    pub bucket_id: String,
    pub name: String,
}

/// One version row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbVersionedObject {
    pub id: i64,
    pub object_id: Uuid,
    pub checksum: String,
    pub size: i64,
    pub create_time: DbTime,
    pub delete_time: DbTime,
    pub commit_time: DbTime,
    pub mtime: DbTime,
    pub object_state: ObjectState,
    pub version_id: String,
    pub etag: String,
    pub attrs: Vec<u8>,
    pub version_type: VersionType,
}

/// One multipart upload row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbMultipart {
    pub id: i64,
    pub bucket_id: String,
    pub upload_id: String,
    pub state: MultipartState,
    pub state_change_time: DbTime,
    pub object_name: String,
    pub path_uuid: Uuid,
    pub meta_str: String,
    pub owner_id: String,
    pub mtime: DbTime,
    pub attrs: Vec<u8>,
    pub placement: String,
}

/// One multipart part row.  `etag` and `mtime` stay NULL until the
/// part's bytes are fully written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbMultipartPart {
    pub id: i64,
    pub upload_id: String,
    pub part_num: i64,
    pub size: i64,
    pub etag: Option<String>,
    pub mtime: Option<DbTime>,
}

/// Lifecycle head: marker and start date per lifecycle index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbLcHead {
    pub lc_index: String,
    pub marker: String,
    pub start_date: DbTime,
}

/// Lifecycle entry: per-bucket status under one lifecycle index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbLcEntry {
    pub lc_index: String,
    pub bucket_name: String,
    pub start_time: DbTime,
    pub status: i64,
}

/// Item returned by the version-reclaiming transactions: everything
/// the garbage collector needs to remove the payload file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedVersionItem {
    pub object_id: Uuid,
    pub version_db_id: i64,
    pub version_type: VersionType,
}

/// Item returned by the multipart-reclaiming transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedPartItem {
    pub upload_id: String,
    pub path_uuid: Uuid,
    pub part_db_id: i64,
}

/// Read a uuid from a TEXT column, panicking on malformed data for the
/// same reason the enum decoders do.
pub(crate) fn uuid_from_text(text: &str) -> Uuid {
    Uuid::parse_str(text)
        .unwrap_or_else(|e| panic!("malformed uuid column value {text:?}: {e}"))
}
