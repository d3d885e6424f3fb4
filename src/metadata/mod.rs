//! Typed data-access layer over the metadata schema.
//!
//! Each repository borrows the calling thread's connection from
//! [`DbConn`](crate::db::DbConn), runs its statements and surfaces the
//! result; repositories are the only code that mutates metadata.
//! Every public operation whose effect spans more than one statement
//! runs in a single transaction, and the `*_transact` operations the
//! garbage collector drives additionally run under the bounded retry
//! policy.

pub mod buckets;
pub mod lifecycle;
pub mod multipart;
pub mod objects;
pub mod types;
pub mod users;
pub mod versioned_objects;

pub use buckets::SqliteBuckets;
pub use lifecycle::SqliteLifecycle;
pub use multipart::SqliteMultipart;
pub use objects::SqliteObjects;
pub use users::SqliteUsers;
pub use versioned_objects::{ListedObject, SqliteVersionedObjects};

/// Swallow constraint failures on probing deletes that rely on the
/// engine to refuse removal while child rows remain; every other error
/// propagates.  `Ok(None)` means the delete was refused.
pub(crate) fn ignore_constraint(
    result: Result<usize, rusqlite::Error>,
) -> Result<Option<usize>, rusqlite::Error> {
    match result {
        Ok(n) => Ok(Some(n)),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
