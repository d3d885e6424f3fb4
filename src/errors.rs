//! Error types for the metadata store and garbage collector.
//!
//! Repositories surface every non-fatal failure as a [`MetaError`] so
//! callers can tell a broken invariant (unique or foreign-key
//! violation) apart from an engine-level failure.  Critical
//! corruption-class errors never reach this enum -- the retry executor
//! terminates the process on those (see [`crate::db::retry`]).

use std::path::PathBuf;

use rusqlite::ffi;
use thiserror::Error;

/// Errors produced by the metadata layer.
#[derive(Debug, Error)]
pub enum MetaError {
    /// A uniqueness constraint was violated.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// A foreign-key constraint was violated.
    #[error("foreign key constraint violated: {constraint}")]
    ForeignKeyViolation { constraint: String },

    /// The metadata schema version is older than the oldest version we
    /// can upgrade from.
    #[error("existing metadata too far behind, unable to upgrade schema (found version {found}, minimum {min})")]
    SchemaTooFarBehind { found: i64, min: i64 },

    /// The metadata schema version is newer than this build understands.
    #[error("existing metadata too far ahead, please upgrade (found version {found}, current {current})")]
    SchemaTooFarAhead { found: i64, current: i64 },

    /// The shadow-copy compatibility check found tables that would be
    /// dropped and recreated by a schema sync.
    #[error("metadata tables no longer compatible: [{}]", tables.join(", "))]
    SchemaIncompatible { tables: Vec<String> },

    /// A schema upgrade step failed.
    #[error("error upgrading metadata from version {from}: {message}")]
    MigrationFailed { from: i64, message: String },

    /// The legacy database file could not be moved to its current name.
    #[error("failed to migrate legacy database {legacy}: {message}")]
    LegacyMigrationFailed { legacy: PathBuf, message: String },

    /// Any other database engine error, passed through.
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    /// Filesystem error outside the database file itself.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for MetaError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, ref msg) = err {
            let constraint = || {
                msg.clone()
                    .unwrap_or_else(|| "constraint failed".to_string())
            };
            match e.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return MetaError::UniqueViolation {
                        constraint: constraint(),
                    };
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    return MetaError::ForeignKeyViolation {
                        constraint: constraint(),
                    };
                }
                _ => {}
            }
        }
        MetaError::Sqlite(err)
    }
}

impl MetaError {
    /// True when the error is a referential or uniqueness violation
    /// raised by the engine, i.e. a domain error rather than an engine
    /// failure.
    pub fn is_constraint(&self) -> bool {
        matches!(
            self,
            MetaError::UniqueViolation { .. } | MetaError::ForeignKeyViolation { .. }
        )
    }
}

/// Result alias used across the metadata layer.
pub type MetaResult<T> = Result<T, MetaError>;
