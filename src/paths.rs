//! Deterministic on-disk payload paths.
//!
//! Version payloads and multipart part payloads live under the data
//! root at paths derived from a UUID: the first two hex pairs become
//! directory levels so no single directory grows unboundedly.
//!
//! ```text
//! <data_root>/0c/f3/0cf3...-....../42        version 42 of object 0cf3...
//! <data_root>/9a/01/9a01...-....../17.3      part id 17, upload path 9a01...
//! ```

use std::path::PathBuf;

use uuid::Uuid;

/// Path of a version payload, derived from the owning object's uuid
/// and the version row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidPath {
    uuid: Uuid,
    version_id: i64,
}

impl UuidPath {
    pub fn new(uuid: Uuid, version_id: i64) -> Self {
        Self { uuid, version_id }
    }

    /// Relative path under the data root.
    pub fn to_path(&self) -> PathBuf {
        let hex = self.uuid.as_simple().to_string();
        let mut path = PathBuf::new();
        path.push(&hex[0..2]);
        path.push(&hex[2..4]);
        path.push(&hex);
        path.push(self.version_id.to_string());
        path
    }
}

/// Path of a multipart part payload, derived from the upload's
/// `path_uuid` and the part row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPartPath {
    path_uuid: Uuid,
    part_id: i64,
}

impl MultipartPartPath {
    pub fn new(path_uuid: Uuid, part_id: i64) -> Self {
        Self { path_uuid, part_id }
    }

    pub fn to_path(&self) -> PathBuf {
        let hex = self.path_uuid.as_simple().to_string();
        let mut path = PathBuf::new();
        path.push(&hex[0..2]);
        path.push(&hex[2..4]);
        path.push(format!("{}.{}", hex, self.part_id));
        path
    }
}
