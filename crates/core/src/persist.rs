//! Persisted file index (msgpack).
//!
//! The scan/stat records behind the change detector serialize to
//! `index.msgpack` in the settings directory. A legacy serialization from
//! older deployments is detected by name, moved aside, and reported as a
//! clean miss: the caller rescans once and the next save writes msgpack.
//! Loading never fails the engine: corruption degrades to an empty index.

use crate::changes::FileRecord;
use crate::config::{INDEX_FILE, LEGACY_INDEX_FILE};
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Bumped when the on-disk shape changes.
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileIndex {
    pub version: u32,
    /// Relative path → last indexed stat record.
    pub files: HashMap<String, FileRecord>,
    /// Seconds since epoch of the scan this index reflects.
    pub scanned_at: i64,
}

impl FileIndex {
    pub fn new(files: HashMap<String, FileRecord>, scanned_at: i64) -> Self {
        FileIndex { version: FORMAT_VERSION, files, scanned_at }
    }
}

/// Load the file index from `dir`. Missing, legacy, or corrupt data all
/// come back as an empty index; the engine rescans instead of failing.
pub fn load_index(dir: &Path) -> FileIndex {
    let path = dir.join(INDEX_FILE);
    if path.exists() {
        match std::fs::read(&path) {
            Ok(bytes) => match rmp_serde::from_slice::<FileIndex>(&bytes) {
                Ok(index) if index.version == FORMAT_VERSION => return index,
                Ok(index) => {
                    warn!(component = "persist", action = "version_mismatch", found = index.version, expected = FORMAT_VERSION);
                }
                Err(e) => {
                    warn!(component = "persist", action = "corrupt_index", error = %e, "discarding unreadable index");
                }
            },
            Err(e) => {
                warn!(component = "persist", action = "read_failed", error = %e);
            }
        }
        return FileIndex::default();
    }

    // Detection-then-rewrite for the legacy serialization: never parsed,
    // moved aside so the next save lands as msgpack.
    let legacy = dir.join(LEGACY_INDEX_FILE);
    if legacy.exists() {
        let backup = legacy.with_extension("pickle.bak");
        match std::fs::rename(&legacy, &backup) {
            Ok(()) => {
                info!(component = "persist", action = "legacy_migrated", backup = %backup.display());
            }
            Err(e) => {
                warn!(component = "persist", action = "legacy_rename_failed", error = %e);
            }
        }
    }
    FileIndex::default()
}

/// Atomic save: write a sibling temp file, then rename over the target.
pub fn save_index(dir: &Path, index: &FileIndex) -> EngineResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        EngineError::storage("persist", format!("create dir: {e}"))
            .with_context("dir", dir.display().to_string())
    })?;
    let bytes = rmp_serde::to_vec_named(index)
        .map_err(|e| EngineError::storage("persist", format!("serialize index: {e}")))?;

    let target = dir.join(INDEX_FILE);
    let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
    std::fs::write(&tmp, &bytes)
        .map_err(|e| EngineError::storage("persist", format!("write index: {e}")))?;
    std::fs::rename(&tmp, &target)
        .map_err(|e| EngineError::storage("persist", format!("rename index: {e}")))?;
    Ok(())
}
