//! Incremental change detector.
//!
//! Compares the current scan against persisted per-file metadata and
//! classifies every path as added, modified, deleted, or unchanged. The
//! stat fast-path (size + mtime) avoids hashing entirely; hash verification
//! is opt-in for callers that need certainty over throughput.

use crate::stat_cache::StatCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Persisted metadata for one indexed file, keyed by relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    /// Seconds since epoch.
    pub mtime: i64,
    pub hash: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct ChangeDetector {
    base_path: PathBuf,
    stat_cache: Arc<StatCache>,
    /// Hash-confirm modifications even when stat matches. Off by default
    /// for throughput.
    verify_hash: bool,
    metadata: Mutex<HashMap<String, FileRecord>>,
}

impl ChangeDetector {
    pub fn new(base_path: &Path, stat_cache: Arc<StatCache>, verify_hash: bool) -> Self {
        ChangeDetector {
            base_path: base_path.to_path_buf(),
            stat_cache,
            verify_hash,
            metadata: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the in-memory metadata map, e.g. from the persisted store.
    pub fn load(&self, records: HashMap<String, FileRecord>) {
        *self.metadata.lock().unwrap() = records;
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self) -> HashMap<String, FileRecord> {
        self.metadata.lock().unwrap().clone()
    }

    pub fn tracked_files(&self) -> usize {
        self.metadata.lock().unwrap().len()
    }

    /// Classify the current relative paths against stored metadata.
    pub fn detect(&self, current: &[String]) -> ChangeSet {
        let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
        let stored = self.snapshot();

        let mut set = ChangeSet::default();
        for path in stored.keys() {
            if !current_set.contains(path.as_str()) {
                set.deleted.push(path.clone());
            }
        }

        for path in current {
            match stored.get(path) {
                None => set.added.push(path.clone()),
                Some(record) => {
                    if self.is_modified(path, record) {
                        set.modified.push(path.clone());
                    } else {
                        set.unchanged.push(path.clone());
                    }
                }
            }
        }

        set.deleted.sort();
        debug!(
            component = "changes",
            action = "detect",
            added = set.added.len(),
            modified = set.modified.len(),
            deleted = set.deleted.len(),
            unchanged = set.unchanged.len()
        );
        set
    }

    fn is_modified(&self, rel_path: &str, record: &FileRecord) -> bool {
        let full = self.base_path.join(rel_path);
        let full_str = full.to_string_lossy();
        let Some(stat) = self.stat_cache.get_stat(&full_str, false) else {
            // Cannot observe the file; assume changed.
            return true;
        };
        if stat.size != record.size || stat.mtime_secs() != record.mtime {
            return true;
        }
        if self.verify_hash {
            if let Some(stored_hash) = &record.hash {
                let current = self.stat_cache.get_hash(&full_str, Some(&stat));
                return current.as_deref() != Some(stored_hash.as_str());
            }
        }
        false
    }

    /// Record the newly observed `{size, mtime, hash}` for a path after its
    /// index operation completed. One lock acquisition, so readers never see a
    /// half-updated record.
    pub fn update_after_index(&self, rel_path: &str, hash: Option<String>) {
        let full = self.base_path.join(rel_path);
        let full_str = full.to_string_lossy();
        let Some(stat) = self.stat_cache.get_stat(&full_str, true) else {
            return;
        };
        let hash = hash.or_else(|| self.stat_cache.get_hash(&full_str, Some(&stat)));
        let record = FileRecord { size: stat.size, mtime: stat.mtime_secs(), hash };
        self.metadata.lock().unwrap().insert(rel_path.to_string(), record);
    }

    /// Drop metadata for a deleted file.
    pub fn remove(&self, rel_path: &str) {
        self.metadata.lock().unwrap().remove(rel_path);
        self.stat_cache.invalidate(&self.base_path.join(rel_path).to_string_lossy());
    }

    /// Carry metadata across a rename, refreshing stat from the new location.
    pub fn rename(&self, old_rel: &str, new_rel: &str) {
        let carried = self.metadata.lock().unwrap().remove(old_rel);
        if carried.is_some() {
            self.update_after_index(new_rel, carried.and_then(|r| r.hash));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn detector(dir: &Path) -> ChangeDetector {
        ChangeDetector::new(dir, Arc::new(StatCache::with_defaults()), false)
    }

    #[test]
    fn fresh_files_are_added() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let d = detector(dir.path());
        let set = d.detect(&["a.txt".to_string()]);
        assert_eq!(set.added, vec!["a.txt"]);
        assert!(set.modified.is_empty() && set.deleted.is_empty() && set.unchanged.is_empty());
    }

    #[test]
    fn unchanged_and_modified_split_on_stat() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::write(dir.path().join("b.txt"), "world").unwrap();
        let d = detector(dir.path());
        d.update_after_index("a.txt", None);
        d.update_after_index("b.txt", None);

        fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        let set = d.detect(&["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(set.modified, vec!["a.txt"]);
        assert_eq!(set.unchanged, vec!["b.txt"]);
        assert!(set.added.is_empty() && set.deleted.is_empty());
    }

    #[test]
    fn missing_from_scan_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let d = detector(dir.path());
        d.update_after_index("a.txt", None);
        let set = d.detect(&[]);
        assert_eq!(set.deleted, vec!["a.txt"]);
    }

    #[test]
    fn remove_clears_tracking() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let d = detector(dir.path());
        d.update_after_index("a.txt", None);
        assert_eq!(d.tracked_files(), 1);
        d.remove("a.txt");
        assert_eq!(d.tracked_files(), 0);
    }

    #[test]
    fn rename_carries_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let d = detector(dir.path());
        d.update_after_index("a.txt", None);
        fs::rename(dir.path().join("a.txt"), dir.path().join("z.txt")).unwrap();
        d.rename("a.txt", "z.txt");
        let snap = d.snapshot();
        assert!(!snap.contains_key("a.txt"));
        assert!(snap.contains_key("z.txt"));
        // Unchanged after rename bookkeeping.
        let set = d.detect(&["z.txt".to_string()]);
        assert_eq!(set.unchanged, vec!["z.txt"]);
    }

    #[test]
    fn verify_hash_catches_mtime_preserving_edit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "hello").unwrap();
        let cache = Arc::new(StatCache::with_defaults());
        let d = ChangeDetector::new(dir.path(), Arc::clone(&cache), true);
        d.update_after_index("a.txt", None);

        // Forge stored metadata with a wrong hash but matching stat.
        let mut snap = d.snapshot();
        snap.get_mut("a.txt").unwrap().hash = Some("deadbeef".to_string());
        d.load(snap);
        cache.invalidate_all();

        let set = d.detect(&["a.txt".to_string()]);
        assert_eq!(set.modified, vec!["a.txt"]);
    }
}
