//! Parallel filesystem scanner.
//!
//! Work-queue architecture: a fixed pool of long-lived workers (capped at
//! 50) drains a shared frontier of `(dir, symlink_depth, dir_depth)` items
//! seeded with the root. Directory reads run on the blocking pool; all
//! coordination stays on the scheduler. Per-directory failures are recorded
//! and skipped; a worker panic is counted and the remaining workers cover.
//!
//! The overall scan is wrapped in a timeout. On expiry the remaining workers
//! are cancelled and the partial results collected so far are returned;
//! a timeout is an outcome, not an error. After a configurable number of
//! consecutive timeouts a circuit breaker rejects further scans until reset.
//!
//! Output is sorted lexicographically by directory path, so consumers may
//! assume depth-first-equivalent ordering regardless of worker timing.

use crate::error::{EngineError, EngineResult};
use crate::ignore::IgnoreMatcher;
use crate::types::{ScanError, ScanErrorKind};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Hard cap on scanner workers, bounding open file descriptors.
const MAX_WORKERS: usize = 50;

/// How long an idle worker waits for new frontier items before re-checking
/// the termination condition.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub max_workers: usize,
    pub timeout: Duration,
    pub max_symlink_depth: u32,
    pub max_directory_depth: u32,
    pub timeout_failure_threshold: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            max_workers: 4,
            timeout: Duration::from_secs(300),
            max_symlink_depth: 8,
            max_directory_depth: 1000,
            timeout_failure_threshold: 3,
        }
    }
}

/// One directory's listing: `(dir, subdirs, files)`.
#[derive(Debug, Clone)]
pub struct DirListing {
    pub dir: PathBuf,
    pub subdirs: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub listings: Vec<DirListing>,
    pub errors: Vec<ScanError>,
    pub scanned_dirs: usize,
    pub skipped_symlinks: usize,
    pub failed_workers: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Frontier item: path plus the symlink and directory depths it was reached at.
struct WorkItem {
    dir: PathBuf,
    symlink_depth: u32,
    dir_depth: u32,
}

enum EntryKind {
    Dir,
    SymlinkDir,
    File,
}

struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    /// Items queued or currently being processed. Workers exit when this
    /// reaches zero with an empty queue. This is the join/count primitive.
    outstanding: AtomicUsize,
    notify: Notify,
    results: Mutex<Vec<DirListing>>,
    errors: Mutex<Vec<ScanError>>,
    /// (inode, device) pairs seen while following symlinks this scan.
    visited_links: Mutex<HashSet<(u64, u64)>>,
    scanned: AtomicUsize,
    skipped_symlinks: AtomicUsize,
    matcher: Arc<IgnoreMatcher>,
    config: ScannerConfig,
    progress: Option<ProgressFn>,
}

pub struct Scanner {
    config: ScannerConfig,
    consecutive_timeouts: AtomicU32,
    breaker_open: AtomicBool,
}

impl Scanner {
    pub fn new(config: ScannerConfig) -> Self {
        Scanner { config, consecutive_timeouts: AtomicU32::new(0), breaker_open: AtomicBool::new(false) }
    }

    /// Walk `root` in parallel. Returns partial results on timeout; errors
    /// only for a rejected scan (breaker open, root not a directory).
    pub async fn scan(
        &self,
        root: &Path,
        matcher: Arc<IgnoreMatcher>,
        progress: Option<ProgressFn>,
    ) -> EngineResult<ScanOutcome> {
        if self.breaker_open.load(Ordering::SeqCst) {
            return Err(EngineError::indexing("scanner", "circuit breaker open after repeated timeouts")
                .with_context("root", root.display().to_string()));
        }
        if !root.is_dir() {
            return Err(EngineError::validation("scanner", "scan root is not a directory")
                .with_context("root", root.display().to_string()));
        }

        let start = Instant::now();
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            outstanding: AtomicUsize::new(0),
            notify: Notify::new(),
            results: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            visited_links: Mutex::new(HashSet::new()),
            scanned: AtomicUsize::new(0),
            skipped_symlinks: AtomicUsize::new(0),
            matcher,
            config: self.config.clone(),
            progress,
        });

        // Seed the frontier with the root.
        shared.outstanding.store(1, Ordering::SeqCst);
        shared.queue.lock().unwrap().push_back(WorkItem {
            dir: root.to_path_buf(),
            symlink_depth: 0,
            dir_depth: 0,
        });

        let worker_count = self.config.max_workers.clamp(1, MAX_WORKERS);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let shared = Arc::clone(&shared);
            handles.push(tokio::spawn(worker_loop(shared, worker_id)));
        }

        let mut failed_workers = 0usize;
        let join_result = tokio::time::timeout(self.config.timeout, async {
            let mut crashed = 0usize;
            for handle in &mut handles {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        crashed += 1;
                        error!(component = "scanner", action = "worker_crashed", error = %e, "worker panicked; remaining workers cover");
                    }
                }
            }
            crashed
        })
        .await;
        let timed_out = match join_result {
            Ok(crashed) => {
                failed_workers = crashed;
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                false
            }
            Err(_) => {
                for handle in &handles {
                    handle.abort();
                }
                let timeouts = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    component = "scanner",
                    action = "scan_timeout",
                    root = %root.display(),
                    consecutive = timeouts,
                    "scan timed out; returning partial results"
                );
                shared.errors.lock().unwrap().push(ScanError {
                    kind: ScanErrorKind::Timeout,
                    path: root.display().to_string(),
                    worker_id: usize::MAX,
                    at_ms: epoch_ms(),
                });
                if timeouts >= self.config.timeout_failure_threshold {
                    self.breaker_open.store(true, Ordering::SeqCst);
                    error!(component = "scanner", action = "breaker_open", consecutive = timeouts);
                }
                true
            }
        };

        let mut listings = std::mem::take(&mut *shared.results.lock().unwrap());
        listings.sort_by(|a, b| a.dir.cmp(&b.dir));
        let errors = std::mem::take(&mut *shared.errors.lock().unwrap());

        Ok(ScanOutcome {
            scanned_dirs: shared.scanned.load(Ordering::SeqCst),
            skipped_symlinks: shared.skipped_symlinks.load(Ordering::SeqCst),
            failed_workers,
            timed_out,
            elapsed: start.elapsed(),
            listings,
            errors,
        })
    }

    /// Allow scans again after the breaker opened.
    pub fn reset_circuit_breaker(&self) {
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
        self.breaker_open.store(false, Ordering::SeqCst);
        debug!(component = "scanner", action = "breaker_reset");
    }

    pub fn circuit_breaker_open(&self) -> bool {
        self.breaker_open.load(Ordering::SeqCst)
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    loop {
        let item = shared.queue.lock().unwrap().pop_front();
        match item {
            Some(item) => {
                process_directory(&shared, worker_id, item).await;
                shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                shared.notify.notify_waiters();
            }
            None => {
                if shared.outstanding.load(Ordering::SeqCst) == 0 {
                    break;
                }
                let _ = tokio::time::timeout(POLL_TIMEOUT, shared.notify.notified()).await;
            }
        }
    }
}

async fn process_directory(shared: &Shared, worker_id: usize, item: WorkItem) {
    if item.dir_depth >= shared.config.max_directory_depth {
        record_error(shared, ScanErrorKind::DepthLimit, &item.dir, worker_id);
        return;
    }

    let dir = item.dir.clone();
    let entries = tokio::task::spawn_blocking(move || read_dir_entries(&dir)).await;
    let entries = match entries {
        Ok(Ok(entries)) => entries,
        Ok(Err(e)) => {
            debug!(component = "scanner", action = "read_dir_failed", path = %item.dir.display(), error = %e);
            record_error(shared, ScanErrorKind::ReadDir, &item.dir, worker_id);
            return;
        }
        Err(e) => {
            error!(component = "scanner", action = "read_dir_join_failed", path = %item.dir.display(), error = %e);
            record_error(shared, ScanErrorKind::Worker, &item.dir, worker_id);
            return;
        }
    };

    let mut subdirs = Vec::new();
    let mut files = Vec::new();
    let mut children = Vec::new();

    for (name, kind) in entries {
        let child = item.dir.join(&name);
        match kind {
            EntryKind::Dir => {
                if dir_is_ignored(shared, &child) {
                    continue;
                }
                subdirs.push(name);
                children.push(WorkItem {
                    dir: child,
                    symlink_depth: item.symlink_depth,
                    dir_depth: item.dir_depth + 1,
                });
            }
            EntryKind::SymlinkDir => {
                let new_depth = item.symlink_depth + 1;
                if new_depth >= shared.config.max_symlink_depth || !link_is_new(shared, &child) {
                    shared.skipped_symlinks.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                if dir_is_ignored(shared, &child) {
                    continue;
                }
                subdirs.push(name);
                children.push(WorkItem {
                    dir: child,
                    symlink_depth: new_depth,
                    dir_depth: item.dir_depth + 1,
                });
            }
            EntryKind::File => files.push(name),
        }
    }

    subdirs.sort();
    files.sort();

    shared.results.lock().unwrap().push(DirListing {
        dir: item.dir,
        subdirs,
        files,
    });
    let scanned = shared.scanned.fetch_add(1, Ordering::SeqCst) + 1;

    // Progress is best-effort; a misbehaving callback never affects the scan.
    if let Some(progress) = &shared.progress {
        let estimate = scanned + shared.outstanding.load(Ordering::SeqCst);
        let cb = Arc::clone(progress);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(scanned, estimate)));
    }

    for child in children {
        shared.outstanding.fetch_add(1, Ordering::SeqCst);
        shared.queue.lock().unwrap().push_back(child);
        shared.notify.notify_waiters();
    }
}

/// Ignore decisions are fail-open: if the matcher itself panics the
/// directory is included and the problem logged.
fn dir_is_ignored(shared: &Shared, path: &Path) -> bool {
    let rel = path
        .strip_prefix(shared.matcher.base_path())
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        shared.matcher.should_ignore_dir(&rel)
    })) {
        Ok(ignored) => ignored,
        Err(_) => {
            warn!(component = "scanner", action = "matcher_failed", path = rel.as_str(), "including directory (fail-open)");
            false
        }
    }
}

/// A symlink is followed at most once per scan, identified by the link's own
/// (inode, device) pair.
fn link_is_new(shared: &Shared, path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match fs::symlink_metadata(path) {
            Ok(meta) => shared.visited_links.lock().unwrap().insert((meta.ino(), meta.dev())),
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        let _ = shared;
        true
    }
}

fn read_dir_entries(dir: &Path) -> std::io::Result<Vec<(String, EntryKind)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else { continue };
        let name = entry.file_name().to_string_lossy().into_owned();
        if file_type.is_dir() {
            out.push((name, EntryKind::Dir));
        } else if file_type.is_symlink() {
            // Classify by target; a broken symlink is neither.
            match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_dir() => out.push((name, EntryKind::SymlinkDir)),
                Ok(_) => out.push((name, EntryKind::File)),
                Err(_) => {}
            }
        } else if file_type.is_file() {
            out.push((name, EntryKind::File));
        }
    }
    Ok(out)
}

fn record_error(shared: &Shared, kind: ScanErrorKind, path: &Path, worker_id: usize) {
    shared.errors.lock().unwrap().push(ScanError {
        kind,
        path: path.display().to_string(),
        worker_id,
        at_ms: epoch_ms(),
    });
}

fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("README.md"), "readme").unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(root.join("src/nested/mod.rs"), "pub fn f() {}").unwrap();
        fs::write(root.join("docs/guide.md"), "guide").unwrap();
    }

    fn scan_now(root: &Path, config: ScannerConfig) -> ScanOutcome {
        let matcher = Arc::new(IgnoreMatcher::new(root, &[]));
        let scanner = Scanner::new(config);
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(scanner.scan(root, matcher, None)).unwrap()
    }

    #[test]
    fn scan_matches_walk_shape() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let outcome = scan_now(dir.path(), ScannerConfig::default());

        assert!(!outcome.timed_out);
        assert_eq!(outcome.scanned_dirs, 4);
        assert_eq!(outcome.listings.len(), 4);

        // Sorted lexicographically by directory path.
        let dirs: Vec<_> = outcome.listings.iter().map(|l| l.dir.clone()).collect();
        let mut sorted = dirs.clone();
        sorted.sort();
        assert_eq!(dirs, sorted);

        let root_listing = outcome.listings.iter().find(|l| l.dir == dir.path()).unwrap();
        assert_eq!(root_listing.subdirs, vec!["docs".to_string(), "src".to_string()]);
        assert_eq!(root_listing.files, vec!["README.md".to_string()]);
    }

    #[test]
    fn ignored_directories_are_not_emitted() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();

        let outcome = scan_now(dir.path(), ScannerConfig::default());
        assert!(outcome.listings.iter().all(|l| !l.dir.ends_with("node_modules")));
        let root_listing = outcome.listings.iter().find(|l| l.dir == dir.path()).unwrap();
        assert!(!root_listing.subdirs.contains(&"node_modules".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::create_dir_all(&a).unwrap();
        fs::write(a.join("file.txt"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path(), a.join("loop")).unwrap();

        let config = ScannerConfig { timeout: Duration::from_secs(30), ..Default::default() };
        let outcome = scan_now(dir.path(), config);

        assert!(!outcome.timed_out);
        assert!(outcome.skipped_symlinks > 0, "cycle should be cut: {outcome:?}");
        // Each real directory appears exactly once at its real path.
        let real: Vec<_> = outcome.listings.iter().filter(|l| l.dir == a).collect();
        assert_eq!(real.len(), 1);
    }

    #[test]
    fn directory_depth_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("1/2/3/4")).unwrap();
        let config = ScannerConfig { max_directory_depth: 2, ..Default::default() };
        let outcome = scan_now(dir.path(), config);

        assert!(outcome.errors.iter().any(|e| e.kind == ScanErrorKind::DepthLimit));
        assert!(outcome.listings.iter().all(|l| !l.dir.ends_with("3")));
    }

    #[test]
    fn breaker_opens_after_consecutive_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let matcher = Arc::new(IgnoreMatcher::new(dir.path(), &[]));
        let config = ScannerConfig {
            timeout: Duration::from_millis(0),
            timeout_failure_threshold: 3,
            ..Default::default()
        };
        let scanner = Scanner::new(config);
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        for _ in 0..3 {
            let outcome =
                rt.block_on(scanner.scan(dir.path(), Arc::clone(&matcher), None)).unwrap();
            assert!(outcome.timed_out);
        }
        assert!(scanner.circuit_breaker_open());
        assert!(rt.block_on(scanner.scan(dir.path(), Arc::clone(&matcher), None)).is_err());

        scanner.reset_circuit_breaker();
        assert!(!scanner.circuit_breaker_open());
    }

    #[test]
    fn progress_callback_panic_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let matcher = Arc::new(IgnoreMatcher::new(dir.path(), &[]));
        let scanner = Scanner::new(ScannerConfig::default());
        let progress: ProgressFn = Arc::new(|_, _| panic!("bad callback"));
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let outcome = rt.block_on(scanner.scan(dir.path(), matcher, Some(progress))).unwrap();
        assert_eq!(outcome.scanned_dirs, 4);
    }
}
