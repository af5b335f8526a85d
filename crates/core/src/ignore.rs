//! Ignore matcher: decides whether a path is excluded from scanning.
//!
//! Two tiers. The fast tier is an O(1) set probe on the directory basename
//! (VCS dirs, package caches, build outputs) plus a hidden-directory rule
//! with a small allow-list. The slow tier is the compiled gitignore engine
//! over the default pattern set extended with the repo's `.gitignore` and
//! `.ignore` files and any user patterns, memoized in an LRU keyed by the
//! normalized path.
//!
//! Construction never fails: an invalid pattern line is logged and skipped.
//! Consumers are fail-open: a matcher problem during scanning must include
//! the directory, never abort the scan.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Memoization cache size, entries.
const MEMO_CAPACITY: usize = 10_000;

/// Directory basenames that are always ignored, checked before any pattern
/// machinery runs.
const ALWAYS_IGNORED_DIRS: &[&str] = &[
    // Version control
    ".git", ".svn", ".hg", ".bzr", "CVS",
    // Dependency caches
    "node_modules", "site-packages", "vendor", "Pods", "gems", "lua_modules",
    "bower_components",
    // Virtual environments
    "venv", ".venv", "env", "ENV", ".env", "virtualenv",
    // Language caches
    "__pycache__", ".pytest_cache", ".mypy_cache", ".ruff_cache", ".tox",
    // Build outputs
    "build", "dist", "target", "out", "obj", "_build", "dist-newstyle",
    "cmake-build-debug", "cmake-build-release",
    // Framework outputs
    ".next", ".nuxt", ".svelte-kit", ".angular",
    // Tool caches
    ".cache", ".parcel-cache", ".webpack", ".turbo", ".vite", ".yarn",
    ".pnp", ".pnpm", ".eggs",
    // Coverage
    "htmlcov", ".nyc_output", "coverage",
    // Scratch
    "tmp", "temp",
    // OS detritus
    "__MACOSX", "$RECYCLE.BIN", "System Volume Information",
];

/// Hidden directories that may still contain code worth indexing.
const ALLOWED_DOTDIRS: &[&str] = &[".github", ".vscode", ".config"];

/// Default gitignore-style pattern set, always present. User patterns and
/// repo ignore files extend it.
const DEFAULT_PATTERNS: &[&str] = &[
    // Compiled and bytecode
    "*.pyc", "*.pyo", "*.pyd", "*.class", "*.o", "*.a",
    "*.so", "*.dylib", "*.dll", "*.jar", "*.war", "*.ear",
    // Packaging
    "*.egg-info", "*.whl",
    // Logs and temporaries
    "*.log", "*.tmp", "*.swp", "*.swo", "*~", "*.swx",
    // Databases
    "*.db", "*.sqlite", "*.sqlite3",
    // Lockfiles that dwarf their value in an index
    "Cargo.lock", "package-lock.json", "yarn.lock", "pnpm-lock.yaml",
    // Editor state
    ".netrwhist", "Session.vim", ".project", ".directory",
    // OS files
    ".DS_Store", "Thumbs.db", "desktop.ini", "Desktop.ini",
    ".Spotlight-V100", ".Trashes",
    // Environments and local overrides
    ".env.*", "*.local",
    // Documentation build output
    "docs/_build/", "docs/build/",
    // IDE directories not on the dot-dir allow-list anyway, kept for files
    ".idea/", ".vs/", ".eclipse/",
];

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IgnoreStats {
    pub pattern_count: usize,
    pub skipped_patterns: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
}

pub struct IgnoreMatcher {
    base_path: PathBuf,
    gitignore: Gitignore,
    memo: Mutex<LruCache<String, bool>>,
    hits: AtomicU64,
    misses: AtomicU64,
    pattern_count: usize,
    skipped_patterns: usize,
}

impl IgnoreMatcher {
    /// Build a matcher for `base_path`. Reads `.gitignore` and `.ignore` at
    /// the root when present. Invalid pattern lines are logged and skipped;
    /// construction itself cannot fail.
    pub fn new(base_path: &Path, extra_patterns: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(base_path);
        let mut pattern_count = 0usize;
        let mut skipped = 0usize;

        for line in DEFAULT_PATTERNS {
            match builder.add_line(None, line) {
                Ok(_) => pattern_count += 1,
                Err(e) => {
                    skipped += 1;
                    warn!(component = "ignore", action = "skip_pattern", pattern = line, error = %e, "invalid default pattern");
                }
            }
        }

        for name in [".gitignore", ".ignore"] {
            let path = base_path.join(name);
            if path.exists() {
                if let Some(e) = builder.add(&path) {
                    warn!(component = "ignore", action = "partial_ignore_file", file = name, error = %e, "some pattern lines were skipped");
                }
                debug!(component = "ignore", action = "load_ignore_file", file = name);
            }
        }

        for line in extra_patterns {
            match builder.add_line(None, line) {
                Ok(_) => pattern_count += 1,
                Err(e) => {
                    skipped += 1;
                    warn!(component = "ignore", action = "skip_pattern", pattern = line.as_str(), error = %e, "invalid extra pattern");
                }
            }
        }

        let gitignore = builder.build().unwrap_or_else(|e| {
            warn!(component = "ignore", action = "build_failed", error = %e, "falling back to empty pattern set");
            Gitignore::empty()
        });

        IgnoreMatcher {
            base_path: base_path.to_path_buf(),
            gitignore,
            memo: Mutex::new(LruCache::new(NonZeroUsize::new(MEMO_CAPACITY).unwrap())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            pattern_count,
            skipped_patterns: skipped,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Should this path (relative to the base) be excluded?
    pub fn should_ignore(&self, rel_path: &str) -> bool {
        let normalized = normalize(rel_path);
        self.memoized(&normalized, false)
    }

    /// Should this directory (relative to the base) be excluded? Runs the
    /// fast tier before consulting the pattern engine.
    pub fn should_ignore_dir(&self, rel_path: &str) -> bool {
        let normalized = normalize(rel_path);
        let basename = normalized.rsplit('/').next().unwrap_or(&normalized);

        if ALWAYS_IGNORED_DIRS.contains(&basename) {
            return true;
        }
        if basename.starts_with('.')
            && basename != "."
            && basename != ".."
            && !ALLOWED_DOTDIRS.contains(&basename)
        {
            return true;
        }

        self.memoized(&normalized, true)
    }

    fn memoized(&self, normalized: &str, is_dir: bool) -> bool {
        // Directories and files can match different pattern forms (trailing
        // slash), so the memo key distinguishes them.
        let key = if is_dir { format!("{normalized}/") } else { normalized.to_string() };

        if let Ok(mut memo) = self.memo.lock() {
            if let Some(&cached) = memo.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return cached;
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let result = self
            .gitignore
            .matched_path_or_any_parents(Path::new(normalized), is_dir)
            .is_ignore();

        if let Ok(mut memo) = self.memo.lock() {
            memo.put(key, result);
        }
        result
    }

    pub fn stats(&self) -> IgnoreStats {
        let cache_size = self.memo.lock().map(|m| m.len()).unwrap_or(0);
        IgnoreStats {
            pattern_count: self.pattern_count,
            skipped_patterns: self.skipped_patterns,
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            cache_size,
        }
    }
}

/// Forward slashes, no leading `./`.
fn normalize(path: &str) -> String {
    let p = path.replace('\\', "/");
    p.strip_prefix("./").unwrap_or(&p).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher_in(dir: &Path) -> IgnoreMatcher {
        IgnoreMatcher::new(dir, &[])
    }

    #[test]
    fn always_ignored_dirs_hit_fast_tier() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_in(dir.path());
        assert!(m.should_ignore_dir("node_modules"));
        assert!(m.should_ignore_dir("src/node_modules"));
        assert!(m.should_ignore_dir(".git"));
        assert!(m.should_ignore_dir("target"));
        assert!(!m.should_ignore_dir("src"));
    }

    #[test]
    fn hidden_dirs_ignored_except_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_in(dir.path());
        assert!(m.should_ignore_dir(".secret"));
        assert!(!m.should_ignore_dir(".github"));
        assert!(!m.should_ignore_dir(".config"));
    }

    #[test]
    fn default_file_patterns_apply() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_in(dir.path());
        assert!(m.should_ignore("module.pyc"));
        assert!(m.should_ignore("deep/nested/file.log"));
        assert!(!m.should_ignore("src/main.rs"));
    }

    #[test]
    fn gitignore_file_is_loaded_with_negation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "generated/\n!generated/keep.rs\n").unwrap();
        let m = matcher_in(dir.path());
        assert!(m.should_ignore_dir("generated"));
        assert!(!m.should_ignore("generated/keep.rs"));
    }

    #[test]
    fn anchored_pattern_only_matches_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "/top.txt\n").unwrap();
        let m = matcher_in(dir.path());
        assert!(m.should_ignore("top.txt"));
        assert!(!m.should_ignore("sub/top.txt"));
    }

    #[test]
    fn invalid_pattern_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let m = IgnoreMatcher::new(dir.path(), &["[".to_string()]);
        assert!(m.stats().skipped_patterns >= 1);
        assert!(!m.should_ignore("src/lib.rs"));
    }

    #[test]
    fn memo_counts_hits() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_in(dir.path());
        let _ = m.should_ignore("a/b/c.rs");
        let _ = m.should_ignore("a/b/c.rs");
        let s = m.stats();
        assert!(s.cache_hits >= 1, "expected memo hit: {s:?}");
    }

    #[test]
    fn normalization_strips_dot_slash_and_backslashes() {
        assert_eq!(normalize("./a/b"), "a/b");
        assert_eq!(normalize("a\\b"), "a/b");
    }
}
