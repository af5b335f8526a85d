//! Core types shared across the engine: task priorities and operations,
//! documents, search hits, ranked hits, scan errors, degradation levels, and
//! the path validation helpers every boundary relies on.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Heterogeneous "extra metadata" bag. Deliberately flat: string keys to
/// string values, never nested.
pub type Metadata = BTreeMap<String, String>;

/// Microseconds since the Unix epoch. Used as the enqueue timestamp.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Task priorities and operations
// ---------------------------------------------------------------------------

/// Priority levels for indexing operations. Lower rank pops earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// User-initiated, immediate attention needed.
    Critical,
    /// Active file changes.
    High,
    /// Standard background indexing.
    Normal,
    /// Bulk/batch operations.
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] =
        [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    /// Numeric rank: CRITICAL=0, HIGH=1, NORMAL=2, LOW=3.
    pub fn rank(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Parse from a string, defaulting to NORMAL on anything unrecognized.
    pub fn parse_lossy(s: &str) -> Priority {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Priority::Critical,
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOp {
    Index,
    Update,
    Delete,
}

impl TaskOp {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskOp::Index => "index",
            TaskOp::Update => "update",
            TaskOp::Delete => "delete",
        }
    }
}

/// A unit of indexing work. Owned exclusively by a worker from pop until
/// terminal disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub path: String,
    pub op: TaskOp,
    pub priority: Priority,
    /// Enqueue timestamp, microseconds since epoch. FIFO tiebreaker.
    pub enqueued_at: u64,
    pub retry_count: u32,
    pub metadata: Metadata,
}

impl Task {
    pub fn new(path: impl Into<String>, op: TaskOp, priority: Priority) -> Self {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.into(),
            op,
            priority,
            enqueued_at: now_micros(),
            retry_count: 0,
            metadata: Metadata::new(),
        }
    }

    /// Copy with an incremented retry count. The original enqueue timestamp
    /// is kept so the retry does not jump the FIFO line within its priority.
    pub fn with_retry(&self) -> Task {
        let mut t = self.clone();
        t.retry_count += 1;
        t
    }
}

// ---------------------------------------------------------------------------
// Documents and search results
// ---------------------------------------------------------------------------

/// The unit written to the indexed-document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub content: String,
    pub language: Option<String>,
    /// Last modification time, seconds since epoch.
    pub mtime: i64,
    pub size: u64,
    /// SHA-256 hex of the content.
    pub checksum: String,
}

/// A raw hit from the lexical store, before ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub lexical_score: f32,
    pub content_preview: String,
    pub metadata: Metadata,
}

/// Individual component scores behind a ranked hit. Already weighted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ComponentScores {
    pub lexical: f64,
    pub recency: f64,
    pub frequency: f64,
    pub path_class: f64,
    pub size: f64,
}

/// A search hit after multi-factor ranking. Reproducible from the original
/// hit plus the ranker's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedHit {
    pub path: String,
    pub final_score: f64,
    pub components: ComponentScores,
    pub original: SearchHit,
}

// ---------------------------------------------------------------------------
// Degradation
// ---------------------------------------------------------------------------

/// Which tier of the search stack answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// Primary full-text engine operational.
    Full,
    /// Lexical engine down; a lower tier answered.
    LexicalDown,
    /// Only process-based fallbacks left.
    AllDown,
    /// No backend available at all.
    None,
}

// ---------------------------------------------------------------------------
// Scan errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorKind {
    ReadDir,
    DepthLimit,
    Timeout,
    Worker,
}

/// A per-directory failure recorded during a scan. The scan itself continues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanError {
    pub kind: ScanErrorKind,
    pub path: String,
    pub worker_id: usize,
    /// Milliseconds since epoch at the time of the failure.
    pub at_ms: u64,
}

// ---------------------------------------------------------------------------
// Path validation
// ---------------------------------------------------------------------------

/// Reject paths that are empty, whitespace-only, contain null bytes, or carry
/// parent-directory traversal components. Every public entry point validates
/// before touching the filesystem.
pub fn validate_path(path: &str) -> EngineResult<()> {
    if path.trim().is_empty() {
        return Err(EngineError::validation("path", "empty path"));
    }
    if path.contains('\0') {
        return Err(EngineError::validation("path", "path contains null byte")
            .with_context("path", path.escape_default().to_string()));
    }
    if path.contains("../") || path.contains("..\\") || path == ".." {
        return Err(
            EngineError::validation("path", "path traversal attempt").with_context("path", path)
        );
    }
    Ok(())
}

/// Resolve `rel` against `base` and guarantee the result lies within `base`.
/// Absolute inputs are accepted only when they already sit under `base`.
/// This is the security invariant: no operation ever opens a file outside
/// the configured base path.
pub fn resolve_within(base: &Path, rel: &str) -> EngineResult<PathBuf> {
    validate_path(rel)?;
    let candidate = Path::new(rel);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    // Canonicalize when possible so symlinked escapes are caught too; fall
    // back to the lexical join for not-yet-existing targets (already free of
    // `..` components by validate_path).
    let resolved = joined.canonicalize().unwrap_or(joined);
    let base_resolved = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    if !resolved.starts_with(&base_resolved) {
        return Err(EngineError::validation("path", "path escapes base directory")
            .with_context("path", rel)
            .with_context("base", base_resolved.display().to_string()));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ranks_are_ordered() {
        assert_eq!(Priority::Critical.rank(), 0);
        assert_eq!(Priority::High.rank(), 1);
        assert_eq!(Priority::Normal.rank(), 2);
        assert_eq!(Priority::Low.rank(), 3);
    }

    #[test]
    fn parse_lossy_defaults_to_normal() {
        assert_eq!(Priority::parse_lossy("CRITICAL"), Priority::Critical);
        assert_eq!(Priority::parse_lossy("bogus"), Priority::Normal);
    }

    #[test]
    fn retry_keeps_enqueue_time() {
        let t = Task::new("src/main.rs", TaskOp::Index, Priority::Normal);
        let r = t.with_retry();
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.enqueued_at, t.enqueued_at);
        assert_eq!(r.id, t.id);
    }

    #[test]
    fn validate_path_rejects_traversal_and_nul() {
        assert!(validate_path("ok/file.rs").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("   ").is_err());
        assert!(validate_path("a\0b").is_err());
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("a/../../b").is_err());
    }

    #[test]
    fn resolve_within_rejects_outside_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let inside = resolve_within(dir.path(), "sub/file.txt").unwrap();
        assert!(inside.starts_with(dir.path().canonicalize().unwrap()));
        assert!(resolve_within(dir.path(), "/etc/passwd").is_err());
    }
}
