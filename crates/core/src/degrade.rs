//! Degradation coordinator: keeps search answering when backends fail.
//!
//! Preference order: primary full-text store, an optional vector backend
//! (external collaborator, reached only through a probe trait), a local
//! ripgrep binary, then POSIX grep. A single call walks the chain at most
//! once, never recursively. Unhealthy projects are excluded up front and
//! reported, never searched.
//!
//! Process fallbacks never see a shell: the pattern goes to the child as a
//! separate argv entry, after the same pattern validation the indexed
//! store enforces.

use crate::error::EngineResult;
use crate::fts::DocumentStore;
use crate::pattern::{translate, QueryKind};
use crate::types::{DegradationLevel, Metadata, SearchHit};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Probe + query surface of an external vector/semantic backend. Internals
/// are out of scope; only this contract is.
pub trait VectorBackend: Send + Sync {
    fn is_available(&self) -> bool;
    fn search(&self, query: &str, limit: usize) -> EngineResult<Vec<SearchHit>>;
}

/// A project eligible for a degraded search.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackOutcome {
    pub results: Vec<SearchHit>,
    pub level: DegradationLevel,
    pub backend_used: String,
    pub degraded_status: String,
    pub fallback_reason: Option<String>,
    pub projects_skipped: Vec<String>,
    pub error: Option<String>,
}

pub struct DegradationCoordinator {
    store: Arc<DocumentStore>,
    vector: Option<Arc<dyn VectorBackend>>,
}

impl DegradationCoordinator {
    pub fn new(store: Arc<DocumentStore>, vector: Option<Arc<dyn VectorBackend>>) -> Self {
        DegradationCoordinator { store, vector }
    }

    /// Highest-available tier right now.
    pub fn current_level(&self) -> DegradationLevel {
        if self.store.healthy() {
            DegradationLevel::Full
        } else if self.vector.as_ref().is_some_and(|v| v.is_available()) {
            DegradationLevel::LexicalDown
        } else if ripgrep_binary().is_some() || grep_binary().is_some() {
            DegradationLevel::AllDown
        } else {
            DegradationLevel::None
        }
    }

    /// Run `operation` (a search) against the best available backend.
    /// `projects` scopes process-based fallbacks; when empty, `base_path`
    /// is used as the single search root.
    pub async fn execute(
        &self,
        operation: &str,
        query: &str,
        is_pattern: bool,
        projects: &[Project],
        base_path: Option<&Path>,
        limit: usize,
    ) -> FallbackOutcome {
        // Validation happens before any backend is consulted; a rejected
        // pattern executes nothing anywhere.
        let translated = translate(query, is_pattern);
        if translated == QueryKind::Rejected {
            warn!(component = "degrade", action = "pattern_rejected", operation);
            return FallbackOutcome {
                results: Vec::new(),
                level: self.current_level(),
                backend_used: "none".to_string(),
                degraded_status: "rejected_pattern".to_string(),
                fallback_reason: None,
                projects_skipped: Vec::new(),
                error: Some("pattern rejected by validation".to_string()),
            };
        }

        // Exclude unhealthy projects up front.
        let mut skipped = Vec::new();
        let mut roots: Vec<PathBuf> = Vec::new();
        for project in projects {
            if project_healthy(&project.path) {
                roots.push(project.path.clone());
            } else {
                warn!(component = "degrade", action = "project_skipped", project = project.id.as_str());
                skipped.push(project.id.clone());
            }
        }
        if roots.is_empty() {
            if let Some(base) = base_path {
                if project_healthy(base) {
                    roots.push(base.to_path_buf());
                }
            }
        }
        if !projects.is_empty() && roots.is_empty() {
            return FallbackOutcome {
                results: Vec::new(),
                level: DegradationLevel::None,
                backend_used: "none".to_string(),
                degraded_status: "degraded_no_backend".to_string(),
                fallback_reason: None,
                projects_skipped: skipped,
                error: Some("no healthy projects".to_string()),
            };
        }

        // One pass down the chain.
        let mut reason: Option<String> = None;

        if self.store.healthy() {
            match self.store.search_content(query, is_pattern, limit) {
                Ok(results) => {
                    return FallbackOutcome {
                        results,
                        level: DegradationLevel::Full,
                        backend_used: "fts".to_string(),
                        degraded_status: "full".to_string(),
                        fallback_reason: None,
                        projects_skipped: skipped,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!(component = "degrade", action = "backend_failed", backend = "fts", operation, error = %e);
                    reason = Some("fts failed".to_string());
                }
            }
        } else {
            reason = Some("fts unavailable".to_string());
        }

        if let Some(vector) = &self.vector {
            if vector.is_available() {
                match vector.search(query, limit) {
                    Ok(results) => {
                        return FallbackOutcome {
                            results,
                            level: DegradationLevel::LexicalDown,
                            backend_used: "vector".to_string(),
                            degraded_status: "degraded_fts_unavailable".to_string(),
                            fallback_reason: reason,
                            projects_skipped: skipped,
                            error: None,
                        };
                    }
                    Err(e) => {
                        warn!(component = "degrade", action = "backend_failed", backend = "vector", operation, error = %e);
                        reason = Some("fts and vector unavailable".to_string());
                    }
                }
            }
        }

        if let Some(rg) = ripgrep_binary() {
            match run_line_grep(&rg, GrepFlavor::Ripgrep, query, &translated, &roots, limit).await {
                Ok(results) => {
                    return FallbackOutcome {
                        results,
                        level: DegradationLevel::AllDown,
                        backend_used: "ripgrep".to_string(),
                        degraded_status: "degraded_search_fallback".to_string(),
                        fallback_reason: reason.clone().or_else(|| Some("fts unavailable".into())),
                        projects_skipped: skipped,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!(component = "degrade", action = "backend_failed", backend = "ripgrep", operation, error = %e);
                    reason = Some("fts and ripgrep unavailable".to_string());
                }
            }
        }

        if let Some(grep) = grep_binary() {
            match run_line_grep(&grep, GrepFlavor::Grep, query, &translated, &roots, limit).await {
                Ok(results) => {
                    return FallbackOutcome {
                        results,
                        level: DegradationLevel::AllDown,
                        backend_used: "grep".to_string(),
                        degraded_status: "degraded_search_fallback".to_string(),
                        fallback_reason: reason.clone().or_else(|| Some("fts unavailable".into())),
                        projects_skipped: skipped,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!(component = "degrade", action = "backend_failed", backend = "grep", operation, error = %e);
                }
            }
        }

        FallbackOutcome {
            results: Vec::new(),
            level: DegradationLevel::None,
            backend_used: "none".to_string(),
            degraded_status: "degraded_no_backend".to_string(),
            fallback_reason: Some("all search backends unavailable".to_string()),
            projects_skipped: skipped,
            error: Some("no search backend available".to_string()),
        }
    }
}

/// Exists, is a directory, and is actually listable.
fn project_healthy(path: &Path) -> bool {
    path.is_dir() && std::fs::read_dir(path).is_ok()
}

fn ripgrep_binary() -> Option<PathBuf> {
    which::which("rg").ok()
}

fn grep_binary() -> Option<PathBuf> {
    which::which("grep").ok()
}

#[derive(Clone, Copy)]
enum GrepFlavor {
    Ripgrep,
    Grep,
}

/// Invoke a line-grep process. The pattern travels as its own argv entry;
/// it is never interpolated into a shell string.
async fn run_line_grep(
    binary: &Path,
    flavor: GrepFlavor,
    raw_query: &str,
    translated: &QueryKind,
    roots: &[PathBuf],
    limit: usize,
) -> std::io::Result<Vec<SearchHit>> {
    // Fixed-string search unless validation produced a safe regex.
    let (pattern, fixed): (String, bool) = match translated {
        QueryKind::Regex(regex) => (regex.clone(), false),
        QueryKind::Phrase(phrase) => (phrase.clone(), true),
        QueryKind::Prefix(prefix) => (prefix.clone(), true),
        QueryKind::Term(term) => (term.clone(), true),
        QueryKind::All | QueryKind::Rejected => (raw_query.to_string(), true),
    };

    let mut hits = Vec::new();
    for root in roots {
        let mut cmd = Command::new(binary);
        match flavor {
            GrepFlavor::Ripgrep => {
                cmd.arg("--line-number").arg("--no-heading").arg("--color").arg("never");
                if fixed {
                    cmd.arg("--fixed-strings");
                }
                cmd.arg("-e").arg(&pattern).arg("--").arg(root);
            }
            GrepFlavor::Grep => {
                cmd.arg("-r").arg("-n").arg("--binary-files=without-match");
                cmd.arg(if fixed { "-F" } else { "-E" });
                cmd.arg("-e").arg(&pattern).arg("--").arg(root);
            }
        }
        let output = cmd.output().await?;
        // Exit code 1 is "no matches" for both tools; anything above is real.
        if !output.status.success() && output.status.code() != Some(1) {
            return Err(std::io::Error::other(format!(
                "{} exited with {:?}",
                binary.display(),
                output.status.code()
            )));
        }

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if hits.len() >= limit {
                break;
            }
            if let Some(hit) = parse_grep_line(line, root) {
                hits.push(hit);
            }
        }
        if hits.len() >= limit {
            break;
        }
    }
    debug!(component = "degrade", action = "line_grep_done", matches = hits.len());
    Ok(hits)
}

/// `path:line:text` → SearchHit with the line recorded in metadata.
fn parse_grep_line(line: &str, root: &Path) -> Option<SearchHit> {
    let (path_part, rest) = line.split_once(':')?;
    let (line_no, text) = rest.split_once(':')?;
    let line_no: u64 = line_no.parse().ok()?;

    let rel = Path::new(path_part).strip_prefix(root).map(|p| p.to_path_buf());
    let path = rel.unwrap_or_else(|_| PathBuf::from(path_part)).to_string_lossy().replace('\\', "/");

    let mut metadata = Metadata::new();
    metadata.insert("line".to_string(), line_no.to_string());
    Some(SearchHit {
        path,
        lexical_score: 0.0,
        content_preview: text.chars().take(200).collect(),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fts::FtsConfig;

    fn fixture() -> (tempfile::TempDir, tempfile::TempDir, Arc<DocumentStore>) {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("main.py"), "def main():\n    return 1\n").unwrap();
        let index_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(index_dir.path(), FtsConfig::default()).unwrap());
        (project, index_dir, store)
    }

    #[tokio::test]
    async fn healthy_store_answers_at_full_level() {
        let (project, _index, store) = fixture();
        let doc = crate::types::Document {
            path: "main.py".to_string(),
            content: "def main(): pass".to_string(),
            language: Some("python".to_string()),
            mtime: 0,
            size: 16,
            checksum: "x".to_string(),
        };
        store.index_document("main.py", &doc).unwrap();

        let coordinator = DegradationCoordinator::new(Arc::clone(&store), None);
        let outcome = coordinator
            .execute("search", "main", false, &[], Some(project.path()), 10)
            .await;
        assert_eq!(outcome.level, DegradationLevel::Full);
        assert_eq!(outcome.backend_used, "fts");
        assert_eq!(outcome.degraded_status, "full");
        assert_eq!(outcome.results.len(), 1);
    }

    #[tokio::test]
    async fn forced_down_store_falls_back_to_line_grep() {
        let (project, _index, store) = fixture();
        store.set_forced_down(true);
        let coordinator = DegradationCoordinator::new(Arc::clone(&store), None);
        let outcome = coordinator
            .execute("search", "def main", false, &[], Some(project.path()), 10)
            .await;

        if ripgrep_binary().is_some() || grep_binary().is_some() {
            assert_ne!(outcome.level, DegradationLevel::Full);
            assert!(
                outcome.backend_used == "ripgrep" || outcome.backend_used == "grep",
                "unexpected backend: {}",
                outcome.backend_used
            );
            assert_eq!(outcome.degraded_status, "degraded_search_fallback");
            assert!(outcome.fallback_reason.is_some());
            assert!(outcome.results.iter().any(|h| h.path == "main.py"), "{:?}", outcome.results);
        } else {
            assert_eq!(outcome.level, DegradationLevel::None);
        }
    }

    #[tokio::test]
    async fn malicious_pattern_never_reaches_a_backend() {
        let (project, _index, store) = fixture();
        let coordinator = DegradationCoordinator::new(store, None);
        let outcome = coordinator
            .execute("search", "; rm -rf /", false, &[], Some(project.path()), 10)
            .await;
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.backend_used, "none");
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn unhealthy_projects_are_skipped() {
        let (project, _index, store) = fixture();
        store.set_forced_down(true);
        let coordinator = DegradationCoordinator::new(store, None);
        let projects = vec![
            Project { id: "good".to_string(), path: project.path().to_path_buf() },
            Project { id: "gone".to_string(), path: PathBuf::from("/definitely/not/here") },
        ];
        let outcome = coordinator.execute("search", "def main", false, &projects, None, 10).await;
        assert_eq!(outcome.projects_skipped, vec!["gone".to_string()]);
    }

    #[tokio::test]
    async fn zero_healthy_projects_is_none_level() {
        let (_project, _index, store) = fixture();
        let coordinator = DegradationCoordinator::new(store, None);
        let projects =
            vec![Project { id: "gone".to_string(), path: PathBuf::from("/definitely/not/here") }];
        let outcome = coordinator.execute("search", "anything", false, &projects, None, 10).await;
        assert_eq!(outcome.level, DegradationLevel::None);
        assert!(outcome.results.is_empty());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn vector_backend_answers_when_fts_is_down() {
        struct FakeVector;
        impl VectorBackend for FakeVector {
            fn is_available(&self) -> bool {
                true
            }
            fn search(&self, _query: &str, _limit: usize) -> EngineResult<Vec<SearchHit>> {
                Ok(vec![SearchHit {
                    path: "vector.rs".to_string(),
                    lexical_score: 0.9,
                    content_preview: String::new(),
                    metadata: Metadata::new(),
                }])
            }
        }

        let (project, _index, store) = fixture();
        store.set_forced_down(true);
        let coordinator = DegradationCoordinator::new(store, Some(Arc::new(FakeVector)));
        let outcome =
            coordinator.execute("search", "anything", false, &[], Some(project.path()), 10).await;
        assert_eq!(outcome.level, DegradationLevel::LexicalDown);
        assert_eq!(outcome.backend_used, "vector");
        assert_eq!(outcome.degraded_status, "degraded_fts_unavailable");
        assert_eq!(outcome.results.len(), 1);
    }
}
