//! The engine: one explicitly constructed object owning every component.
//!
//! Wiring follows the dataflow: scanner → change detector → priority queue →
//! worker pool → document store, with the backpressure controller observing
//! the pipeline and the degradation coordinator fronting queries. Nothing
//! here is a global: construct an [`Engine`], pass it around, shut it down.

use crate::backpressure::{BackpressureConfig, BackpressureController};
use crate::changes::{ChangeDetector, ChangeSet};
use crate::config::{self, EngineConfig};
use crate::degrade::{DegradationCoordinator, VectorBackend};
use crate::error::{EngineError, EngineResult};
use crate::extract::ContentExtractor;
use crate::fts::{DocumentStore, FtsConfig};
use crate::hash::ParallelHashComputer;
use crate::ignore::IgnoreMatcher;
use crate::meta::MetaStore;
use crate::persist::{self, FileIndex};
use crate::pipeline::{IndexPipeline, PipelineConfig, PipelineStats};
use crate::queue::{QueueConfig, QueueStats, TaskQueue};
use crate::rank::{Ranker, RankerConfig};
use crate::scan::{DirListing, Scanner, ScannerConfig};
use crate::shutdown::ShutdownManager;
use crate::stat_cache::StatCache;
use crate::types::{DegradationLevel, Priority, RankedHit, Task, TaskOp};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of an incremental (or full) indexing pass.
#[derive(Debug)]
pub struct IndexReport {
    pub changes: ChangeSet,
    pub enqueued: usize,
    pub scanned_dirs: usize,
    pub scan_timed_out: bool,
}

/// A ranked search response, always carrying its degradation facts.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<RankedHit>,
    pub level: DegradationLevel,
    pub degraded_status: String,
    pub backend_used: String,
    pub fallback_reason: Option<String>,
    pub projects_skipped: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EngineStats {
    pub queue: QueueStats,
    pub pipeline: PipelineStats,
    pub store: crate::fts::FtsStats,
    pub stat_cache: crate::stat_cache::StatCacheStats,
    pub ignore: crate::ignore::IgnoreStats,
    pub backpressure: crate::backpressure::BackpressureStatus,
    pub tracked_files: usize,
}

pub struct Engine {
    base_path: PathBuf,
    config: EngineConfig,
    matcher: Arc<IgnoreMatcher>,
    stat_cache: Arc<StatCache>,
    scanner: Scanner,
    detector: Arc<ChangeDetector>,
    hasher: Arc<ParallelHashComputer>,
    queue: Arc<TaskQueue>,
    backpressure: Arc<BackpressureController>,
    pipeline: Arc<IndexPipeline>,
    store: Arc<DocumentStore>,
    meta: Arc<MetaStore>,
    ranker: Ranker,
    coordinator: DegradationCoordinator,
    shutdown: ShutdownManager,
    settings_dir: PathBuf,
}

impl Engine {
    /// Open an engine rooted at `base_path`. Creates the settings directory
    /// layout, loads persisted metadata, and validates the full-text index
    /// against it; a mismatch triggers a rebuild-from-source on the next
    /// indexing pass, never on the query path.
    pub fn open(base_path: &Path, config: EngineConfig) -> EngineResult<Engine> {
        Self::open_with_vector(base_path, config, None)
    }

    pub fn open_with_vector(
        base_path: &Path,
        config: EngineConfig,
        vector: Option<Arc<dyn VectorBackend>>,
    ) -> EngineResult<Engine> {
        let base_path = base_path.canonicalize().map_err(|e| {
            EngineError::validation("engine", format!("base path: {e}"))
                .with_context("path", base_path.display().to_string())
        })?;
        if !base_path.is_dir() {
            return Err(EngineError::validation("engine", "base path is not a directory")
                .with_context("path", base_path.display().to_string()));
        }

        let settings_dir = config::settings_dir(&base_path);
        std::fs::create_dir_all(&settings_dir).map_err(|e| {
            EngineError::storage("engine", format!("create settings dir: {e}"))
                .with_context("dir", settings_dir.display().to_string())
        })?;
        // Snapshot the effective configuration next to the persisted state.
        if let Ok(json) = serde_json::to_string_pretty(&config) {
            let _ = std::fs::write(settings_dir.join(config::CONFIG_JSON), json);
        }

        let matcher = Arc::new(IgnoreMatcher::new(
            &base_path,
            &config.directory_filtering.skip_large_directories,
        ));
        let stat_cache = Arc::new(StatCache::with_defaults());
        let scanner = Scanner::new(ScannerConfig {
            max_workers: config.performance.max_workers.max(1),
            ..Default::default()
        });

        let fts_dir = config
            .full_text
            .index_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| settings_dir.join(config::FTS_DIR));
        let store = Arc::new(DocumentStore::open(
            &fts_dir,
            FtsConfig {
                cache_enabled: config.full_text.cache_enabled,
                cache_max_size: config.full_text.cache_max_size,
                cache_ttl: Duration::from_secs(config.full_text.cache_ttl_seconds),
                bm25_k1: config.full_text.bm25_k1,
                bm25_b: config.full_text.bm25_b,
            },
        )?);
        let meta = Arc::new(MetaStore::open(&settings_dir)?);

        let detector = Arc::new(ChangeDetector::new(&base_path, Arc::clone(&stat_cache), false));
        detector.load(meta.load_file_metadata()?);
        let hasher = Arc::new(ParallelHashComputer::new(
            Arc::clone(&stat_cache),
            config.performance.max_workers.max(1),
        ));

        // Consistency between the relational rows and the derived FTS index
        // is checked here, at construction, and repaired by rebuilding from
        // source files, never during a search.
        let meta_rows = meta.document_count()?;
        if meta_rows != store.doc_count() {
            warn!(
                component = "engine",
                action = "index_inconsistent",
                meta_rows,
                fts_docs = store.doc_count(),
                "rebuilding from source on next index pass"
            );
            store.clear()?;
            meta.replace_file_metadata(&HashMap::new())?;
            detector.load(HashMap::new());
        }

        let queue = Arc::new(TaskQueue::new(QueueConfig::default()));
        let backpressure = Arc::new(BackpressureController::new(BackpressureConfig::default()));
        let extractor = Arc::new(
            ContentExtractor::new(&base_path, config.file_filtering.max_file_size)
                .with_type_limits(config.file_filtering.type_specific_limits.clone()),
        );
        let pipeline = Arc::new(IndexPipeline::new(
            Arc::clone(&queue),
            Arc::clone(&backpressure),
            extractor,
            Arc::clone(&store),
            Arc::clone(&meta),
            Arc::clone(&detector),
            PipelineConfig::default(),
        ));

        let ranker = Ranker::new(RankerConfig::default());
        let coordinator = DegradationCoordinator::new(Arc::clone(&store), vector);

        Ok(Engine {
            base_path,
            config,
            matcher,
            stat_cache,
            scanner,
            detector,
            hasher,
            queue,
            backpressure,
            pipeline,
            store,
            meta,
            ranker,
            coordinator,
            shutdown: ShutdownManager::with_defaults(),
            settings_dir,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn start(&self) {
        let pipeline = &self.pipeline;
        pipeline.start();
    }

    /// Start the live re-indexing watcher. The returned handle must be kept
    /// alive for events to flow.
    pub fn start_watcher(&self) -> Option<notify::RecommendedWatcher> {
        crate::watch::start_watcher(&self.base_path, Arc::clone(&self.matcher), Arc::clone(&self.queue))
    }

    /// Scan the tree and enqueue tasks for everything that changed.
    pub async fn index_incremental(&self, priority: Priority) -> EngineResult<IndexReport> {
        let _guard = self.shutdown.register_operation().ok_or_else(|| {
            EngineError::indexing("engine", "engine is shutting down")
        })?;

        let outcome =
            self.scanner.scan(&self.base_path, Arc::clone(&self.matcher), None).await?;
        let current = self.collect_files(&outcome.listings);

        let detector = Arc::clone(&self.detector);
        let current_for_detect = current.clone();
        let changes = tokio::task::spawn_blocking(move || detector.detect(&current_for_detect))
            .await
            .map_err(|e| EngineError::indexing("engine", format!("detect join: {e}")))?;

        // Pre-warm content hashes for the modified set in parallel; the
        // workers reuse them through the stat cache instead of re-reading.
        if !changes.modified.is_empty() {
            let hasher = Arc::clone(&self.hasher);
            let paths: Vec<String> = changes
                .modified
                .iter()
                .map(|p| self.base_path.join(p).to_string_lossy().into_owned())
                .collect();
            let _ = tokio::task::spawn_blocking(move || hasher.compute_batch(&paths)).await;
        }

        let mut enqueued = 0usize;
        for path in &changes.deleted {
            self.queue.remove_by_path(path);
            if self.queue.push(Task::new(path.clone(), TaskOp::Delete, Priority::High)) {
                enqueued += 1;
            }
        }
        for path in &changes.added {
            if self.queue.push(Task::new(path.clone(), TaskOp::Index, priority)) {
                enqueued += 1;
            }
        }
        for path in &changes.modified {
            if self.queue.push(Task::new(path.clone(), TaskOp::Update, priority)) {
                enqueued += 1;
            }
        }

        info!(
            component = "engine",
            action = "incremental_index",
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            unchanged = changes.unchanged.len(),
            enqueued
        );

        Ok(IndexReport {
            changes,
            enqueued,
            scanned_dirs: outcome.scanned_dirs,
            scan_timed_out: outcome.timed_out,
        })
    }

    /// Drop all indexed state and re-index the whole tree.
    pub async fn index_full(&self, priority: Priority) -> EngineResult<IndexReport> {
        self.store.clear()?;
        self.meta.replace_file_metadata(&HashMap::new())?;
        self.detector.load(HashMap::new());
        self.stat_cache.invalidate_all();
        self.index_incremental(priority).await
    }

    /// Ranked content search with graceful degradation. The response always
    /// names the backend that answered.
    pub async fn search(&self, query: &str, is_pattern: bool, limit: usize) -> SearchResponse {
        let outcome = self
            .coordinator
            .execute("search_content", query, is_pattern, &[], Some(&self.base_path), limit)
            .await;
        let hits = self.ranker.rank(outcome.results, query);
        SearchResponse {
            hits,
            level: outcome.level,
            degraded_status: outcome.degraded_status,
            backend_used: outcome.backend_used,
            fallback_reason: outcome.fallback_reason,
            projects_skipped: outcome.projects_skipped,
        }
    }

    /// Path-only search against the primary store. Errors degrade to empty.
    pub fn search_paths(&self, query: &str, is_pattern: bool, limit: usize) -> Vec<String> {
        self.store.search_file_paths(query, is_pattern, limit).unwrap_or_default()
    }

    pub fn current_level(&self) -> DegradationLevel {
        self.coordinator.current_level()
    }

    /// Bounded wait until the pipeline has drained the queue.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.pipeline.wait_for_idle(timeout).await
    }

    /// Push any coalesced writes through to the store.
    pub async fn flush(&self) {
        self.pipeline.flush_batch().await;
    }

    pub fn reset_scanner_breaker(&self) {
        self.scanner.reset_circuit_breaker();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queue: self.queue.stats(),
            pipeline: self.pipeline.stats(),
            store: self.store.stats(),
            stat_cache: self.stat_cache.stats(),
            ignore: self.matcher.stats(),
            backpressure: self.backpressure.status(),
            tracked_files: self.detector.tracked_files(),
        }
    }

    /// Stop workers, flush the batch, persist metadata and the file index,
    /// and run shutdown hooks. The engine never exits the process.
    pub async fn shutdown(&self) {
        self.pipeline.stop().await;

        let snapshot = self.detector.snapshot();
        if let Err(e) = self.meta.replace_file_metadata(&snapshot) {
            warn!(component = "engine", action = "persist_metadata_failed", error = %e);
        }
        let index = FileIndex::new(snapshot, crate::types::now_micros() as i64 / 1_000_000);
        if let Err(e) = persist::save_index(&self.settings_dir, &index) {
            warn!(component = "engine", action = "persist_index_failed", error = %e);
        }

        self.shutdown.shutdown().await;
        info!(component = "engine", action = "shutdown_complete");
    }

    /// Flatten scan listings into relative file paths, honoring per-directory
    /// bounds, explicit inclusions, and the ignore matcher.
    fn collect_files(&self, listings: &[DirListing]) -> Vec<String> {
        let df = &self.config.directory_filtering;
        let inclusions = &self.config.explicit_inclusions;
        let ext_filter: HashSet<&str> =
            inclusions.extensions.iter().map(|e| e.trim_start_matches('.')).collect();

        // Per-directory subdirectory bound: only listings reachable through
        // each directory's first N subdirectories are eligible.
        let mut allowed: Option<HashSet<PathBuf>> = None;
        if let Some(max_subdirs) = df.max_subdirectories_per_directory {
            let by_dir: BTreeMap<&Path, &DirListing> =
                listings.iter().map(|l| (l.dir.as_path(), l)).collect();
            let mut keep: HashSet<PathBuf> = HashSet::new();
            let mut frontier = vec![self.base_path.clone()];
            while let Some(dir) = frontier.pop() {
                if !keep.insert(dir.clone()) {
                    continue;
                }
                if let Some(listing) = by_dir.get(dir.as_path()) {
                    for sub in listing.subdirs.iter().take(max_subdirs) {
                        frontier.push(dir.join(sub));
                    }
                }
            }
            allowed = Some(keep);
        }

        let mut files = Vec::new();
        for listing in listings {
            if let Some(allowed) = &allowed {
                if !allowed.contains(&listing.dir) {
                    continue;
                }
            }
            let names: Vec<&String> = match df.max_files_per_directory {
                Some(max) => listing.files.iter().take(max).collect(),
                None => listing.files.iter().collect(),
            };
            for name in names {
                let abs = listing.dir.join(name);
                let Ok(rel) = abs.strip_prefix(&self.base_path) else { continue };
                let rel = rel.to_string_lossy().replace('\\', "/");

                if self.matcher.should_ignore(&rel) {
                    continue;
                }
                if !ext_filter.is_empty() {
                    let ext = rel.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
                    let explicitly_included = inclusions.files.iter().any(|f| f == &rel)
                        || inclusions.directories.iter().any(|d| rel.starts_with(d.as_str()));
                    if !ext_filter.contains(ext) && !explicitly_included {
                        continue;
                    }
                }
                files.push(rel);
            }
        }
        files.sort();
        files
    }
}
