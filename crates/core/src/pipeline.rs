//! Asynchronous indexing pipeline: worker pool plus coalescing batch
//! indexer.
//!
//! Workers drain the priority queue with a short pop timeout so shutdown is
//! prompt. Under backpressure, LOW-priority tasks are dropped outright;
//! HIGH and CRITICAL pass through without delay (a sleeping worker is a
//! deadlock waiting to happen). Extraction runs on the blocking pool with a
//! bounded transient-retry budget; permanent failures drop the task without
//! retry. Recoverable failures re-enter the queue with an incremented retry
//! count up to the task retry budget.
//!
//! The batch indexer coalesces operations until a size or age threshold,
//! delegating to the store's bulk path and falling back to per-document
//! writes when a bulk flush fails. Flush failures are logged, never
//! propagated; from the workers' view those operations were enqueued.

use crate::backpressure::BackpressureController;
use crate::changes::ChangeDetector;
use crate::extract::{ContentExtractor, FailureKind};
use crate::fts::{BulkOp, DocumentStore};
use crate::meta::MetaStore;
use crate::queue::TaskQueue;
use crate::types::{Priority, Task, TaskOp};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Hard cap on the coalescing buffer.
const MAX_BATCH_SIZE: usize = 500;

/// Backoff unit between transient extraction retries.
const EXTRACTION_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Queue name reported to the backpressure controller.
const QUEUE_NAME: &str = "indexing";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub max_retries: u32,
    pub max_extraction_retries: u32,
    pub pop_timeout: Duration,
    pub enable_batching: bool,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub shutdown_flush_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            worker_count: 4,
            max_retries: 3,
            max_extraction_retries: 3,
            pop_timeout: Duration::from_secs(1),
            enable_batching: true,
            batch_size: 50,
            batch_timeout: Duration::from_secs(5),
            shutdown_flush_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineStats {
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub dropped_under_backpressure: u64,
    /// Successful terminal dispositions by priority rank.
    pub processed_by_priority: [u64; 4],
}

// ---------------------------------------------------------------------------
// Batch indexer
// ---------------------------------------------------------------------------

pub struct BatchIndexer {
    store: Arc<DocumentStore>,
    batch: tokio::sync::Mutex<Vec<BulkOp>>,
    batch_size: usize,
    batch_timeout: Duration,
    last_flush: Mutex<Instant>,
}

impl BatchIndexer {
    pub fn new(store: Arc<DocumentStore>, batch_size: usize, batch_timeout: Duration) -> Self {
        BatchIndexer {
            store,
            batch: tokio::sync::Mutex::new(Vec::new()),
            batch_size: batch_size.min(MAX_BATCH_SIZE),
            batch_timeout,
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Add one operation, flushing when the size or age threshold is hit.
    /// Errors only when the buffer is pinned at its hard maximum even after
    /// a forced flush.
    pub async fn add_operation(&self, op: BulkOp) -> crate::error::EngineResult<()> {
        let mut batch = self.batch.lock().await;
        if batch.len() >= MAX_BATCH_SIZE {
            warn!(component = "batch", action = "force_flush", size = batch.len());
            let ops = std::mem::take(&mut *batch);
            drop(batch);
            self.flush_ops(ops).await;
            batch = self.batch.lock().await;
            if batch.len() >= MAX_BATCH_SIZE {
                return Err(crate::error::EngineError::queue(
                    "batch",
                    format!("batch at maximum capacity ({MAX_BATCH_SIZE})"),
                ));
            }
        }

        batch.push(op);
        let age = self.last_flush.lock().unwrap().elapsed();
        let ready = batch.len() >= self.batch_size || age >= self.batch_timeout;
        let ops = ready.then(|| std::mem::take(&mut *batch));
        drop(batch);

        if let Some(ops) = ops {
            self.flush_ops(ops).await;
        }
        Ok(())
    }

    /// Drain and flush whatever is pending.
    pub async fn flush(&self) {
        let ops = std::mem::take(&mut *self.batch.lock().await);
        self.flush_ops(ops).await;
    }

    pub async fn pending(&self) -> usize {
        self.batch.lock().await.len()
    }

    async fn flush_ops(&self, ops: Vec<BulkOp>) {
        if ops.is_empty() {
            return;
        }
        *self.last_flush.lock().unwrap() = Instant::now();

        let store = Arc::clone(&self.store);
        let count = ops.len();
        let result = tokio::task::spawn_blocking(move || {
            if let Err(bulk_err) = store.bulk_index(&ops) {
                // Bulk path failed; degrade to per-document writes so a
                // single poison operation cannot sink the whole batch.
                warn!(component = "batch", action = "bulk_failed", error = %bulk_err, count = ops.len());
                for op in &ops {
                    let per_doc = match op {
                        BulkOp::Upsert(doc) => store.index_document(&doc.path, doc),
                        BulkOp::Delete(path) => store.delete_document(path),
                    };
                    if let Err(e) = per_doc {
                        error!(component = "batch", action = "per_doc_failed", error = %e);
                    }
                }
            }
        })
        .await;

        match result {
            Ok(()) => debug!(component = "batch", action = "flushed", count),
            Err(e) => error!(component = "batch", action = "flush_join_failed", error = %e),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

struct TaskFailure {
    recoverable: bool,
    message: String,
}

pub struct IndexPipeline {
    queue: Arc<TaskQueue>,
    backpressure: Arc<BackpressureController>,
    extractor: Arc<ContentExtractor>,
    store: Arc<DocumentStore>,
    meta: Arc<MetaStore>,
    detector: Arc<ChangeDetector>,
    batch: Option<Arc<BatchIndexer>>,
    config: PipelineConfig,
    stats: Mutex<PipelineStats>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IndexPipeline {
    pub fn new(
        queue: Arc<TaskQueue>,
        backpressure: Arc<BackpressureController>,
        extractor: Arc<ContentExtractor>,
        store: Arc<DocumentStore>,
        meta: Arc<MetaStore>,
        detector: Arc<ChangeDetector>,
        config: PipelineConfig,
    ) -> Self {
        let batch = config.enable_batching.then(|| {
            Arc::new(BatchIndexer::new(Arc::clone(&store), config.batch_size, config.batch_timeout))
        });
        let (shutdown_tx, _) = watch::channel(false);
        IndexPipeline {
            queue,
            backpressure,
            extractor,
            store,
            meta,
            detector,
            batch,
            config,
            stats: Mutex::new(PipelineStats::default()),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        *self.stats.lock().unwrap()
    }

    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            warn!(component = "pipeline", action = "already_running");
            return;
        }
        let _ = self.shutdown_tx.send(false);
        for worker_id in 0..self.config.worker_count {
            let pipeline = Arc::clone(self);
            workers.push(tokio::spawn(async move { pipeline.worker_loop(worker_id).await }));
        }
        info!(component = "pipeline", action = "started", workers = self.config.worker_count);
    }

    /// Signal workers to exit, await them, then run the final batch flush
    /// bounded by the shutdown flush timeout. Pending queue tasks are left
    /// for the scheduler to persist.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    error!(component = "pipeline", action = "worker_panicked", error = %e);
                }
            }
        }
        if let Some(batch) = &self.batch {
            if tokio::time::timeout(self.config.shutdown_flush_timeout, batch.flush())
                .await
                .is_err()
            {
                warn!(component = "pipeline", action = "shutdown_flush_timed_out");
            }
        }
        info!(component = "pipeline", action = "stopped");
    }

    /// Flush any coalesced operations to the store immediately.
    pub async fn flush_batch(&self) {
        if let Some(batch) = &self.batch {
            batch.flush().await;
        }
    }

    /// Wait until the queue is drained and every popped task reached a
    /// terminal disposition, bounded by `timeout`.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.is_empty() {
                let q = self.queue.stats();
                let s = self.stats();
                // Every popped task must have reached a terminal disposition.
                if s.total_processed + s.total_failed + s.dropped_under_backpressure
                    >= q.total_popped
                {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(component = "pipeline", action = "worker_start", worker = worker_id);
        let shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let Some(task) = self.queue.pop(self.config.pop_timeout).await else {
                continue;
            };

            self.backpressure.record_queue_depth(QUEUE_NAME, self.queue.len());
            if task.priority == Priority::Low && self.backpressure.should_throttle() {
                debug!(
                    component = "pipeline",
                    action = "drop_low_under_backpressure",
                    path = task.path.as_str()
                );
                self.stats.lock().unwrap().dropped_under_backpressure += 1;
                continue;
            }

            let start = Instant::now();
            let outcome = self.process_task(&task).await;
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            self.backpressure.record_processing_latency(latency_ms);

            match outcome {
                Ok(()) => {
                    let mut stats = self.stats.lock().unwrap();
                    stats.total_processed += 1;
                    stats.processed_by_priority[task.priority.rank()] += 1;
                    drop(stats);
                    debug!(
                        component = "pipeline",
                        action = "completed",
                        worker = worker_id,
                        task_id = task.id.as_str(),
                        op = task.op.as_str(),
                        latency_ms = latency_ms as u64
                    );
                }
                Err(failure) => {
                    warn!(
                        component = "pipeline",
                        action = "task_failed",
                        worker = worker_id,
                        task_id = task.id.as_str(),
                        path = task.path.as_str(),
                        recoverable = failure.recoverable,
                        error = failure.message.as_str()
                    );
                    // Requeue before the failure is counted so idle
                    // detection never observes a drained queue mid-retry.
                    let mut retried = false;
                    if failure.recoverable && task.retry_count < self.config.max_retries {
                        retried = self.queue.push(task.with_retry());
                    }
                    let mut stats = self.stats.lock().unwrap();
                    stats.total_failed += 1;
                    if retried {
                        stats.total_retried += 1;
                    }
                }
            }
        }
        debug!(component = "pipeline", action = "worker_stop", worker = worker_id);
    }

    async fn process_task(&self, task: &Task) -> Result<(), TaskFailure> {
        match task.op {
            TaskOp::Index | TaskOp::Update => {
                let document = self.extract_with_retries(&task.path).await?;
                let checksum = document.checksum.clone();

                if let Some(batch) = &self.batch {
                    batch.add_operation(BulkOp::Upsert(document)).await.map_err(|e| {
                        TaskFailure { recoverable: true, message: e.to_string() }
                    })?;
                } else {
                    let store = Arc::clone(&self.store);
                    let doc_id = task.path.clone();
                    let doc = document;
                    run_blocking(move || store.index_document(&doc_id, &doc))
                        .await
                        .map_err(|e| TaskFailure { recoverable: recoverable(&e), message: e.to_string() })?;
                }

                // Stored metadata moves to the newly observed state only
                // after the write was accepted.
                let detector = Arc::clone(&self.detector);
                let meta = Arc::clone(&self.meta);
                let rel_path = task.path.clone();
                tokio::task::spawn_blocking(move || {
                    detector.update_after_index(&rel_path, Some(checksum));
                    if let Some(record) = detector.snapshot().get(&rel_path) {
                        if let Err(e) = meta.upsert_file_metadata(&rel_path, record) {
                            warn!(component = "pipeline", action = "meta_update_failed", error = %e);
                        }
                    }
                })
                .await
                .ok();
                Ok(())
            }
            TaskOp::Delete => {
                if let Some(batch) = &self.batch {
                    batch.add_operation(BulkOp::Delete(task.path.clone())).await.map_err(|e| {
                        TaskFailure { recoverable: true, message: e.to_string() }
                    })?;
                } else {
                    let store = Arc::clone(&self.store);
                    let doc_id = task.path.clone();
                    run_blocking(move || store.delete_document(&doc_id))
                        .await
                        .map_err(|e| TaskFailure { recoverable: recoverable(&e), message: e.to_string() })?;
                }
                self.detector.remove(&task.path);
                if let Err(e) = self.meta.delete_file_metadata(&task.path) {
                    warn!(component = "pipeline", action = "meta_delete_failed", error = %e);
                }
                Ok(())
            }
        }
    }

    /// Extraction with a bounded transient-retry loop. Permanent and
    /// validation failures drop the task immediately; an exhausted retry
    /// budget is terminal too (the file is observably unreadable).
    async fn extract_with_retries(&self, rel_path: &str) -> Result<crate::types::Document, TaskFailure> {
        let mut attempt = 0u32;
        loop {
            let extractor = Arc::clone(&self.extractor);
            let path = rel_path.to_string();
            let result = tokio::task::spawn_blocking(move || extractor.extract(&path))
                .await
                .map_err(|e| TaskFailure { recoverable: false, message: format!("extract join: {e}") })?;

            match result {
                Ok(document) => return Ok(document),
                Err(e) if e.kind == FailureKind::Transient && attempt < self.config.max_extraction_retries => {
                    attempt += 1;
                    debug!(
                        component = "pipeline",
                        action = "extract_retry",
                        path = rel_path,
                        attempt,
                        error = e.message.as_str()
                    );
                    tokio::time::sleep(EXTRACTION_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    return Err(TaskFailure { recoverable: false, message: e.message });
                }
            }
        }
    }
}

/// Storage and queue failures are worth another attempt; validation and
/// configuration failures never are.
fn recoverable(error: &crate::error::EngineError) -> bool {
    matches!(
        error,
        crate::error::EngineError::Storage { .. }
            | crate::error::EngineError::Search { .. }
            | crate::error::EngineError::Queue { .. }
            | crate::error::EngineError::Indexing { .. }
    )
}

async fn run_blocking<T, F>(f: F) -> crate::error::EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> crate::error::EngineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| crate::error::EngineError::indexing("pipeline", format!("join: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureConfig;
    use crate::fts::FtsConfig;
    use crate::queue::QueueConfig;
    use crate::stat_cache::StatCache;
    use std::path::Path;

    struct Fixture {
        project: tempfile::TempDir,
        _index_dir: tempfile::TempDir,
        _meta_dir: tempfile::TempDir,
        pipeline: Arc<IndexPipeline>,
        queue: Arc<TaskQueue>,
        store: Arc<DocumentStore>,
        backpressure: Arc<BackpressureController>,
    }

    fn fixture(config: PipelineConfig) -> Fixture {
        let project = tempfile::tempdir().unwrap();
        let index_dir = tempfile::tempdir().unwrap();
        let meta_dir = tempfile::tempdir().unwrap();

        let queue = Arc::new(TaskQueue::new(QueueConfig::default()));
        let backpressure = Arc::new(BackpressureController::new(BackpressureConfig::default()));
        let extractor = Arc::new(ContentExtractor::new(project.path(), 5 * 1024 * 1024));
        let store = Arc::new(DocumentStore::open(index_dir.path(), FtsConfig::default()).unwrap());
        let meta = Arc::new(MetaStore::open(meta_dir.path()).unwrap());
        let detector =
            Arc::new(ChangeDetector::new(project.path(), Arc::new(StatCache::with_defaults()), false));

        let pipeline = Arc::new(IndexPipeline::new(
            Arc::clone(&queue),
            Arc::clone(&backpressure),
            extractor,
            Arc::clone(&store),
            meta,
            detector,
            config,
        ));
        Fixture {
            project,
            _index_dir: index_dir,
            _meta_dir: meta_dir,
            pipeline,
            queue,
            store,
            backpressure,
        }
    }

    fn write(project: &Path, name: &str, content: &str) {
        std::fs::write(project.join(name), content).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn indexes_queued_files_end_to_end() {
        let f = fixture(PipelineConfig { worker_count: 2, ..Default::default() });
        write(f.project.path(), "a.rs", "fn alpha() {}");
        write(f.project.path(), "b.rs", "fn beta() {}");

        f.queue.push(Task::new("a.rs", TaskOp::Index, Priority::Normal));
        f.queue.push(Task::new("b.rs", TaskOp::Index, Priority::Normal));

        f.pipeline.start();
        assert!(f.pipeline.wait_for_idle(Duration::from_secs(10)).await);
        f.pipeline.stop().await;

        assert_eq!(f.pipeline.stats().total_processed, 2);
        assert_eq!(f.store.doc_count(), 2);
        let hits = f.store.search_content("alpha", false, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.rs");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_task_removes_document() {
        let f = fixture(PipelineConfig { worker_count: 1, enable_batching: false, ..Default::default() });
        write(f.project.path(), "gone.rs", "fn soon_gone() {}");

        f.queue.push(Task::new("gone.rs", TaskOp::Index, Priority::Normal));
        f.pipeline.start();
        assert!(f.pipeline.wait_for_idle(Duration::from_secs(10)).await);
        assert_eq!(f.store.doc_count(), 1);

        f.queue.push(Task::new("gone.rs", TaskOp::Delete, Priority::High));
        assert!(f.pipeline.wait_for_idle(Duration::from_secs(10)).await);
        f.pipeline.stop().await;

        assert_eq!(f.store.doc_count(), 0);
        assert!(f.store.search_content("soon_gone", false, 10).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn low_priority_dropped_under_backpressure() {
        let f = fixture(PipelineConfig { worker_count: 1, ..Default::default() });
        write(f.project.path(), "normal.rs", "fn kept() {}");
        write(f.project.path(), "low.rs", "fn dropped() {}");

        // Engage the throttle via a hot latency window.
        for _ in 0..100 {
            f.backpressure.record_processing_latency(6000.0);
        }
        assert!(f.backpressure.should_throttle());

        f.queue.push(Task::new("normal.rs", TaskOp::Index, Priority::Normal));
        f.queue.push(Task::new("low.rs", TaskOp::Index, Priority::Low));

        f.pipeline.start();
        assert!(f.pipeline.wait_for_idle(Duration::from_secs(10)).await);
        f.pipeline.stop().await;

        let stats = f.pipeline.stats();
        assert_eq!(stats.processed_by_priority[Priority::Low.rank()], 0);
        assert_eq!(stats.processed_by_priority[Priority::Normal.rank()], 1);
        assert!(stats.dropped_under_backpressure >= 1);
        assert!(f.store.search_content("dropped", false, 10).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn permanent_failure_is_not_retried() {
        let f = fixture(PipelineConfig { worker_count: 1, enable_batching: false, ..Default::default() });
        // File never exists: extraction fails permanently.
        f.queue.push(Task::new("missing.rs", TaskOp::Index, Priority::Normal));

        f.pipeline.start();
        assert!(f.pipeline.wait_for_idle(Duration::from_secs(10)).await);
        f.pipeline.stop().await;

        let stats = f.pipeline.stats();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_retried, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recoverable_failure_retries_exactly_max_retries() {
        let f = fixture(PipelineConfig {
            worker_count: 1,
            enable_batching: false,
            max_retries: 3,
            ..Default::default()
        });
        write(f.project.path(), "stuck.rs", "fn stuck() {}");
        // Writes fail while the store is down; extraction succeeds.
        f.store.set_forced_down(true);

        f.queue.push(Task::new("stuck.rs", TaskOp::Index, Priority::Normal));
        f.pipeline.start();
        assert!(f.pipeline.wait_for_idle(Duration::from_secs(10)).await);
        f.pipeline.stop().await;

        let stats = f.pipeline.stats();
        // Initial attempt + 3 retries, all failed, nothing further queued.
        assert_eq!(stats.total_retried, 3);
        assert_eq!(stats.total_failed, 4);
        assert!(f.queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_flushes_on_shutdown() {
        let f = fixture(PipelineConfig {
            worker_count: 1,
            batch_size: 50,
            batch_timeout: Duration::from_secs(600),
            ..Default::default()
        });
        write(f.project.path(), "buffered.rs", "fn buffered() {}");
        f.queue.push(Task::new("buffered.rs", TaskOp::Index, Priority::Normal));

        f.pipeline.start();
        assert!(f.pipeline.wait_for_idle(Duration::from_secs(10)).await);
        // Batch thresholds not reached: the document may still be buffered.
        f.pipeline.stop().await;
        assert_eq!(f.store.doc_count(), 1);
    }
}
