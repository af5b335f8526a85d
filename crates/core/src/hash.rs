//! Parallel content hashing for the change detector.
//!
//! Fans a batch of paths across a rayon pool, reusing the stat cache so
//! unchanged files never get re-read. Results come back in input order; the
//! parallel map keeps positions, no reordering pass needed.

use crate::stat_cache::StatCache;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct HashResult {
    pub path: String,
    /// SHA-256 hex, absent on error.
    pub hash: Option<String>,
    pub size: u64,
    /// Seconds since epoch.
    pub mtime: i64,
    pub computation_time_ms: f64,
    pub error: Option<String>,
}

pub struct ParallelHashComputer {
    stat_cache: Arc<StatCache>,
    pool: rayon::ThreadPool,
}

impl ParallelHashComputer {
    /// Pool size is `min(available cores, configured)`.
    pub fn new(stat_cache: Arc<StatCache>, configured_workers: usize) -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let workers = configured_workers.clamp(1, cores);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("hash-{i}"))
            .build()
            .expect("hash thread pool");
        ParallelHashComputer { stat_cache, pool }
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Hash a batch of absolute paths. Output order matches input order.
    pub fn compute_batch(&self, paths: &[String]) -> Vec<HashResult> {
        let start = Instant::now();
        let results: Vec<HashResult> = self.pool.install(|| {
            paths.par_iter().map(|path| self.compute_one(path)).collect()
        });
        debug!(
            component = "hash",
            action = "batch_done",
            files = paths.len(),
            elapsed_ms = start.elapsed().as_millis() as u64
        );
        results
    }

    fn compute_one(&self, path: &str) -> HashResult {
        let start = Instant::now();
        let Some(stat) = self.stat_cache.get_stat(path, false) else {
            return HashResult {
                path: path.to_string(),
                hash: None,
                size: 0,
                mtime: 0,
                computation_time_ms: elapsed_ms(start),
                error: Some("stat failed".to_string()),
            };
        };

        match self.stat_cache.get_hash(path, Some(&stat)) {
            Some(hash) => HashResult {
                path: path.to_string(),
                hash: Some(hash),
                size: stat.size,
                mtime: stat.mtime_secs(),
                computation_time_ms: elapsed_ms(start),
                error: None,
            },
            None => HashResult {
                path: path.to_string(),
                hash: None,
                size: stat.size,
                mtime: stat.mtime_secs(),
                computation_time_ms: elapsed_ms(start),
                error: Some("hash failed".to_string()),
            },
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
