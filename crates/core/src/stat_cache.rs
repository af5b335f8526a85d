//! Stat cache: avoids redundant `stat` calls and re-hashing across the
//! scanner, change detector, and batch indexer.
//!
//! LRU map with per-entry TTL. Records are immutable; upgrading an entry
//! with a computed hash replaces it, never mutates it. The internal lock is
//! held only across map operations; filesystem I/O and hashing always happen
//! outside it. All failures are observable through `None` and the counters;
//! the cache never returns an error.

use crate::types::validate_path;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// SHA-256 of the empty input, returned for zero-byte files without any read.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Chunk size for streaming hash computation.
const HASH_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Retry budget for stat calls racing concurrent deletes/moves.
const TOCTOU_MAX_RETRIES: u32 = 3;
const TOCTOU_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Immutable cached stat record.
#[derive(Debug, Clone)]
pub struct StatRecord {
    pub path: String,
    pub size: u64,
    pub mtime: SystemTime,
    /// SHA-256 hex, lazily computed.
    pub hash: Option<String>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl StatRecord {
    /// Entry is valid iff it has not outlived its TTL.
    pub fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) < self.ttl
    }

    /// Fast unchanged check: same size AND same mtime.
    pub fn matches_stat(&self, size: u64, mtime: SystemTime) -> bool {
        self.size == size && self.mtime == mtime
    }

    /// Seconds since epoch, for persistence.
    pub fn mtime_secs(&self) -> i64 {
        self.mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StatCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hash_reuse: u64,
    pub hash_computed: u64,
    pub size: usize,
    pub max_size: usize,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    hash_reuse: u64,
    hash_computed: u64,
}

struct Inner {
    map: LruCache<String, StatRecord>,
    counters: Counters,
}

pub struct StatCache {
    inner: Mutex<Inner>,
    max_size: usize,
    default_ttl: Duration,
}

impl StatCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).unwrap();
        StatCache {
            inner: Mutex::new(Inner { map: LruCache::new(cap), counters: Counters::default() }),
            max_size,
            default_ttl,
        }
    }

    /// Defaults: 10k entries, 300 s TTL.
    pub fn with_defaults() -> Self {
        StatCache::new(10_000, Duration::from_secs(300))
    }

    /// Look up (or refresh) the stat record for a file. Returns `None` for
    /// invalid paths and files that cannot be stat'd after retries.
    pub fn get_stat(&self, path: &str, force: bool) -> Option<StatRecord> {
        if validate_path(path).is_err() {
            return None;
        }

        // Phase 1 (locked): read the candidate.
        let candidate = {
            let mut inner = self.inner.lock().ok()?;
            if force {
                None
            } else {
                inner.map.peek(path).filter(|r| r.is_valid(Instant::now())).cloned()
            }
        };

        // Phase 2 (unlocked): re-stat to verify the candidate.
        if let Some(cached) = candidate {
            match stat_with_retry(Path::new(path)) {
                Some((size, mtime)) if cached.matches_stat(size, mtime) => {
                    let mut inner = self.inner.lock().ok()?;
                    inner.counters.hits += 1;
                    // Touch to move to MRU.
                    let _ = inner.map.get(path);
                    return Some(cached);
                }
                Some(_) => {
                    // File changed underneath the entry.
                    let mut inner = self.inner.lock().ok()?;
                    inner.counters.misses += 1;
                    drop(inner);
                }
                None => {
                    // File disappeared; drop the stale entry.
                    let mut inner = self.inner.lock().ok()?;
                    inner.map.pop(path);
                    inner.counters.misses += 1;
                    return None;
                }
            }
        } else {
            let mut inner = self.inner.lock().ok()?;
            inner.counters.misses += 1;
        }

        // Phase 3 (unlocked): fresh stat, then insert under the lock.
        let (size, mtime) = stat_with_retry(Path::new(path))?;
        let record = StatRecord {
            path: path.to_string(),
            size,
            mtime,
            hash: None,
            cached_at: Instant::now(),
            ttl: self.default_ttl,
        };
        self.insert(record.clone());
        Some(record)
    }

    /// Content hash for a file, reusing the cached value when the stat still
    /// matches. Zero-byte files return the well-known constant without I/O.
    pub fn get_hash(&self, path: &str, known_stat: Option<&StatRecord>) -> Option<String> {
        if validate_path(path).is_err() {
            return None;
        }

        let stat = match known_stat {
            Some(s) => s.clone(),
            None => self.get_stat(path, false)?,
        };

        if let Some(hash) = &stat.hash {
            if let Ok(mut inner) = self.inner.lock() {
                inner.counters.hash_reuse += 1;
            }
            return Some(hash.clone());
        }

        if stat.size == 0 {
            if let Ok(mut inner) = self.inner.lock() {
                inner.counters.hash_computed += 1;
            }
            return Some(EMPTY_SHA256.to_string());
        }

        // Expensive path: stream the file outside any lock.
        let hash = compute_hash(Path::new(path))?;
        if let Ok(mut inner) = self.inner.lock() {
            inner.counters.hash_computed += 1;
        }

        // Upgrade by replacement: immutable records are never mutated.
        let upgraded = StatRecord {
            hash: Some(hash.clone()),
            cached_at: Instant::now(),
            ..stat
        };
        self.insert(upgraded);
        Some(hash)
    }

    pub fn invalidate(&self, path: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.map.pop(path);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.map.clear();
        }
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn cleanup_expired(&self, now: Instant) -> usize {
        let Ok(mut inner) = self.inner.lock() else { return 0 };
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, r)| !r.is_valid(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.map.pop(key);
        }
        if !expired.is_empty() {
            debug!(component = "stat_cache", action = "cleanup_expired", count = expired.len());
        }
        expired.len()
    }

    pub fn stats(&self) -> StatCacheStats {
        let Ok(inner) = self.inner.lock() else { return StatCacheStats::default() };
        StatCacheStats {
            hits: inner.counters.hits,
            misses: inner.counters.misses,
            evictions: inner.counters.evictions,
            hash_reuse: inner.counters.hash_reuse,
            hash_computed: inner.counters.hash_computed,
            size: inner.map.len(),
            max_size: self.max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, record: StatRecord) {
        if let Ok(mut inner) = self.inner.lock() {
            let evicting =
                inner.map.len() >= self.max_size && inner.map.peek(&record.path).is_none();
            if evicting {
                inner.counters.evictions += 1;
            }
            inner.map.put(record.path.clone(), record);
        }
    }
}

/// A single stat, retried on transient failure with linear backoff
/// (1 ms × attempt). Returns (size, mtime).
fn stat_with_retry(path: &Path) -> Option<(u64, SystemTime)> {
    for attempt in 0..TOCTOU_MAX_RETRIES {
        match fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta.modified().ok()?;
                return Some((meta.len(), mtime));
            }
            Err(_) if attempt + 1 < TOCTOU_MAX_RETRIES => {
                std::thread::sleep(TOCTOU_RETRY_DELAY * (attempt + 1));
            }
            Err(e) => {
                debug!(component = "stat_cache", action = "stat_failed", path = %path.display(), error = %e, attempts = TOCTOU_MAX_RETRIES);
                return None;
            }
        }
    }
    None
}

/// SHA-256 of the file content, streamed in 4 MiB chunks.
fn compute_hash(path: &Path) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> String {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn second_lookup_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello");
        let cache = StatCache::with_defaults();
        assert!(cache.get_stat(&path, false).is_some());
        assert!(cache.get_stat(&path, false).is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn invalidate_forces_fresh_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello");
        let cache = StatCache::with_defaults();
        let _ = cache.get_stat(&path, false);
        cache.invalidate(&path);
        let _ = cache.get_stat(&path, false);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn empty_file_hash_is_the_constant() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.txt", b"");
        let cache = StatCache::with_defaults();
        assert_eq!(cache.get_hash(&path, None).as_deref(), Some(EMPTY_SHA256));
    }

    #[test]
    fn hash_is_reused_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello");
        let cache = StatCache::with_defaults();
        let h1 = cache.get_hash(&path, None).unwrap();
        let h2 = cache.get_hash(&path, None).unwrap();
        assert_eq!(h1, h2);
        let stats = cache.stats();
        assert_eq!(stats.hash_computed, 1);
        assert_eq!(stats.hash_reuse, 1);
        // Known digest of "hello".
        assert_eq!(h1, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
    }

    #[test]
    fn missing_file_returns_none() {
        let cache = StatCache::with_defaults();
        assert!(cache.get_stat("/definitely/not/here.txt", false).is_none());
    }

    #[test]
    fn bad_paths_are_rejected_without_io() {
        let cache = StatCache::with_defaults();
        assert!(cache.get_stat("", false).is_none());
        assert!(cache.get_stat("../etc/shadow", false).is_none());
        assert!(cache.get_hash("a\0b", None).is_none());
    }

    #[test]
    fn eviction_counts_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StatCache::new(2, Duration::from_secs(300));
        for name in ["a", "b", "c"] {
            let path = write_file(dir.path(), name, b"x");
            let _ = cache.get_stat(&path, false);
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn cleanup_expired_drops_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello");
        let cache = StatCache::new(10, Duration::from_secs(300));
        let _ = cache.get_stat(&path, false);
        assert_eq!(cache.cleanup_expired(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(cache.cleanup_expired(later), 1);
        assert!(cache.is_empty());
    }
}
