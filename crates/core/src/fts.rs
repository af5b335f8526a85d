//! Indexed-document store on tantivy.
//!
//! Schema: `file_id` (exact), `path` (tokenized), `content` (tokenized with
//! positions for phrase search), `language`/`checksum` (exact),
//! `last_modified`/`size` (stored numerics). BM25 scoring; the k1/b knobs
//! are validated against their allowed ranges at construction.
//!
//! Writes go through a single internal writer. `index_document` is an
//! idempotent replace (delete-by-term then add); `bulk_index` applies a
//! whole batch under one commit. Queries pass through the pattern-safety
//! gate before anything reaches the regex engine, and recent results are
//! memoized in an LRU+TTL cache that is conservatively invalidated by
//! substring on every write.

use crate::error::{EngineError, EngineResult};
use crate::pattern::{translate, QueryKind};
use crate::types::{Document, Metadata, SearchHit};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, Query, QueryParser, RegexQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING, TEXT,
};
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument, Term};
use tracing::{debug, error, warn};

/// Characters of content stored as the hit preview.
const PREVIEW_CHARS: usize = 200;

/// Writer heap budget.
const WRITER_MEMORY_BYTES: usize = 50_000_000;

#[derive(Debug, Clone)]
pub struct FtsConfig {
    pub cache_enabled: bool,
    pub cache_max_size: usize,
    pub cache_ttl: Duration,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl Default for FtsConfig {
    fn default() -> Self {
        FtsConfig {
            cache_enabled: true,
            cache_max_size: 128,
            cache_ttl: Duration::from_secs(300),
            bm25_k1: 1.2,
            bm25_b: 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FtsStats {
    pub documents: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_entries: usize,
    pub healthy: bool,
}

/// One operation inside a bulk batch.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Upsert(Document),
    Delete(String),
}

#[derive(Clone, Copy)]
struct Fields {
    file_id: Field,
    path: Field,
    content: Field,
    language: Field,
    last_modified: Field,
    size: Field,
    checksum: Field,
}

/// LRU+TTL memo of recent query results, keyed by
/// `(query_type, query, is_pattern)`.
struct SearchCache {
    content: LruCache<String, (Instant, Vec<SearchHit>)>,
    paths: LruCache<String, (Instant, Vec<String>)>,
    ttl: Duration,
}

impl SearchCache {
    fn new(max_size: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).unwrap();
        SearchCache { content: LruCache::new(cap), paths: LruCache::new(cap), ttl }
    }

    fn key(query: &str, is_pattern: bool) -> String {
        format!("{is_pattern}|{query}")
    }

    fn get_content(&mut self, query: &str, is_pattern: bool) -> Option<Vec<SearchHit>> {
        let key = Self::key(query, is_pattern);
        match self.content.get(&key) {
            Some((at, hits)) if at.elapsed() < self.ttl => Some(hits.clone()),
            Some(_) => {
                self.content.pop(&key);
                None
            }
            None => None,
        }
    }

    fn get_paths(&mut self, query: &str, is_pattern: bool) -> Option<Vec<String>> {
        let key = Self::key(query, is_pattern);
        match self.paths.get(&key) {
            Some((at, paths)) if at.elapsed() < self.ttl => Some(paths.clone()),
            Some(_) => {
                self.paths.pop(&key);
                None
            }
            None => None,
        }
    }

    fn put_content(&mut self, query: &str, is_pattern: bool, hits: Vec<SearchHit>) {
        self.content.put(Self::key(query, is_pattern), (Instant::now(), hits));
    }

    fn put_paths(&mut self, query: &str, is_pattern: bool, paths: Vec<String>) {
        self.paths.put(Self::key(query, is_pattern), (Instant::now(), paths));
    }

    /// Conservative invalidation on a write touching `path`: drop entries
    /// whose query relates to the path by substring either way, and any
    /// entry whose cached results mention the path. Over-invalidation is
    /// fine; serving a deleted document is not.
    fn invalidate_for_path(&mut self, path: &str) {
        let query_related = |key: &str| {
            let query = key.split_once('|').map(|(_, q)| q).unwrap_or(key);
            !query.is_empty() && (path.contains(query) || query.contains(path))
        };
        let stale: Vec<String> = self
            .content
            .iter()
            .filter(|(key, (_, hits))| {
                query_related(key) || hits.iter().any(|h| h.path == path)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.content.pop(&key);
        }
        let stale: Vec<String> = self
            .paths
            .iter()
            .filter(|(key, (_, paths))| query_related(key) || paths.iter().any(|p| p == path))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.paths.pop(&key);
        }
    }

    fn clear(&mut self) {
        self.content.clear();
        self.paths.clear();
    }

    fn len(&self) -> usize {
        self.content.len() + self.paths.len()
    }
}

pub struct DocumentStore {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter<TantivyDocument>>,
    fields: Fields,
    cache: Option<Mutex<SearchCache>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// Health override, flipped on unrecoverable engine errors (and by
    /// tests exercising degradation).
    forced_down: AtomicBool,
}

impl DocumentStore {
    /// Open (or create) the index under `dir`.
    pub fn open(dir: &Path, config: FtsConfig) -> EngineResult<Self> {
        if !(0.0..10.0).contains(&config.bm25_k1) || config.bm25_k1 <= 0.0 {
            return Err(EngineError::configuration("fts", "bm25_k1 out of range (0, 10)")
                .with_context("k1", config.bm25_k1.to_string()));
        }
        if !(0.0..=1.0).contains(&config.bm25_b) {
            return Err(EngineError::configuration("fts", "bm25_b out of range [0, 1]")
                .with_context("b", config.bm25_b.to_string()));
        }
        if (config.bm25_k1 - 1.2).abs() > f32::EPSILON || (config.bm25_b - 0.75).abs() > f32::EPSILON {
            // The engine scores with its built-in BM25 parameters; accepted
            // values outside the defaults are recorded but not applied.
            warn!(component = "fts", action = "bm25_defaults_in_effect", k1 = config.bm25_k1, b = config.bm25_b);
        }

        std::fs::create_dir_all(dir).map_err(|e| {
            EngineError::storage("fts", format!("create index dir: {e}"))
                .with_context("dir", dir.display().to_string())
        })?;

        let mut builder = Schema::builder();
        let file_id = builder.add_text_field("file_id", STRING | STORED);
        let path = builder.add_text_field("path", TEXT | STORED);
        let content_indexing = TextFieldIndexing::default()
            .set_tokenizer("default")
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        let content_options = TextOptions::default().set_stored().set_indexing_options(content_indexing);
        let content = builder.add_text_field("content", content_options);
        let language = builder.add_text_field("language", STRING | STORED);
        let last_modified = builder.add_i64_field("last_modified", STORED);
        let size = builder.add_u64_field("size", STORED);
        let checksum = builder.add_text_field("checksum", STRING | STORED);
        let schema = builder.build();

        let directory = MmapDirectory::open(dir).map_err(|e| {
            EngineError::storage("fts", format!("open index dir: {e}"))
                .with_context("dir", dir.display().to_string())
        })?;
        let index = Index::open_or_create(directory, schema)
            .map_err(|e| EngineError::storage("fts", format!("open index: {e}")))?;
        let writer = index
            .writer(WRITER_MEMORY_BYTES)
            .map_err(|e| EngineError::storage("fts", format!("create writer: {e}")))?;
        let reader = index
            .reader()
            .map_err(|e| EngineError::storage("fts", format!("create reader: {e}")))?;

        let cache = config
            .cache_enabled
            .then(|| Mutex::new(SearchCache::new(config.cache_max_size, config.cache_ttl)));

        Ok(DocumentStore {
            index,
            reader,
            writer: Mutex::new(writer),
            fields: Fields { file_id, path, content, language, last_modified, size, checksum },
            cache,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            forced_down: AtomicBool::new(false),
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Idempotent replace: any existing document under the id is removed in
    /// the same commit.
    pub fn index_document(&self, doc_id: &str, document: &Document) -> EngineResult<()> {
        self.ensure_healthy()?;
        {
            let mut writer = self.writer.lock().unwrap();
            writer.delete_term(Term::from_field_text(self.fields.file_id, doc_id));
            writer
                .add_document(self.to_tantivy(document))
                .map_err(|e| EngineError::storage("fts", format!("add document: {e}")))?;
            writer
                .commit()
                .map_err(|e| EngineError::storage("fts", format!("commit: {e}")))?;
        }
        self.after_write(&[doc_id.to_string()]);
        Ok(())
    }

    /// Delete-by-term + add. Same mechanics as `index_document`, kept as a
    /// distinct operation for callers that track update vs. create.
    pub fn update_document(&self, doc_id: &str, document: &Document) -> EngineResult<()> {
        self.index_document(doc_id, document)
    }

    pub fn delete_document(&self, doc_id: &str) -> EngineResult<()> {
        self.ensure_healthy()?;
        {
            let mut writer = self.writer.lock().unwrap();
            writer.delete_term(Term::from_field_text(self.fields.file_id, doc_id));
            writer
                .commit()
                .map_err(|e| EngineError::storage("fts", format!("commit delete: {e}")))?;
        }
        self.after_write(&[doc_id.to_string()]);
        Ok(())
    }

    /// Apply a whole batch atomically: everything lands in one commit, and a
    /// failed add rolls the batch back.
    pub fn bulk_index(&self, ops: &[BulkOp]) -> EngineResult<()> {
        self.ensure_healthy()?;
        let mut touched = Vec::with_capacity(ops.len());
        {
            let mut writer = self.writer.lock().unwrap();
            for op in ops {
                match op {
                    BulkOp::Upsert(document) => {
                        writer.delete_term(Term::from_field_text(self.fields.file_id, &document.path));
                        if let Err(e) = writer.add_document(self.to_tantivy(document)) {
                            // A failed add means the writer's worker died;
                            // nothing from this batch is committed and the
                            // store reports unhealthy until reopened.
                            self.forced_down.store(true, Ordering::SeqCst);
                            return Err(EngineError::storage("fts", format!("bulk add: {e}"))
                                .with_context("path", document.path.clone()));
                        }
                        touched.push(document.path.clone());
                    }
                    BulkOp::Delete(doc_id) => {
                        writer.delete_term(Term::from_field_text(self.fields.file_id, doc_id));
                        touched.push(doc_id.clone());
                    }
                }
            }
            writer
                .commit()
                .map_err(|e| EngineError::storage("fts", format!("bulk commit: {e}")))?;
        }
        debug!(component = "fts", action = "bulk_commit", operations = ops.len());
        self.after_write(&touched);
        Ok(())
    }

    pub fn clear(&self) -> EngineResult<()> {
        {
            let mut writer = self.writer.lock().unwrap();
            writer
                .delete_all_documents()
                .map_err(|e| EngineError::storage("fts", format!("clear: {e}")))?;
            writer
                .commit()
                .map_err(|e| EngineError::storage("fts", format!("commit clear: {e}")))?;
        }
        if let Some(cache) = &self.cache {
            cache.lock().unwrap().clear();
        }
        self.reload();
        Ok(())
    }

    /// Merge segments down to one. Off the search hot path by construction.
    pub fn optimize(&self) -> EngineResult<()> {
        let segment_ids = self
            .index
            .searchable_segment_ids()
            .map_err(|e| EngineError::storage("fts", format!("segment ids: {e}")))?;
        if segment_ids.len() > 1 {
            let mut writer = self.writer.lock().unwrap();
            writer
                .merge(&segment_ids)
                .wait()
                .map_err(|e| EngineError::storage("fts", format!("merge: {e}")))?;
        }
        self.reload();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Full-text search over document content.
    pub fn search_content(
        &self,
        query: &str,
        is_pattern: bool,
        limit: usize,
    ) -> EngineResult<Vec<SearchHit>> {
        self.ensure_healthy()?;
        if let Some(cache) = &self.cache {
            if let Some(hits) = cache.lock().unwrap().get_content(query, is_pattern) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hits);
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let Some(parsed) = self.build_query(self.fields.content, query, is_pattern)? else {
            return Ok(Vec::new());
        };

        let searcher = self.reader.searcher();
        let top = searcher
            .search(&parsed, &TopDocs::with_limit(limit.max(1)))
            .map_err(|e| EngineError::search("fts", format!("search: {e}")))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| EngineError::search("fts", format!("fetch doc: {e}")))?;
            if let Some(hit) = self.to_hit(&doc, score) {
                hits.push(hit);
            }
        }

        if let Some(cache) = &self.cache {
            if !hits.is_empty() {
                cache.lock().unwrap().put_content(query, is_pattern, hits.clone());
            }
        }
        Ok(hits)
    }

    /// Search over indexed paths, returning matching paths only.
    pub fn search_file_paths(
        &self,
        query: &str,
        is_pattern: bool,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        self.ensure_healthy()?;
        if let Some(cache) = &self.cache {
            if let Some(paths) = cache.lock().unwrap().get_paths(query, is_pattern) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(paths);
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let Some(parsed) = self.build_query(self.fields.path, query, is_pattern)? else {
            return Ok(Vec::new());
        };

        let searcher = self.reader.searcher();
        let top = searcher
            .search(&parsed, &TopDocs::with_limit(limit.max(1)))
            .map_err(|e| EngineError::search("fts", format!("path search: {e}")))?;

        let mut paths = Vec::with_capacity(top.len());
        for (_score, address) in top {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| EngineError::search("fts", format!("fetch doc: {e}")))?;
            if let Some(path) = doc.get_first(self.fields.path).and_then(|v| v.as_str()) {
                paths.push(path.to_string());
            }
        }

        if let Some(cache) = &self.cache {
            if !paths.is_empty() {
                cache.lock().unwrap().put_paths(query, is_pattern, paths.clone());
            }
        }
        Ok(paths)
    }

    /// Availability probe for the degradation coordinator.
    pub fn healthy(&self) -> bool {
        if self.forced_down.load(Ordering::SeqCst) {
            return false;
        }
        let searcher = self.reader.searcher();
        searcher.search(&AllQuery, &TopDocs::with_limit(1)).is_ok()
    }

    /// Force the health probe down/up. Unrecoverable engine errors flip this;
    /// tests use it to exercise the fallback chain.
    pub fn set_forced_down(&self, down: bool) {
        self.forced_down.store(down, Ordering::SeqCst);
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn stats(&self) -> FtsStats {
        FtsStats {
            documents: self.doc_count(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_entries: self.cache.as_ref().map(|c| c.lock().unwrap().len()).unwrap_or(0),
            healthy: self.healthy(),
        }
    }

    pub fn close(self) -> EngineResult<()> {
        let writer = self.writer.into_inner().unwrap();
        writer
            .wait_merging_threads()
            .map_err(|e| EngineError::storage("fts", format!("close: {e}")))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_healthy(&self) -> EngineResult<()> {
        if self.forced_down.load(Ordering::SeqCst) {
            return Err(EngineError::search("fts", "backend unavailable"));
        }
        Ok(())
    }

    fn to_tantivy(&self, document: &Document) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_text(self.fields.file_id, &document.path);
        doc.add_text(self.fields.path, &document.path);
        doc.add_text(self.fields.content, &document.content);
        if let Some(language) = &document.language {
            doc.add_text(self.fields.language, language);
        }
        doc.add_i64(self.fields.last_modified, document.mtime);
        doc.add_u64(self.fields.size, document.size);
        doc.add_text(self.fields.checksum, &document.checksum);
        doc
    }

    fn to_hit(&self, doc: &TantivyDocument, score: f32) -> Option<SearchHit> {
        let path = doc.get_first(self.fields.path).and_then(|v| v.as_str())?.to_string();
        let content = doc.get_first(self.fields.content).and_then(|v| v.as_str()).unwrap_or("");
        let mut metadata = Metadata::new();
        if let Some(language) = doc.get_first(self.fields.language).and_then(|v| v.as_str()) {
            metadata.insert("language".to_string(), language.to_string());
        }
        if let Some(mtime) = doc.get_first(self.fields.last_modified).and_then(|v| v.as_i64()) {
            metadata.insert("last_modified".to_string(), mtime.to_string());
        }
        if let Some(size) = doc.get_first(self.fields.size).and_then(|v| v.as_u64()) {
            metadata.insert("size".to_string(), size.to_string());
        }
        if let Some(checksum) = doc.get_first(self.fields.checksum).and_then(|v| v.as_str()) {
            metadata.insert("checksum".to_string(), checksum.to_string());
        }
        Some(SearchHit {
            path,
            lexical_score: score,
            content_preview: content.chars().take(PREVIEW_CHARS).collect(),
            metadata,
        })
    }

    /// Translate and build the executable query. `Ok(None)` means a rejected
    /// pattern: return empty without touching the engine.
    fn build_query(
        &self,
        field: Field,
        query: &str,
        is_pattern: bool,
    ) -> EngineResult<Option<Box<dyn Query>>> {
        let built: Box<dyn Query> = match translate(query, is_pattern) {
            QueryKind::Rejected => return Ok(None),
            QueryKind::All => Box::new(AllQuery),
            QueryKind::Term(term) => {
                let parser = QueryParser::for_index(&self.index, vec![field]);
                let (parsed, errors) = parser.parse_query_lenient(&term);
                if !errors.is_empty() {
                    debug!(component = "fts", action = "lenient_parse", query = term.as_str(), errors = errors.len());
                }
                parsed
            }
            QueryKind::Phrase(phrase) => {
                let parser = QueryParser::for_index(&self.index, vec![field]);
                let quoted = format!("\"{}\"", phrase.replace('"', " "));
                let (parsed, _) = parser.parse_query_lenient(&quoted);
                parsed
            }
            QueryKind::Prefix(prefix) => {
                let pattern = format!("{}.*", regex::escape(&prefix.to_lowercase()));
                Box::new(RegexQuery::from_pattern(&pattern, field).map_err(|e| {
                    EngineError::search("fts", format!("prefix query: {e}"))
                })?)
            }
            QueryKind::Regex(pattern) => {
                match RegexQuery::from_pattern(&pattern, field) {
                    Ok(q) => Box::new(q),
                    Err(e) => {
                        // Engine-level regex error is a backend failure class,
                        // but for the caller it is just an empty result.
                        error!(component = "fts", action = "regex_rejected_by_engine", error = %e);
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(built))
    }

    fn after_write(&self, touched_paths: &[String]) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap();
            for path in touched_paths {
                cache.invalidate_for_path(path);
            }
        }
        self.reload();
    }

    fn reload(&self) {
        if let Err(e) = self.reader.reload() {
            error!(component = "fts", action = "reader_reload_failed", error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str, content: &str) -> Document {
        Document {
            path: path.to_string(),
            content: content.to_string(),
            language: Some("rust".to_string()),
            mtime: 1_700_000_000,
            size: content.len() as u64,
            checksum: format!("{:x}", sha2::Sha256::digest(content.as_bytes())),
        }
    }

    use sha2::Digest;

    fn store() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), FtsConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn index_then_search_finds_document() {
        let (_dir, store) = store();
        store.index_document("src/a.rs", &doc("src/a.rs", "fn main() { println!(\"hello\"); }")).unwrap();
        let hits = store.search_content("hello", false, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/a.rs");
        assert!(hits[0].lexical_score > 0.0);
        assert_eq!(hits[0].metadata.get("language").map(String::as_str), Some("rust"));
    }

    #[test]
    fn reindex_is_idempotent() {
        let (_dir, store) = store();
        let d = doc("src/a.rs", "alpha beta gamma");
        store.index_document("src/a.rs", &d).unwrap();
        store.index_document("src/a.rs", &d).unwrap();
        assert_eq!(store.doc_count(), 1);
        let hits = store.search_content("alpha", false, 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn delete_removes_from_search() {
        let (_dir, store) = store();
        store.index_document("foo.py", &doc("foo.py", "import os\nimport sys")).unwrap();
        assert_eq!(store.search_content("import", false, 10).unwrap().len(), 1);
        store.delete_document("foo.py").unwrap();
        assert!(store.search_content("import", false, 10).unwrap().is_empty());
        assert_eq!(store.doc_count(), 0);
    }

    #[test]
    fn update_replaces_content() {
        let (_dir, store) = store();
        store.index_document("a.txt", &doc("a.txt", "oldword")).unwrap();
        store.update_document("a.txt", &doc("a.txt", "newword")).unwrap();
        assert!(store.search_content("oldword", false, 10).unwrap().is_empty());
        assert_eq!(store.search_content("newword", false, 10).unwrap().len(), 1);
    }

    #[test]
    fn bulk_index_is_one_commit() {
        let (_dir, store) = store();
        let ops = vec![
            BulkOp::Upsert(doc("a.rs", "alpha content")),
            BulkOp::Upsert(doc("b.rs", "beta content")),
            BulkOp::Delete("a.rs".to_string()),
        ];
        store.bulk_index(&ops).unwrap();
        assert_eq!(store.doc_count(), 1);
        assert_eq!(store.search_content("beta", false, 10).unwrap().len(), 1);
    }

    #[test]
    fn phrase_pattern_matches_contains() {
        let (_dir, store) = store();
        store.index_document("a.py", &doc("a.py", "import os and more")).unwrap();
        store.index_document("b.py", &doc("b.py", "os import reversed")).unwrap();
        let hits = store.search_content("%import os%", true, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.py");
    }

    #[test]
    fn prefix_query_matches_terms() {
        let (_dir, store) = store();
        store.index_document("a.rs", &doc("a.rs", "tokenizer setup")).unwrap();
        store.index_document("b.rs", &doc("b.rs", "token stream")).unwrap();
        let hits = store.search_content("token*", false, 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn malicious_pattern_returns_empty() {
        let (_dir, store) = store();
        store.index_document("a.rs", &doc("a.rs", "rm rf everything")).unwrap();
        assert!(store.search_content("; rm -rf /", false, 10).unwrap().is_empty());
        let bomb = format!("(a+)+{}", "a".repeat(1000));
        assert!(store.search_content(&bomb, true, 10).unwrap().is_empty());
    }

    #[test]
    fn search_file_paths_matches_path_tokens() {
        let (_dir, store) = store();
        store.index_document("src/engine/core.rs", &doc("src/engine/core.rs", "x")).unwrap();
        store.index_document("docs/readme.md", &doc("docs/readme.md", "y")).unwrap();
        let paths = store.search_file_paths("engine", false, 10).unwrap();
        assert_eq!(paths, vec!["src/engine/core.rs"]);
    }

    #[test]
    fn result_cache_hits_and_invalidates_on_write() {
        let (_dir, store) = store();
        store.index_document("a.rs", &doc("a.rs", "cached term")).unwrap();
        let first = store.search_content("cached", false, 10).unwrap();
        assert_eq!(first.len(), 1);
        let _second = store.search_content("cached", false, 10).unwrap();
        assert!(store.stats().cache_hits >= 1);

        // A write touching a path related to the query invalidates it.
        store.delete_document("a.rs").unwrap();
        let third = store.search_content("cached", false, 10).unwrap();
        assert!(third.is_empty(), "stale cache entry survived: {third:?}");
    }

    #[test]
    fn forced_down_store_errors_until_restored() {
        let (_dir, store) = store();
        store.set_forced_down(true);
        assert!(!store.healthy());
        assert!(store.search_content("x", false, 10).is_err());
        store.set_forced_down(false);
        assert!(store.healthy());
    }

    #[test]
    fn bm25_knobs_are_range_checked() {
        let dir = tempfile::tempdir().unwrap();
        let bad_k1 = FtsConfig { bm25_k1: 12.0, ..Default::default() };
        assert!(DocumentStore::open(dir.path(), bad_k1).is_err());
        let bad_b = FtsConfig { bm25_b: 1.5, ..Default::default() };
        assert!(DocumentStore::open(dir.path(), bad_b).is_err());
    }

    #[test]
    fn clear_empties_the_index() {
        let (_dir, store) = store();
        store.index_document("a.rs", &doc("a.rs", "something")).unwrap();
        store.clear().unwrap();
        assert_eq!(store.doc_count(), 0);
    }
}
