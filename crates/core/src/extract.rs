//! Content extraction for the indexing workers.
//!
//! Every extraction starts by resolving the path inside the configured base
//! directory. Known text extensions are read whole (chunked reads behind the
//! scenes, lossy UTF-8). `.pdf` and `.docx` go through a pluggable
//! black-box extractor that returns plain text. Unknown extensions are read
//! as plain text.
//!
//! Failures come back as typed outcomes, not panics: the worker loop
//! pattern-matches Permanent (drop), Transient (retry with backoff), and
//! Validation (reject) without ever unwinding.

use crate::types::{resolve_within, Document};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Classification the worker loop dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Missing file, permission denied, no extractor: drop, never retry.
    Permanent,
    /// I/O hiccups: retry with backoff up to the configured budget.
    Transient,
    /// Rejected at the boundary before any filesystem access.
    Validation,
}

#[derive(Debug, Clone)]
pub struct ExtractError {
    pub kind: FailureKind,
    pub message: String,
}

impl ExtractError {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        ExtractError { kind, message: message.into() }
    }
}

/// Black-box extractor for binary document formats. Implementations return
/// plain text; everything else about the format stays outside the core.
pub trait BinaryExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> std::io::Result<String>;
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "adoc", "rs", "py", "js", "ts", "jsx", "tsx", "mjs", "cjs", "java", "kt",
    "go", "c", "cc", "cpp", "cxx", "h", "hpp", "hxx", "cs", "rb", "lua", "sh", "bash", "zsh",
    "ps1", "sql", "html", "htm", "css", "scss", "less", "json", "yaml", "yml", "toml", "ini",
    "cfg", "conf", "xml", "vue", "svelte", "swift", "scala", "php",
];

const BINARY_EXTENSIONS: &[&str] = &["pdf", "docx"];

pub struct ContentExtractor {
    base_path: PathBuf,
    max_file_size: u64,
    /// Per-extension overrides of the size limit, keyed without the dot.
    type_specific_limits: BTreeMap<String, u64>,
    binary_extractor: Option<Arc<dyn BinaryExtractor>>,
}

impl ContentExtractor {
    pub fn new(base_path: &Path, max_file_size: u64) -> Self {
        ContentExtractor {
            base_path: base_path.to_path_buf(),
            max_file_size,
            type_specific_limits: BTreeMap::new(),
            binary_extractor: None,
        }
    }

    pub fn with_type_limits(mut self, limits: BTreeMap<String, u64>) -> Self {
        self.type_specific_limits = limits;
        self
    }

    pub fn with_binary_extractor(mut self, extractor: Arc<dyn BinaryExtractor>) -> Self {
        self.binary_extractor = Some(extractor);
        self
    }

    /// Extract a document for `rel_path` (relative to the base directory).
    pub fn extract(&self, rel_path: &str) -> Result<Document, ExtractError> {
        let full = resolve_within(&self.base_path, rel_path)
            .map_err(|e| ExtractError::new(FailureKind::Validation, e.to_string()))?;

        let meta = fs::metadata(&full).map_err(|e| self.classify_io(e, &full))?;
        if !meta.is_file() {
            return Err(ExtractError::new(FailureKind::Permanent, "not a regular file"));
        }

        let ext = full.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
        let limit = self.type_specific_limits.get(&ext).copied().unwrap_or(self.max_file_size);
        if meta.len() > limit {
            debug!(component = "extract", action = "skip_oversize", path = rel_path, size = meta.len(), limit);
            return Err(ExtractError::new(
                FailureKind::Permanent,
                format!("file exceeds size limit ({} > {limit} bytes)", meta.len()),
            ));
        }

        let content = if BINARY_EXTENSIONS.contains(&ext.as_str()) {
            match &self.binary_extractor {
                Some(extractor) => extractor
                    .extract(&full)
                    .map_err(|e| self.classify_io(e, &full))?,
                None => {
                    warn!(component = "extract", action = "no_binary_extractor", path = rel_path, ext = ext.as_str());
                    return Err(ExtractError::new(
                        FailureKind::Permanent,
                        format!("no extractor registered for .{ext}"),
                    ));
                }
            }
        } else {
            // Known text extensions and everything unknown: plain text read.
            if !TEXT_EXTENSIONS.contains(&ext.as_str()) && !ext.is_empty() {
                debug!(component = "extract", action = "unknown_extension", path = rel_path, ext = ext.as_str());
            }
            read_text(&full).map_err(|e| self.classify_io(e, &full))?
        };

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let checksum = format!("{:x}", Sha256::digest(content.as_bytes()));

        Ok(Document {
            path: rel_path.to_string(),
            content,
            language: language_for_extension(&ext).map(str::to_string),
            mtime,
            size: meta.len(),
            checksum,
        })
    }

    fn classify_io(&self, error: std::io::Error, path: &Path) -> ExtractError {
        use std::io::ErrorKind;
        let kind = match error.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => FailureKind::Permanent,
            _ => FailureKind::Transient,
        };
        ExtractError::new(kind, format!("{}: {error}", path.display()))
    }
}

/// Whole-file read in chunks, tolerating non-UTF-8 bytes.
fn read_text(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut bytes = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    let lang = match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" | "jsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hxx" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "lua" => "lua",
        "sh" | "bash" | "zsh" => "shell",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sql" => "sql",
        "html" | "htm" => "html",
        "css" | "scss" | "less" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        _ => return None,
    };
    Some(lang)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_file_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        let extractor = ContentExtractor::new(dir.path(), 5 * 1024 * 1024);
        let doc = extractor.extract("main.rs").unwrap();
        assert_eq!(doc.content, "fn main() {}");
        assert_eq!(doc.language.as_deref(), Some("rust"));
        assert_eq!(doc.size, 12);
        assert!(doc.mtime > 0);
        assert_eq!(doc.checksum.len(), 64);
    }

    #[test]
    fn traversal_is_a_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = ContentExtractor::new(dir.path(), 1024);
        let err = extractor.extract("../outside.txt").unwrap_err();
        assert_eq!(err.kind, FailureKind::Validation);
    }

    #[test]
    fn missing_file_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = ContentExtractor::new(dir.path(), 1024);
        let err = extractor.extract("nope.txt").unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }

    #[test]
    fn unknown_extension_reads_as_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.weird"), "payload").unwrap();
        let extractor = ContentExtractor::new(dir.path(), 1024);
        let doc = extractor.extract("data.weird").unwrap();
        assert_eq!(doc.content, "payload");
        assert!(doc.language.is_none());
    }

    #[test]
    fn binary_extension_without_extractor_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.pdf"), b"%PDF-").unwrap();
        let extractor = ContentExtractor::new(dir.path(), 1024);
        let err = extractor.extract("doc.pdf").unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }

    #[test]
    fn pluggable_extractor_handles_binary_formats() {
        struct Fixed;
        impl BinaryExtractor for Fixed {
            fn extract(&self, _path: &Path) -> std::io::Result<String> {
                Ok("converted text".to_string())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.pdf"), b"%PDF-").unwrap();
        let extractor =
            ContentExtractor::new(dir.path(), 1024).with_binary_extractor(Arc::new(Fixed));
        let doc = extractor.extract("doc.pdf").unwrap();
        assert_eq!(doc.content, "converted text");
    }

    #[test]
    fn oversize_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), vec![b'x'; 64]).unwrap();
        let extractor = ContentExtractor::new(dir.path(), 16);
        let err = extractor.extract("big.txt").unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }

    #[test]
    fn per_extension_limit_overrides_global() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.sql"), vec![b'x'; 64]).unwrap();
        let mut limits = BTreeMap::new();
        limits.insert("sql".to_string(), 128u64);
        let extractor = ContentExtractor::new(dir.path(), 16).with_type_limits(limits);
        assert!(extractor.extract("big.sql").is_ok());
    }
}
