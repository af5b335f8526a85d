//! Durable metadata on sqlite: per-file stat records for the change
//! detector, file version history, diffs, and a plain key-value cache sink.
//!
//! Two databases under the settings directory: `metadata.db` and `cache.db`.
//! Both run WAL journaling with `synchronous = FULL` so every committed
//! operation is durable on its own. Bulk metadata writes are single
//! transactions. The consistency probe (`document_count`) lets the engine
//! compare row counts against the full-text index at construction time;
//! integrity work never runs on the search hot path.

use crate::changes::FileRecord;
use crate::error::{EngineError, EngineResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileVersion {
    pub version: i64,
    pub content_hash: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileDiff {
    pub from_version: i64,
    pub to_version: i64,
    pub diff: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetaStats {
    pub file_rows: u64,
    pub version_rows: u64,
    pub kv_rows: u64,
}

pub struct MetaStore {
    metadata: Mutex<Connection>,
    cache: Mutex<Connection>,
}

impl MetaStore {
    /// Open (or create) `metadata.db` and `cache.db` under `dir`.
    pub fn open(dir: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            EngineError::storage("meta", format!("create settings dir: {e}"))
                .with_context("dir", dir.display().to_string())
        })?;

        let metadata = open_database(&dir.join("metadata.db"))?;
        metadata
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS file_metadata (
                    path  TEXT PRIMARY KEY,
                    size  INTEGER NOT NULL,
                    mtime INTEGER NOT NULL,
                    hash  TEXT
                );
                CREATE TABLE IF NOT EXISTS file_versions (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    path         TEXT NOT NULL,
                    version      INTEGER NOT NULL,
                    content_hash TEXT NOT NULL,
                    created_at   INTEGER NOT NULL,
                    UNIQUE(path, version)
                );
                CREATE INDEX IF NOT EXISTS idx_versions_path ON file_versions(path);
                CREATE TABLE IF NOT EXISTS file_diffs (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    path         TEXT NOT NULL,
                    from_version INTEGER NOT NULL,
                    to_version   INTEGER NOT NULL,
                    diff         TEXT NOT NULL,
                    created_at   INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_diffs_path ON file_diffs(path);",
            )
            .map_err(sql_err)?;

        let cache = open_database(&dir.join("cache.db"))?;
        cache
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS kv_cache (
                    key        TEXT PRIMARY KEY,
                    value      BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );",
            )
            .map_err(sql_err)?;

        Ok(MetaStore { metadata: Mutex::new(metadata), cache: Mutex::new(cache) })
    }

    // -----------------------------------------------------------------------
    // File metadata (change detector backing)
    // -----------------------------------------------------------------------

    pub fn load_file_metadata(&self) -> EngineResult<HashMap<String, FileRecord>> {
        let conn = self.metadata.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT path, size, mtime, hash FROM file_metadata")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    FileRecord {
                        size: row.get::<_, i64>(1)? as u64,
                        mtime: row.get(2)?,
                        hash: row.get(3)?,
                    },
                ))
            })
            .map_err(sql_err)?;

        let mut map = HashMap::new();
        for row in rows {
            let (path, record) = row.map_err(sql_err)?;
            map.insert(path, record);
        }
        Ok(map)
    }

    pub fn upsert_file_metadata(&self, path: &str, record: &FileRecord) -> EngineResult<()> {
        let conn = self.metadata.lock().unwrap();
        conn.execute(
            "INSERT INTO file_metadata (path, size, mtime, hash) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET size = ?2, mtime = ?3, hash = ?4",
            params![path, record.size as i64, record.mtime, record.hash],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Replace the whole metadata table in one transaction.
    pub fn replace_file_metadata(&self, records: &HashMap<String, FileRecord>) -> EngineResult<()> {
        let mut conn = self.metadata.lock().unwrap();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute("DELETE FROM file_metadata", []).map_err(sql_err)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO file_metadata (path, size, mtime, hash) VALUES (?1, ?2, ?3, ?4)")
                .map_err(sql_err)?;
            for (path, record) in records {
                stmt.execute(params![path, record.size as i64, record.mtime, record.hash])
                    .map_err(sql_err)?;
            }
        }
        tx.commit().map_err(sql_err)?;
        debug!(component = "meta", action = "replace_metadata", rows = records.len());
        Ok(())
    }

    pub fn delete_file_metadata(&self, path: &str) -> EngineResult<()> {
        let conn = self.metadata.lock().unwrap();
        conn.execute("DELETE FROM file_metadata WHERE path = ?1", params![path])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Row count, compared against the FTS document count at startup.
    pub fn document_count(&self) -> EngineResult<u64> {
        let conn = self.metadata.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(sql_err)
    }

    // -----------------------------------------------------------------------
    // Versions and diffs
    // -----------------------------------------------------------------------

    /// Append a version row for the path; returns the new version number.
    pub fn put_version(&self, path: &str, content_hash: &str) -> EngineResult<i64> {
        let conn = self.metadata.lock().unwrap();
        let next: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM file_versions WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        conn.execute(
            "INSERT INTO file_versions (path, version, content_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![path, next, content_hash, epoch_secs()],
        )
        .map_err(sql_err)?;
        Ok(next)
    }

    pub fn versions(&self, path: &str) -> EngineResult<Vec<FileVersion>> {
        let conn = self.metadata.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT version, content_hash, created_at FROM file_versions
                 WHERE path = ?1 ORDER BY version",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![path], |row| {
                Ok(FileVersion {
                    version: row.get(0)?,
                    content_hash: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn put_diff(
        &self,
        path: &str,
        from_version: i64,
        to_version: i64,
        diff: &str,
    ) -> EngineResult<()> {
        let conn = self.metadata.lock().unwrap();
        conn.execute(
            "INSERT INTO file_diffs (path, from_version, to_version, diff, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![path, from_version, to_version, diff, epoch_secs()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn diffs(&self, path: &str) -> EngineResult<Vec<FileDiff>> {
        let conn = self.metadata.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT from_version, to_version, diff, created_at FROM file_diffs
                 WHERE path = ?1 ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![path], |row| {
                Ok(FileDiff {
                    from_version: row.get(0)?,
                    to_version: row.get(1)?,
                    diff: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    // -----------------------------------------------------------------------
    // Key-value sink (cache.db)
    // -----------------------------------------------------------------------

    pub fn kv_put(&self, key: &str, value: &[u8]) -> EngineResult<()> {
        let conn = self.cache.lock().unwrap();
        conn.execute(
            "INSERT INTO kv_cache (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, epoch_secs()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let conn = self.cache.lock().unwrap();
        conn.query_row("SELECT value FROM kv_cache WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(sql_err)
    }

    pub fn kv_delete(&self, key: &str) -> EngineResult<()> {
        let conn = self.cache.lock().unwrap();
        conn.execute("DELETE FROM kv_cache WHERE key = ?1", params![key]).map_err(sql_err)?;
        Ok(())
    }

    pub fn stats(&self) -> EngineResult<MetaStats> {
        let file_rows = self.document_count()?;
        let version_rows = {
            let conn = self.metadata.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM file_versions", [], |row| row.get::<_, i64>(0))
                .map_err(sql_err)? as u64
        };
        let kv_rows = {
            let conn = self.cache.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM kv_cache", [], |row| row.get::<_, i64>(0))
                .map_err(sql_err)? as u64
        };
        Ok(MetaStats { file_rows, version_rows, kv_rows })
    }
}

/// Per-op durability: WAL journaling with synchronous = FULL.
fn open_database(path: &Path) -> EngineResult<Connection> {
    let conn = Connection::open(path).map_err(|e| {
        EngineError::storage("meta", format!("open database: {e}"))
            .with_context("path", path.display().to_string())
    })?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
        .map_err(sql_err)?;
    conn.pragma_update(None, "synchronous", "FULL").map_err(sql_err)?;
    Ok(conn)
}

fn sql_err(e: rusqlite::Error) -> EngineError {
    EngineError::storage("meta", e.to_string())
}

fn epoch_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
