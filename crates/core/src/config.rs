//! Engine configuration.
//!
//! Hierarchical TOML with `${VAR:-default}` environment substitution. A
//! per-project override file at the repo root deep-merges over the global
//! file. A small JSON global-config store keeps cross-run settings (the
//! registered base path) at the user config path.
//!
//! The persisted index for a base path lives under
//! `<base>/<settings-dir>/<hash-of-base-path>/`.

use crate::error::{EngineError, EngineResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Directory created inside the base path for all persisted engine state.
pub const SETTINGS_DIR_NAME: &str = ".loupe";

/// Per-project override file at the repo root.
pub const PROJECT_CONFIG_FILE: &str = ".loupe.toml";

pub const CONFIG_JSON: &str = "config.json";
pub const INDEX_FILE: &str = "index.msgpack";
pub const LEGACY_INDEX_FILE: &str = "index.pickle";
pub const FTS_DIR: &str = "fts";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileFiltering {
    pub max_file_size: u64,
    /// Per-extension overrides, keyed without the dot.
    pub type_specific_limits: BTreeMap<String, u64>,
}

impl Default for FileFiltering {
    fn default() -> Self {
        FileFiltering { max_file_size: 5 * 1024 * 1024, type_specific_limits: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryFiltering {
    pub max_files_per_directory: Option<usize>,
    pub max_subdirectories_per_directory: Option<usize>,
    /// Glob list of directories to skip outright.
    pub skip_large_directories: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplicitInclusions {
    pub files: Vec<String>,
    pub directories: Vec<String>,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Performance {
    pub parallel_processing: bool,
    pub max_workers: usize,
    pub cache_directory_scans: bool,
    pub log_filtering_decisions: bool,
}

impl Default for Performance {
    fn default() -> Self {
        Performance {
            parallel_processing: true,
            max_workers: 4,
            cache_directory_scans: true,
            log_filtering_decisions: false,
        }
    }
}

/// Consumed only by the degradation coordinator's vector probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStore {
    pub backend_type: Option<String>,
    pub index_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FullText {
    pub index_path: Option<String>,
    pub cache_enabled: bool,
    pub cache_max_size: usize,
    pub cache_ttl_seconds: u64,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl Default for FullText {
    fn default() -> Self {
        FullText {
            index_path: None,
            cache_enabled: true,
            cache_max_size: 128,
            cache_ttl_seconds: 300,
            bm25_k1: 1.2,
            bm25_b: 0.75,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub file_filtering: FileFiltering,
    pub directory_filtering: DirectoryFiltering,
    pub explicit_inclusions: ExplicitInclusions,
    pub performance: Performance,
    pub vector_store: VectorStore,
    pub full_text: FullText,
}

impl EngineConfig {
    /// Load the global file (when present) with the project override file
    /// deep-merged on top. Both pass env substitution first. A missing file
    /// is just defaults, never an error.
    pub fn load(global_path: Option<&Path>, project_root: &Path) -> EngineResult<EngineConfig> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        if let Some(global) = global_path {
            if let Some(value) = read_toml(global)? {
                deep_merge(&mut merged, value);
            }
        }
        let project_file = project_root.join(PROJECT_CONFIG_FILE);
        if let Some(value) = read_toml(&project_file)? {
            debug!(component = "config", action = "project_override", file = %project_file.display());
            deep_merge(&mut merged, value);
        }

        merged.try_into().map_err(|e| {
            EngineError::configuration("config", format!("invalid configuration: {e}"))
        })
    }
}

fn read_toml(path: &Path) -> EngineResult<Option<toml::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EngineError::configuration("config", format!("read {}: {e}", path.display()))
    })?;
    let substituted = substitute_env(&raw);
    let value = toml::from_str(&substituted).map_err(|e| {
        EngineError::configuration("config", format!("parse {}: {e}", path.display()))
    })?;
    Ok(Some(value))
}

/// Expand `${VAR}` and `${VAR:-default}` from the process environment.
pub fn substitute_env(raw: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap());
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) if !value.is_empty() => value,
            _ => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        }
    })
    .into_owned()
}

/// Recursive table merge: overlay wins, tables merge, everything else
/// replaces.
pub fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

// ---------------------------------------------------------------------------
// Global configuration store (JSON, cross-run)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub base_path: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl GlobalConfig {
    pub fn load(path: &Path) -> EngineResult<GlobalConfig> {
        if !path.exists() {
            return Ok(GlobalConfig::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::configuration("config", format!("read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EngineError::configuration("config", format!("parse {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::configuration("config", format!("create {}: {e}", parent.display()))
            })?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::configuration("config", format!("serialize: {e}")))?;
        std::fs::write(path, raw).map_err(|e| {
            EngineError::configuration("config", format!("write {}: {e}", path.display()))
        })
    }
}

/// User config directory: `$XDG_CONFIG_HOME/loupe` or `~/.config/loupe`.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join("loupe"));
        }
    }
    std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".config").join("loupe"))
}

/// Where persisted state for `base_path` lives:
/// `<base>/<settings-dir>/<hash-of-base-path>/`.
pub fn settings_dir(base_path: &Path) -> PathBuf {
    let digest = Sha256::digest(base_path.to_string_lossy().as_bytes());
    let short = format!("{digest:x}")[..16].to_string();
    base_path.join(SETTINGS_DIR_NAME).join(short)
}
