//! Multi-factor result ranker.
//!
//! Final score = weighted sum of five components, each normalized to [0, 1]:
//! lexical (0.50), recency (0.15), frequency (0.15), path class (0.15), and
//! size (0.05). Path classification runs ordered regex groups, first match
//! wins. The frequency component reads a sliding behavior tracker over the
//! last 100 searches; with tracking disabled it contributes zero.
//!
//! Ranking is deterministic: given the config, the tracker state, and the
//! input hits, identical inputs produce identical ordering (score descending,
//! path ascending as the tiebreak).

use crate::types::{ComponentScores, RankedHit, SearchHit};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

const SECONDS_PER_DAY: f64 = 86_400.0;

// ---------------------------------------------------------------------------
// Path classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathClass {
    CoreSource,
    Config,
    Test,
    Docs,
    Build,
    Deps,
    Assets,
    Unknown,
}

impl PathClass {
    /// Base importance score per class.
    pub fn base_score(self) -> f64 {
        match self {
            PathClass::CoreSource => 1.0,
            PathClass::Config => 0.7,
            PathClass::Test => 0.5,
            PathClass::Docs => 0.4,
            PathClass::Build => 0.3,
            PathClass::Deps => 0.1,
            PathClass::Assets => 0.1,
            PathClass::Unknown => 0.5,
        }
    }
}

struct ClassPatterns {
    deps: Vec<Regex>,
    assets: Vec<Regex>,
    build: Vec<Regex>,
    docs: Vec<Regex>,
    test: Vec<Regex>,
    config: Vec<Regex>,
    source: Vec<Regex>,
}

fn class_patterns() -> &'static ClassPatterns {
    static PATTERNS: OnceLock<ClassPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |patterns: &[&str]| {
            patterns.iter().map(|p| Regex::new(p).expect("class pattern")).collect::<Vec<_>>()
        };
        ClassPatterns {
            deps: compile(&[
                r"^(node_modules/|vendor/|venv/|env/|third_party/|deps/|dependencies/|\.bundle/)",
                r"^\.(git|svn|hg)/",
            ]),
            assets: compile(&[
                r"^(assets/|static/|public/|resources/|media/|images/|fonts/|styles/|css/)",
                r"\.(png|jpg|jpeg|gif|svg|ico|bmp|webp|woff|woff2|ttf|eot|css|scss|less|sass)$",
            ]),
            build: compile(&[
                r"^(build/|scripts/|tools/|\.github/|\.gitlab/|ci/|docker/|k8s/|infrastructure/)",
                r"(?i)(^|/)(makefile|dockerfile|\.dockerignore|\.gitignore|\.gitattributes)$",
                r"\.(sh|bash|zsh|fish)$",
            ]),
            docs: compile(&[
                r"^(docs/|doc/|documentation/|guide/)",
                r"(^|/)(README|CHANGELOG|LICENSE|CONTRIBUTING)",
                r"\.(md|rst|txt)$",
            ]),
            test: compile(&[
                r"^(test/|tests/|__tests__/|spec/|testing/)",
                r"(_test|_spec|\.test|\.spec)\.(py|js|ts|java|go|rs)$",
                r"(^|/)test_[^/]+\.py$",
            ]),
            config: compile(&[
                r"^(\.?config|settings|conf|cfg)/",
                r"\.(json|yaml|yml|toml|ini|conf|cfg|env)$",
                r"(?i)^(package\.json|tsconfig\.json|pyproject\.toml|setup\.py|go\.mod|cargo\.toml)$",
            ]),
            source: compile(&[
                r"^(src/|lib/|app/|main/|core/|server/|client/|crates/)",
                r"\.(py|js|ts|jsx|tsx|java|go|rs|c|cc|cpp|h|hpp|cs|kt|swift|scala|rb|lua)$",
            ]),
        }
    })
}

/// Classify a path. Groups are checked in fixed order, first match wins.
pub fn classify_path(path: &str) -> PathClass {
    let normalized = path.replace('\\', "/");
    let p = class_patterns();
    let matches = |group: &[Regex]| group.iter().any(|re| re.is_match(&normalized));

    if matches(&p.deps) {
        PathClass::Deps
    } else if matches(&p.assets) {
        PathClass::Assets
    } else if matches(&p.build) {
        PathClass::Build
    } else if matches(&p.docs) {
        PathClass::Docs
    } else if matches(&p.test) {
        PathClass::Test
    } else if matches(&p.config) {
        PathClass::Config
    } else if matches(&p.source) {
        PathClass::CoreSource
    } else {
        PathClass::Unknown
    }
}

// ---------------------------------------------------------------------------
// Behavior tracker
// ---------------------------------------------------------------------------

struct TrackerInner {
    /// (query, path) pairs, bounded by the window.
    history: VecDeque<(String, String)>,
    access_counts: HashMap<String, u64>,
    last_access: HashMap<String, i64>,
}

/// Sliding per-path access statistics over the last N searches.
pub struct BehaviorTracker {
    window_size: usize,
    inner: Mutex<TrackerInner>,
}

impl BehaviorTracker {
    pub fn new(window_size: usize) -> Self {
        BehaviorTracker {
            window_size,
            inner: Mutex::new(TrackerInner {
                history: VecDeque::new(),
                access_counts: HashMap::new(),
                last_access: HashMap::new(),
            }),
        }
    }

    pub fn record_search(&self, query: &str, paths: &[String]) {
        let now = epoch_secs();
        let mut inner = self.inner.lock().unwrap();
        for path in paths {
            *inner.access_counts.entry(path.clone()).or_insert(0) += 1;
            inner.last_access.insert(path.clone(), now);
            inner.history.push_back((query.to_string(), path.clone()));
        }
        // Entries falling off the window stop counting.
        while inner.history.len() > self.window_size {
            if let Some((_, old_path)) = inner.history.pop_front() {
                if let Some(count) = inner.access_counts.get_mut(&old_path) {
                    *count -= 1;
                    if *count == 0 {
                        inner.access_counts.remove(&old_path);
                        inner.last_access.remove(&old_path);
                    }
                }
            }
        }
    }

    pub fn access_count(&self, path: &str) -> u64 {
        self.inner.lock().unwrap().access_counts.get(path).copied().unwrap_or(0)
    }

    pub fn last_access(&self, path: &str) -> Option<i64> {
        self.inner.lock().unwrap().last_access.get(path).copied()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.history.clear();
        inner.access_counts.clear();
        inner.last_access.clear();
    }
}

// ---------------------------------------------------------------------------
// Ranker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RankerConfig {
    pub lexical_weight: f64,
    pub recency_weight: f64,
    pub frequency_weight: f64,
    pub path_weight: f64,
    pub size_weight: f64,
    pub recency_half_life_days: f64,
    pub min_access_count: u64,
    pub optimal_size_min: u64,
    pub optimal_size_max: u64,
    pub tracking_window: usize,
    pub enable_tracking: bool,
}

impl Default for RankerConfig {
    fn default() -> Self {
        RankerConfig {
            lexical_weight: 0.50,
            recency_weight: 0.15,
            frequency_weight: 0.15,
            path_weight: 0.15,
            size_weight: 0.05,
            recency_half_life_days: 30.0,
            min_access_count: 2,
            optimal_size_min: 1000,
            optimal_size_max: 100_000,
            tracking_window: 100,
            enable_tracking: true,
        }
    }
}

pub struct Ranker {
    config: RankerConfig,
    tracker: Option<Arc<BehaviorTracker>>,
}

impl Ranker {
    pub fn new(config: RankerConfig) -> Self {
        let tracker =
            config.enable_tracking.then(|| Arc::new(BehaviorTracker::new(config.tracking_window)));
        Ranker { config, tracker }
    }

    pub fn with_defaults() -> Self {
        Ranker::new(RankerConfig::default())
    }

    pub fn tracker(&self) -> Option<&Arc<BehaviorTracker>> {
        self.tracker.as_ref()
    }

    /// Rank hits against the current clock and record the search in the
    /// behavior tracker (after scoring, so the recording never influences
    /// the ordering it produced).
    pub fn rank(&self, hits: Vec<SearchHit>, query: &str) -> Vec<RankedHit> {
        let ranked = self.rank_at(hits, epoch_secs());
        if let Some(tracker) = &self.tracker {
            if !query.trim().is_empty() {
                let paths: Vec<String> = ranked.iter().map(|r| r.path.clone()).collect();
                tracker.record_search(query, &paths);
            }
        }
        ranked
    }

    /// Pure ranking function at an explicit timestamp.
    pub fn rank_at(&self, hits: Vec<SearchHit>, now_secs: i64) -> Vec<RankedHit> {
        let mut ranked: Vec<RankedHit> = hits
            .into_iter()
            .map(|hit| {
                let components = ComponentScores {
                    lexical: self.lexical_component(hit.lexical_score),
                    recency: self.recency_component(&hit, now_secs),
                    frequency: self.frequency_component(&hit.path),
                    path_class: self.path_component(&hit.path),
                    size: self.size_component(&hit),
                };
                let final_score = components.lexical
                    + components.recency
                    + components.frequency
                    + components.path_class
                    + components.size;
                RankedHit { path: hit.path.clone(), final_score, components, original: hit }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        ranked
    }

    /// BM25 scores are unbounded above; squash monotonically into [0, 1)
    /// before clamping.
    fn lexical_component(&self, score: f32) -> f64 {
        let s = score.max(0.0) as f64;
        let normalized = s / (s + 1.0);
        normalized.clamp(0.0, 1.0) * self.config.lexical_weight
    }

    /// `0.5 ^ (days_since_mtime / half_life)`; files with no observable
    /// mtime score the neutral 0.5.
    fn recency_component(&self, hit: &SearchHit, now_secs: i64) -> f64 {
        let raw = match hit.metadata.get("last_modified").and_then(|v| v.parse::<i64>().ok()) {
            Some(mtime) => {
                let days = (now_secs - mtime).max(0) as f64 / SECONDS_PER_DAY;
                0.5_f64.powf(days / self.config.recency_half_life_days)
            }
            None => 0.5,
        };
        raw.clamp(0.0, 1.0) * self.config.recency_weight
    }

    /// `ln(count - min + 2) / 5`, zero below the minimum access count or
    /// with tracking disabled.
    fn frequency_component(&self, path: &str) -> f64 {
        let Some(tracker) = &self.tracker else { return 0.0 };
        let count = tracker.access_count(path);
        if count < self.config.min_access_count {
            return 0.0;
        }
        let raw = (((count - self.config.min_access_count) as f64 + 2.0).ln() / 5.0).min(1.0);
        raw * self.config.frequency_weight
    }

    /// Class base score with a depth penalty of `max(0.7, 1 - 0.02·depth)`
    /// and a small bump for files at the top of a source root.
    fn path_component(&self, path: &str) -> f64 {
        let normalized = path.replace('\\', "/");
        let base = classify_path(&normalized).base_score();
        let depth = normalized.matches('/').count();
        let mut penalty = (1.0 - depth as f64 * 0.02).max(0.7);

        for root in ["src/", "lib/", "app/"] {
            if let Some(rest) = normalized.split_once(root).map(|(_, rest)| rest) {
                if !rest.is_empty() && !rest.contains('/') {
                    penalty *= 1.1;
                }
                break;
            }
        }

        (base * penalty).clamp(0.0, 1.0) * self.config.path_weight
    }

    /// 1.0 inside the optimal band, linear down to 0.3 below it,
    /// logarithmic decay with a 0.3 floor above it.
    fn size_component(&self, hit: &SearchHit) -> f64 {
        let raw = match hit.metadata.get("size").and_then(|v| v.parse::<u64>().ok()) {
            Some(size) if size >= self.config.optimal_size_min && size <= self.config.optimal_size_max => 1.0,
            Some(size) if size < self.config.optimal_size_min => {
                0.3 + 0.7 * size as f64 / self.config.optimal_size_min as f64
            }
            Some(size) => {
                let excess = (size - self.config.optimal_size_max) as f64;
                (1.0 - (excess + 1.0).ln() / 15.0).max(0.3)
            }
            None => 0.5,
        };
        raw.clamp(0.0, 1.0) * self.config.size_weight
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
