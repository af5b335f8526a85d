//! End-to-end scenarios against a real engine on a temporary tree.
//!
//! Each test builds its own project directory, runs the full scan → detect →
//! queue → worker → store dataflow, and validates behavior through the
//! public search surface.

use loupe_core::config::EngineConfig;
use loupe_core::{Engine, Priority};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::time::{Duration, SystemTime};

fn engine_in(dir: &Path) -> Engine {
    Engine::open(dir, EngineConfig::default()).expect("engine open")
}

async fn index_and_settle(engine: &Engine, priority: Priority) -> loupe_core::IndexReport {
    let report = engine.index_incremental(priority).await.expect("index");
    assert!(engine.wait_for_idle(Duration::from_secs(30)).await, "pipeline did not settle");
    engine.flush().await;
    report
}

fn age_file(path: &Path, days: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let past = SystemTime::now() - Duration::from_secs(days * 86_400);
    file.set_modified(past).unwrap();
}

// ---------------------------------------------------------------------------
// Incremental update
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incremental_update_reindexes_only_the_changed_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), "hello").unwrap();
    fs::write(dir.path().join("b.txt"), "world").unwrap();
    // Make b.txt visibly stale so recency separates the two later.
    age_file(&dir.path().join("b.txt"), 60);

    let engine = engine_in(dir.path());
    engine.start();

    let report = index_and_settle(&engine, Priority::Normal).await;
    assert_eq!(report.changes.added.len(), 2);

    fs::write(dir.path().join("a.txt"), "hello world").unwrap();
    let report = index_and_settle(&engine, Priority::Normal).await;
    assert!(report.changes.added.is_empty());
    assert_eq!(report.changes.modified, vec!["a.txt"]);
    assert!(report.changes.deleted.is_empty());
    assert_eq!(report.changes.unchanged, vec!["b.txt"]);

    let response = engine.search("world", false, 10).await;
    assert_eq!(response.degraded_status, "full");
    let paths: Vec<&str> = response.hits.iter().map(|h| h.path.as_str()).collect();
    assert!(paths.contains(&"a.txt") && paths.contains(&"b.txt"), "hits: {paths:?}");
    // Freshly modified a.txt outranks the stale twin on recency.
    assert_eq!(response.hits[0].path, "a.txt");
    assert!(
        response.hits[0].components.recency > response.hits[1].components.recency,
        "recency should separate the hits"
    );

    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Delete removes from search
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_file_disappears_from_search() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("foo.py"), "import os\n\nprint(os.name)\n").unwrap();

    let engine = engine_in(dir.path());
    engine.start();
    index_and_settle(&engine, Priority::Normal).await;

    let response = engine.search("%import os%", true, 10).await;
    assert!(response.hits.iter().any(|h| h.path == "foo.py"), "expected foo.py before delete");

    fs::remove_file(dir.path().join("foo.py")).unwrap();
    let report = index_and_settle(&engine, Priority::Normal).await;
    assert_eq!(report.changes.deleted, vec!["foo.py"]);

    let response = engine.search("%import os%", true, 10).await;
    assert!(
        response.hits.iter().all(|h| h.path != "foo.py"),
        "foo.py still visible: {:?}",
        response.hits
    );

    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Malicious patterns
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malicious_patterns_return_empty_without_execution() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), "rm and rf are just words here").unwrap();

    let engine = engine_in(dir.path());
    engine.start();
    index_and_settle(&engine, Priority::Normal).await;

    let response = engine.search("; rm -rf /", false, 10).await;
    assert!(response.hits.is_empty());
    assert_eq!(response.backend_used, "none");

    let bomb = format!("(a+)+{}", "a".repeat(1200));
    let response = engine.search(&bomb, true, 10).await;
    assert!(response.hits.is_empty());

    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Graceful degradation to line-grep
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_fts_failure_degrades_to_line_grep() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.py"), "def main():\n    return 0\n").unwrap();

    let engine = engine_in(dir.path());
    engine.start();
    index_and_settle(&engine, Priority::Normal).await;

    engine.store().set_forced_down(true);
    let response = engine.search("def main", false, 10).await;

    let has_grep = which::which("rg").is_ok() || which::which("grep").is_ok();
    if has_grep {
        assert_eq!(response.degraded_status, "degraded_search_fallback");
        assert!(
            response.backend_used == "ripgrep" || response.backend_used == "grep",
            "backend: {}",
            response.backend_used
        );
        assert!(response.hits.iter().any(|h| h.path == "main.py"), "hits: {:?}", response.hits);
        assert!(response.fallback_reason.is_some());
    } else {
        assert_eq!(response.degraded_status, "degraded_no_backend");
        assert!(response.hits.is_empty());
    }

    engine.store().set_forced_down(false);
    let response = engine.search("def main", false, 10).await;
    assert_eq!(response.degraded_status, "full");

    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Persistence across engine restarts
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_sees_unchanged_files_as_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("stable.rs"), "fn stable() {}").unwrap();

    {
        let engine = engine_in(dir.path());
        engine.start();
        let report = index_and_settle(&engine, Priority::Normal).await;
        assert_eq!(report.changes.added, vec!["stable.rs"]);
        engine.shutdown().await;
    }

    let engine = engine_in(dir.path());
    engine.start();
    let report = index_and_settle(&engine, Priority::Normal).await;
    assert!(report.changes.added.is_empty(), "added: {:?}", report.changes.added);
    assert_eq!(report.changes.unchanged, vec!["stable.rs"]);

    // The index answers without re-indexing.
    let response = engine.search("stable", false, 10).await;
    assert_eq!(response.hits.len(), 1);
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Ignore rules flow through the whole pipeline
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gitignored_files_never_reach_the_index() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(".gitignore"), "generated.rs\n").unwrap();
    fs::write(dir.path().join("kept.rs"), "fn kept() {}").unwrap();
    fs::write(dir.path().join("generated.rs"), "fn generated() {}").unwrap();
    fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
    fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();

    let engine = engine_in(dir.path());
    engine.start();
    let report = index_and_settle(&engine, Priority::Normal).await;

    assert!(report.changes.added.contains(&"kept.rs".to_string()));
    assert!(!report.changes.added.iter().any(|p| p.contains("generated")));
    assert!(!report.changes.added.iter().any(|p| p.contains("node_modules")));

    assert!(engine.search("generated", false, 10).await.hits.is_empty());
    engine.shutdown().await;
}
