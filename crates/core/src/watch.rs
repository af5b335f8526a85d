//! File watcher for incremental live re-indexing.
//!
//! Watches the base path and converts debounced filesystem events into
//! HIGH-priority tasks on the indexing queue: touched files become index
//! tasks, removals purge any queued work for the path and enqueue a delete.
//! Ignored paths never produce tasks.

use crate::ignore::IgnoreMatcher;
use crate::queue::TaskQueue;
use crate::types::{Priority, Task, TaskOp};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Debounce window: wait this long after the last event before processing.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Start a watcher on `base_path`. Returns the watcher handle (must be kept
/// alive; dropping it stops the watcher) or `None` when the platform
/// watcher cannot be created.
pub fn start_watcher(
    base_path: &Path,
    matcher: Arc<IgnoreMatcher>,
    queue: Arc<TaskQueue>,
) -> Option<RecommendedWatcher> {
    let (tx, rx) = mpsc::channel::<Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(component = "watch", action = "create_failed", error = %e);
            return None;
        }
    };

    if let Err(e) = watcher.watch(base_path, RecursiveMode::Recursive) {
        warn!(component = "watch", action = "watch_failed", path = %base_path.display(), error = %e);
        return None;
    }
    debug!(component = "watch", action = "watching", path = %base_path.display());

    let base = base_path.to_path_buf();
    std::thread::spawn(move || debounce_loop(rx, base, matcher, queue));

    Some(watcher)
}

/// Collect events and enqueue tasks once a path has been quiet for the
/// debounce window.
fn debounce_loop(
    rx: mpsc::Receiver<Event>,
    base_path: PathBuf,
    matcher: Arc<IgnoreMatcher>,
    queue: Arc<TaskQueue>,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        match rx.recv_timeout(DEBOUNCE) {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let now = Instant::now();
                    for path in event.paths {
                        pending.insert(path, now);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - DEBOUNCE;
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, t)| **t <= cutoff)
                    .map(|(p, _)| p.clone())
                    .collect();
                for path in &ready {
                    pending.remove(path);
                }
                for path in ready {
                    enqueue_change(&path, &base_path, &matcher, &queue);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn enqueue_change(
    abs_path: &Path,
    base_path: &Path,
    matcher: &IgnoreMatcher,
    queue: &TaskQueue,
) {
    let Ok(rel) = abs_path.strip_prefix(base_path) else { return };
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.is_empty() || abs_path.is_dir() {
        return;
    }
    if matcher.should_ignore(&rel) {
        return;
    }
    // A path inside an ignored directory never makes it into the index.
    if rel
        .rsplit_once('/')
        .is_some_and(|(dir, _)| matcher.should_ignore_dir(dir))
    {
        return;
    }

    if abs_path.exists() {
        debug!(component = "watch", action = "enqueue_index", path = rel.as_str());
        queue.push(Task::new(rel, TaskOp::Index, Priority::High));
    } else {
        // Drop queued work for the path before the delete lands.
        queue.remove_by_path(&rel);
        debug!(component = "watch", action = "enqueue_delete", path = rel.as_str());
        queue.push(Task::new(rel, TaskOp::Delete, Priority::High));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;

    fn wait_for_task(queue: &TaskQueue, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(task) = queue.try_pop() {
                return Some(task);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        None
    }

    #[test]
    fn burst_of_writes_yields_one_high_priority_task() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = Arc::new(IgnoreMatcher::new(dir.path(), &[]));
        let queue = Arc::new(TaskQueue::new(QueueConfig::default()));
        let _watcher = start_watcher(dir.path(), matcher, Arc::clone(&queue))
            .expect("watcher should start on a tempdir");

        let file = dir.path().join("live.rs");
        std::fs::write(&file, "fn one() {}").unwrap();
        std::fs::write(&file, "fn two() {}").unwrap();
        std::fs::write(&file, "fn three() {}").unwrap();

        let task = wait_for_task(&queue, Duration::from_secs(5)).expect("expected a task");
        assert_eq!(task.path, "live.rs");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.op, TaskOp::Index);

        // The burst collapsed into a single task.
        std::thread::sleep(Duration::from_millis(1200));
        assert!(queue.try_pop().is_none(), "debounce should collapse the burst");
    }

    #[test]
    fn removal_enqueues_delete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doomed.rs"), "fn doomed() {}").unwrap();
        let matcher = Arc::new(IgnoreMatcher::new(dir.path(), &[]));
        let queue = Arc::new(TaskQueue::new(QueueConfig::default()));
        let _watcher = start_watcher(dir.path(), matcher, Arc::clone(&queue)).unwrap();

        std::fs::remove_file(dir.path().join("doomed.rs")).unwrap();

        let task = wait_for_task(&queue, Duration::from_secs(5)).expect("expected a task");
        assert_eq!(task.path, "doomed.rs");
        assert_eq!(task.op, TaskOp::Delete);
    }

    #[test]
    fn ignored_paths_produce_no_tasks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        let matcher = Arc::new(IgnoreMatcher::new(dir.path(), &[]));
        let queue = Arc::new(TaskQueue::new(QueueConfig::default()));
        let _watcher = start_watcher(dir.path(), matcher, Arc::clone(&queue)).unwrap();

        std::fs::write(dir.path().join("node_modules/pkg.js"), "x").unwrap();
        std::fs::write(dir.path().join("trace.log"), "y").unwrap();

        assert!(wait_for_task(&queue, Duration::from_secs(2)).is_none());
    }
}
