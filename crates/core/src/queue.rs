//! Bounded multi-priority task queue.
//!
//! Heap ordered by `(priority rank, enqueue time, sequence)`: strict FIFO
//! within a priority, no cross-priority ordering beyond rank. Hard limits on
//! both task count and estimated memory (~1 KiB per task). When full, a push
//! makes room by dropping the oldest task of the lowest present priority,
//! walking LOW → NORMAL → HIGH; CRITICAL tasks are never dropped, and a
//! queue full of them rejects the push instead.
//!
//! All state lives behind one short-held lock; waiting happens on a
//! `Notify`, never under the lock.

use crate::types::{Priority, Task};
use serde::Serialize;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Rough per-task footprint used for the memory limit: task struct, path,
/// metadata map, and heap overhead.
const TASK_MEMORY_ESTIMATE: usize = 1024;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_memory_bytes: usize,
    /// Optional soft cap per priority level.
    pub max_per_priority: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_size: 10_000,
            max_memory_bytes: 100 * 1024 * 1024,
            max_per_priority: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub total_pushed: u64,
    pub total_popped: u64,
    pub total_dropped: u64,
    pub priority_counts: [usize; 4],
    pub max_size: usize,
    pub max_memory_bytes: usize,
    pub estimated_memory_bytes: usize,
    pub utilization_percent: f64,
    pub memory_utilization_percent: f64,
}

struct HeapEntry {
    rank: usize,
    enqueued_at: u64,
    seq: u64,
    task: Task,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.rank, self.enqueued_at, self.seq).cmp(&(other.rank, other.enqueued_at, other.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    counts: [usize; 4],
    seq: u64,
    total_pushed: u64,
    total_popped: u64,
    total_dropped: u64,
}

pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        TaskQueue { inner: Mutex::new(Inner::default()), notify: Notify::new(), config }
    }

    pub fn with_defaults() -> Self {
        TaskQueue::new(QueueConfig::default())
    }

    /// Enqueue a task. Returns false when the queue is at a hard limit and
    /// no droppable (non-CRITICAL) task exists, or a soft per-priority cap
    /// is hit. The caller must drop the task.
    pub fn push(&self, task: Task) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let size = inner.heap.len();
        let memory = size * TASK_MEMORY_ESTIMATE;
        if size >= self.config.max_size || memory >= self.config.max_memory_bytes {
            if !Self::make_room(&mut inner) {
                warn!(
                    component = "queue",
                    action = "hard_limit_reached",
                    size,
                    memory_bytes = memory,
                    path = task.path.as_str(),
                    op = task.op.as_str(),
                    "queue full of CRITICAL tasks, rejecting push"
                );
                return false;
            }
            inner.total_dropped += 1;
        }

        if let Some(cap) = self.config.max_per_priority {
            if inner.counts[task.priority.rank()] >= cap {
                warn!(
                    component = "queue",
                    action = "priority_full",
                    priority = task.priority.as_str(),
                    cap,
                    path = task.path.as_str(),
                    "per-priority cap hit, rejecting push"
                );
                return false;
            }
        }

        let rank = task.priority.rank();
        let entry = HeapEntry { rank, enqueued_at: task.enqueued_at, seq: inner.seq, task };
        inner.seq += 1;
        inner.counts[rank] += 1;
        inner.total_pushed += 1;
        inner.heap.push(Reverse(entry));
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Drop the oldest task of the lowest present priority. CRITICAL is
    /// untouchable; returns false when nothing can be dropped.
    fn make_room(inner: &mut Inner) -> bool {
        let victim_priority = [Priority::Low, Priority::Normal, Priority::High]
            .into_iter()
            .find(|p| inner.counts[p.rank()] > 0);
        let Some(priority) = victim_priority else {
            return false;
        };
        if priority != Priority::Low {
            warn!(
                component = "queue",
                action = "drop_to_make_room",
                priority = priority.as_str(),
                "dropping non-LOW task under capacity pressure"
            );
        }

        let rank = priority.rank();
        let mut entries: Vec<HeapEntry> =
            std::mem::take(&mut inner.heap).into_iter().map(|Reverse(e)| e).collect();
        // Oldest of that priority = smallest sequence number.
        let victim = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.rank == rank)
            .min_by_key(|(_, e)| (e.enqueued_at, e.seq))
            .map(|(i, _)| i);
        if let Some(i) = victim {
            let dropped = entries.swap_remove(i);
            inner.counts[rank] -= 1;
            debug!(
                component = "queue",
                action = "dropped_task",
                priority = priority.as_str(),
                path = dropped.task.path.as_str()
            );
        }
        inner.heap = entries.into_iter().map(Reverse).collect();
        true
    }

    /// Pop the highest-priority task, waiting up to `timeout` when empty.
    pub async fn pop(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_pop() {
                return Some(task);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            // The Notify permit covers a push racing this wait; the timeout
            // bounds everything else.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
            if Instant::now() >= deadline {
                return self.try_pop();
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let Reverse(entry) = inner.heap.pop()?;
        inner.counts[entry.rank] -= 1;
        inner.total_popped += 1;
        Some(entry.task)
    }

    /// Remove every queued task for a path (file deleted before its index
    /// task ran). Returns how many were removed.
    pub fn remove_by_path(&self, path: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let entries: Vec<HeapEntry> =
            std::mem::take(&mut inner.heap).into_iter().map(|Reverse(e)| e).collect();
        let before = entries.len();
        let mut kept = Vec::with_capacity(before);
        for entry in entries {
            if entry.task.path == path {
                inner.counts[entry.rank] -= 1;
            } else {
                kept.push(entry);
            }
        }
        let removed = before - kept.len();
        inner.total_dropped += removed as u64;
        inner.heap = kept.into_iter().map(Reverse).collect();
        if removed > 0 {
            debug!(component = "queue", action = "remove_by_path", path, count = removed);
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.heap.len();
        inner.heap.clear();
        inner.counts = [0; 4];
        inner.total_dropped += dropped as u64;
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let size = inner.heap.len();
        let memory = size * TASK_MEMORY_ESTIMATE;
        QueueStats {
            size,
            total_pushed: inner.total_pushed,
            total_popped: inner.total_popped,
            total_dropped: inner.total_dropped,
            priority_counts: inner.counts,
            max_size: self.config.max_size,
            max_memory_bytes: self.config.max_memory_bytes,
            estimated_memory_bytes: memory,
            utilization_percent: percent(size, self.config.max_size),
            memory_utilization_percent: percent(memory, self.config.max_memory_bytes),
        }
    }
}

fn percent(value: usize, max: usize) -> f64 {
    if max == 0 {
        0.0
    } else {
        (value as f64 / max as f64 * 100.0 * 100.0).round() / 100.0
    }
}
