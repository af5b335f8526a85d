//! Graceful shutdown manager.
//!
//! Long-running operations register themselves and are awaited (bounded) at
//! shutdown; stragglers get a cancellation signal instead of an unbounded
//! wait. Shutdown hooks then run in registration order, each with its own
//! timeout. The manager never exits the process; that is the shell's job.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type HookFn = Box<dyn FnOnce() -> HookFuture + Send>;

struct Hook {
    name: String,
    timeout: Duration,
    run: HookFn,
}

pub struct ShutdownManager {
    hooks: Mutex<Vec<Hook>>,
    active_ops: Arc<AtomicUsize>,
    op_done: Arc<Notify>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    shutting_down: AtomicBool,
    operation_wait_timeout: Duration,
}

/// RAII registration of an in-flight operation.
pub struct OperationGuard {
    active_ops: Arc<AtomicUsize>,
    op_done: Arc<Notify>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.active_ops.fetch_sub(1, Ordering::SeqCst);
        self.op_done.notify_waiters();
    }
}

impl ShutdownManager {
    pub fn new(operation_wait_timeout: Duration) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        ShutdownManager {
            hooks: Mutex::new(Vec::new()),
            active_ops: Arc::new(AtomicUsize::new(0)),
            op_done: Arc::new(Notify::new()),
            cancel_tx,
            cancel_rx,
            shutting_down: AtomicBool::new(false),
            operation_wait_timeout,
        }
    }

    pub fn with_defaults() -> Self {
        ShutdownManager::new(Duration::from_secs(30))
    }

    /// Track an operation until the returned guard drops. Returns `None`
    /// once shutdown has begun; callers should not start new work.
    pub fn register_operation(&self) -> Option<OperationGuard> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        self.active_ops.fetch_add(1, Ordering::SeqCst);
        Some(OperationGuard {
            active_ops: Arc::clone(&self.active_ops),
            op_done: Arc::clone(&self.op_done),
        })
    }

    /// Cancellation signal for cooperative tasks; flips to true when the
    /// bounded wait expires.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    pub fn active_operations(&self) -> usize {
        self.active_ops.load(Ordering::SeqCst)
    }

    /// Hooks run at shutdown in registration order, each bounded by its own
    /// timeout.
    pub fn add_hook<F, Fut>(&self, name: impl Into<String>, timeout: Duration, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: HookFn = Box::new(move || Box::pin(hook()) as HookFuture);
        self.hooks.lock().unwrap().push(Hook { name: name.into(), timeout, run: hook });
    }

    /// Wait for in-flight operations (bounded), cancel stragglers, then run
    /// the ordered hooks.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(component = "shutdown", action = "begin", active = self.active_operations());

        let deadline = Instant::now() + self.operation_wait_timeout;
        while self.active_ops.load(Ordering::SeqCst) > 0 {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!(
                    component = "shutdown",
                    action = "operations_timed_out",
                    stragglers = self.active_operations(),
                    "cancelling remaining operations"
                );
                break;
            };
            let _ = tokio::time::timeout(remaining, self.op_done.notified()).await;
        }

        let _ = self.cancel_tx.send(true);

        let hooks: Vec<Hook> = std::mem::take(&mut *self.hooks.lock().unwrap());
        for hook in hooks {
            let started = Instant::now();
            match tokio::time::timeout(hook.timeout, (hook.run)()).await {
                Ok(()) => {
                    debug!(
                        component = "shutdown",
                        action = "hook_done",
                        hook = hook.name.as_str(),
                        elapsed_ms = started.elapsed().as_millis() as u64
                    );
                }
                Err(_) => {
                    warn!(
                        component = "shutdown",
                        action = "hook_timed_out",
                        hook = hook.name.as_str(),
                        timeout_ms = hook.timeout.as_millis() as u64
                    );
                }
            }
        }
        info!(component = "shutdown", action = "complete");
    }
}
