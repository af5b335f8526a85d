//! Backpressure controller for the indexing pipeline.
//!
//! Watches the most recent depth of each named queue and a sliding window of
//! the last 100 processing latencies. Throttle engages when either depth or
//! average latency exceeds its threshold, and lifts only once **both** fall
//! below threshold × recovery_factor. The throttle is a drop signal for LOW
//! priority work and a no-op for everything higher; the controller never
//! sleeps a worker.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Latency samples kept in the sliding window.
const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub queue_threshold: usize,
    pub latency_threshold_ms: f64,
    pub recovery_factor: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            queue_threshold: 1000,
            latency_threshold_ms: 5000.0,
            recovery_factor: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackpressureStatus {
    pub queue_depths: HashMap<String, usize>,
    pub avg_processing_latency_ms: f64,
    pub throttled: bool,
    pub queue_threshold: usize,
    pub latency_threshold_ms: f64,
}

struct Inner {
    depths: HashMap<String, usize>,
    latencies: VecDeque<f64>,
    engaged: bool,
}

pub struct BackpressureController {
    config: BackpressureConfig,
    inner: Mutex<Inner>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        BackpressureController {
            config,
            inner: Mutex::new(Inner {
                depths: HashMap::new(),
                latencies: VecDeque::with_capacity(LATENCY_WINDOW),
                engaged: false,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        BackpressureController::new(BackpressureConfig::default())
    }

    pub fn record_queue_depth(&self, queue_name: &str, depth: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.depths.insert(queue_name.to_string(), depth);
    }

    pub fn record_processing_latency(&self, latency_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.latencies.len() == LATENCY_WINDOW {
            inner.latencies.pop_front();
        }
        inner.latencies.push_back(latency_ms);
    }

    /// Should new LOW-priority work be dropped right now?
    pub fn should_throttle(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let max_depth = inner.depths.values().copied().max().unwrap_or(0);
        let avg_latency = average(&inner.latencies);

        if !inner.engaged {
            if max_depth > self.config.queue_threshold {
                warn!(
                    component = "backpressure",
                    action = "throttle_queue",
                    depth = max_depth,
                    threshold = self.config.queue_threshold
                );
                inner.engaged = true;
            } else if avg_latency > self.config.latency_threshold_ms {
                warn!(
                    component = "backpressure",
                    action = "throttle_latency",
                    avg_latency_ms = avg_latency,
                    threshold_ms = self.config.latency_threshold_ms
                );
                inner.engaged = true;
            }
        } else {
            // One-shot recovery: both metrics must drop below the recovery
            // line in the current window.
            let depth_ok =
                (max_depth as f64) < self.config.queue_threshold as f64 * self.config.recovery_factor;
            let latency_ok =
                avg_latency < self.config.latency_threshold_ms * self.config.recovery_factor;
            if depth_ok && latency_ok {
                debug!(
                    component = "backpressure",
                    action = "recovered",
                    depth = max_depth,
                    avg_latency_ms = avg_latency
                );
                inner.engaged = false;
            }
        }

        inner.engaged
    }

    pub fn status(&self) -> BackpressureStatus {
        let throttled = self.should_throttle();
        let inner = self.inner.lock().unwrap();
        BackpressureStatus {
            queue_depths: inner.depths.clone(),
            avg_processing_latency_ms: average(&inner.latencies),
            throttled,
            queue_threshold: self.config.queue_threshold,
            latency_threshold_ms: self.config.latency_threshold_ms,
        }
    }
}

fn average(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_controller_does_not_throttle() {
        let bp = BackpressureController::with_defaults();
        assert!(!bp.should_throttle());
    }

    #[test]
    fn deep_queue_engages_throttle() {
        let bp = BackpressureController::with_defaults();
        bp.record_queue_depth("indexing", 1500);
        assert!(bp.should_throttle());
    }

    #[test]
    fn slow_processing_engages_throttle() {
        let bp = BackpressureController::with_defaults();
        for _ in 0..10 {
            bp.record_processing_latency(6000.0);
        }
        assert!(bp.should_throttle());
    }

    #[test]
    fn recovery_requires_both_metrics_below_line() {
        let bp = BackpressureController::with_defaults();
        bp.record_queue_depth("indexing", 1500);
        for _ in 0..10 {
            bp.record_processing_latency(6000.0);
        }
        assert!(bp.should_throttle());

        // Depth recovers, latency still hot: stay engaged.
        bp.record_queue_depth("indexing", 10);
        assert!(bp.should_throttle());

        // Push the window average below 5000 * 0.8 = 4000.
        for _ in 0..100 {
            bp.record_processing_latency(1.0);
        }
        assert!(!bp.should_throttle());
    }

    #[test]
    fn hysteresis_band_holds_throttle() {
        let bp = BackpressureController::with_defaults();
        bp.record_queue_depth("indexing", 1500);
        assert!(bp.should_throttle());
        // 900 is under the 1000 threshold but above the 800 recovery line.
        bp.record_queue_depth("indexing", 900);
        assert!(bp.should_throttle());
        bp.record_queue_depth("indexing", 700);
        assert!(!bp.should_throttle());
    }

    #[test]
    fn window_is_bounded() {
        let bp = BackpressureController::with_defaults();
        for _ in 0..500 {
            bp.record_processing_latency(10_000.0);
        }
        // Refill the whole window with fast samples; old ones must be gone.
        for _ in 0..100 {
            bp.record_processing_latency(1.0);
        }
        let status = bp.status();
        assert!(status.avg_processing_latency_ms < 10.0);
    }
}
