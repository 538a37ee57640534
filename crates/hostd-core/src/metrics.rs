use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Coordinator-wide counters, shared across the queue, workers, reconciler,
/// and monitor. Exposed on the metrics endpoint.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub tasks_enqueued: AtomicU64,
    pub tasks_succeeded: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub reconcile_ticks: AtomicU64,
    pub samples_collected: AtomicU64,
    pub drift_alerts: AtomicU64,
    pub threshold_breaches: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_enqueued: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
    pub reconcile_ticks: u64,
    pub samples_collected: u64,
    pub drift_alerts: u64,
    pub threshold_breaches: u64,
}

impl CoordinatorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            reconcile_ticks: self.reconcile_ticks.load(Ordering::Relaxed),
            samples_collected: self.samples_collected.load(Ordering::Relaxed),
            drift_alerts: self.drift_alerts.load(Ordering::Relaxed),
            threshold_breaches: self.threshold_breaches.load(Ordering::Relaxed),
        }
    }
}
