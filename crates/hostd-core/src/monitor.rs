//! Per-instance resource sampling and memory policy.
//!
//! Runs on a fixed interval over every instance observed running, reading
//! one-shot usage through the read-only introspection boundary and
//! appending a sample per instance. The monitor never mutates containers
//! itself: a sustained memory breach emits a single corrective `stop` task
//! and a running instance that yields no stats gets a `health-check` task,
//! leaving all runtime mutation to the queue workers.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hostd_common::{
    CoordinatorConfig, CoordinatorError, HostingInstance, ObservedState, ResourceSample, Result,
    TaskKind,
};
use tracing::{debug, error, warn};

use crate::driver::{InstanceUsage, UsageSource};
use crate::metrics::CoordinatorMetrics;
use crate::queue::TaskQueue;
use crate::store::StateStore;

pub struct ResourceMonitor {
    store: Arc<dyn StateStore>,
    usage: Arc<dyn UsageSource>,
    queue: Arc<TaskQueue>,
    metrics: Arc<CoordinatorMetrics>,
    interval: Duration,
    breach_samples: u32,
    sample_retention: Duration,
    /// Consecutive over-limit samples per instance.
    breach_streaks: Mutex<HashMap<hostd_common::Uuid, u32>>,
}

impl ResourceMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        usage: Arc<dyn UsageSource>,
        queue: Arc<TaskQueue>,
        metrics: Arc<CoordinatorMetrics>,
        config: &CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            usage,
            queue,
            metrics,
            interval: config.sample_interval,
            breach_samples: config.breach_samples,
            sample_retention: config.sample_retention,
            breach_streaks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            if let Err(err) = self.sample_all().await {
                error!(error = %err, "Resource sampling pass failed");
            }
        }
    }

    /// One sampling pass; returns how many samples were collected.
    pub async fn sample_all(&self) -> Result<usize> {
        let mut collected = 0;

        for instance in self.store.list_instances()? {
            if instance.observed != ObservedState::Running {
                continue;
            }
            let Some(handle) = instance.container_handle.as_deref() else {
                continue;
            };

            match self.usage.usage(handle).await {
                Ok(usage) => {
                    self.store.append_sample(&ResourceSample {
                        instance_id: instance.id,
                        sampled_at: Utc::now(),
                        cpu_percent: usage.cpu_percent,
                        memory_bytes: usage.memory_bytes,
                        disk_bytes: usage.disk_bytes,
                    })?;
                    self.metrics.samples_collected.fetch_add(1, Ordering::Relaxed);
                    collected += 1;
                    self.enforce_memory_policy(&instance, usage)?;
                }
                Err(err) => {
                    // Supposedly running but yields no stats: let a worker
                    // re-inspect and correct the observed state.
                    debug!(
                        instance_id = %instance.id,
                        handle,
                        error = %err,
                        "Stats unavailable, scheduling health check"
                    );
                    self.queue
                        .enqueue_if_idle(TaskKind::HealthCheck, instance.id)?;
                }
            }
        }

        let pruned = self.store.prune_samples(self.sample_retention)?;
        if pruned > 0 {
            debug!(count = pruned, "Pruned expired resource samples");
        }
        Ok(collected)
    }

    /// Count consecutive over-limit samples and schedule one corrective
    /// stop when the configured window is breached. The streak resets on
    /// enqueue so a persisting breach yields one task, not one per sample.
    fn enforce_memory_policy(
        &self,
        instance: &HostingInstance,
        usage: InstanceUsage,
    ) -> Result<()> {
        let Some(limit) = instance.spec.memory_limit_bytes else {
            return Ok(());
        };

        let mut streaks = self
            .breach_streaks
            .lock()
            .map_err(|_| CoordinatorError::Internal("breach streak lock poisoned".to_string()))?;
        let streak = streaks.entry(instance.id).or_insert(0);

        if usage.memory_bytes <= limit {
            *streak = 0;
            return Ok(());
        }

        *streak += 1;
        if *streak < self.breach_samples {
            return Ok(());
        }
        *streak = 0;
        drop(streaks);

        warn!(
            instance_id = %instance.id,
            memory_bytes = usage.memory_bytes,
            limit_bytes = limit,
            window = self.breach_samples,
            "Sustained memory breach, scheduling stop"
        );
        self.metrics.threshold_breaches.fetch_add(1, Ordering::Relaxed);
        self.queue.enqueue_if_idle(TaskKind::Stop, instance.id)?;
        Ok(())
    }
}
