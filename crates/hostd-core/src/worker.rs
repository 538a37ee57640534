//! Queue workers: the only component that mutates the container runtime.
//!
//! Every operation inspects before acting, so a redelivered task under
//! at-least-once transport converges instead of double-applying. Transient
//! driver failures retry with exponential backoff up to the configured
//! ceiling; exhaustion or a permanent failure marks the task failed and
//! surfaces on the instance as observed `failed` with a last-error summary.
//! A vanished handle is not retried: observed state resets to `unknown`
//! and the reconciler schedules the repair.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hostd_common::{
    CoordinatorConfig, CoordinatorError, DesiredState, HostingInstance, LifecycleTask,
    ObservedState, Result, TaskKind, Uuid,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::{ContainerDriver, RuntimeStatus};
use crate::metrics::CoordinatorMetrics;
use crate::queue::{TaskQueue, TaskReceiver};
use crate::store::StateStore;

const IDLE_RECV_WAIT: Duration = Duration::from_millis(500);

pub struct WorkerPool {
    store: Arc<dyn StateStore>,
    driver: Arc<dyn ContainerDriver>,
    queue: Arc<TaskQueue>,
    receiver: Arc<TaskReceiver>,
    metrics: Arc<CoordinatorMetrics>,
    retry_ceiling: u32,
    retry_base_delay: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn StateStore>,
        driver: Arc<dyn ContainerDriver>,
        queue: Arc<TaskQueue>,
        receiver: Arc<TaskReceiver>,
        metrics: Arc<CoordinatorMetrics>,
        config: &CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            driver,
            queue,
            receiver,
            metrics,
            retry_ceiling: config.retry_ceiling,
            retry_base_delay: config.retry_base_delay,
        })
    }

    /// Spawn `count` worker loops.
    pub fn spawn(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|index| {
                let pool = self.clone();
                tokio::spawn(async move {
                    debug!(worker = index, "Worker started");
                    loop {
                        pool.run_one(IDLE_RECV_WAIT).await;
                    }
                })
            })
            .collect()
    }

    /// Pull and process at most one task; returns whether one was processed.
    pub async fn run_one(&self, wait: Duration) -> bool {
        match self.receiver.recv(wait).await {
            Some(task_id) => {
                self.process(task_id).await;
                true
            }
            None => false,
        }
    }

    /// Process tasks until the queue stays quiet for `wait`. Test harness
    /// entry point; production workers use [`WorkerPool::spawn`].
    pub async fn drain(&self, wait: Duration) -> usize {
        let mut processed = 0;
        while self.run_one(wait).await {
            processed += 1;
        }
        processed
    }

    async fn process(&self, task_id: Uuid) {
        let task = match self.store.claim_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(%task_id, "Task no longer pending, dropping duplicate delivery");
                return;
            }
            Err(err) => {
                error!(%task_id, error = %err, "Failed to claim task");
                return;
            }
        };

        let instance = match self.store.get_instance(task.instance_id) {
            Ok(instance) => instance,
            Err(CoordinatorError::NotFound(_)) => {
                warn!(%task_id, instance_id = %task.instance_id, "Instance record gone, failing task");
                let _ = self.store.fail_task(task.id, "instance record missing");
                return;
            }
            Err(err) => {
                error!(%task_id, error = %err, "Failed to load instance, will retry");
                let _ = self.store.retry_task(task.id, &err.to_string());
                self.schedule_redelivery(task.id, task.attempts);
                return;
            }
        };

        match self.execute(&task, &instance).await {
            Ok(()) => {
                self.metrics.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.store.complete_task(task.id) {
                    error!(%task_id, error = %err, "Failed to mark task succeeded");
                }
                info!(
                    %task_id,
                    instance_id = %instance.id,
                    kind = task.kind.as_str(),
                    attempt = task.attempts,
                    "Task succeeded"
                );
            }
            Err(err @ CoordinatorError::NotFound(_)) => {
                // The handle no longer exists. Reset observed state instead
                // of retrying; the next reconcile tick schedules the repair.
                warn!(
                    %task_id,
                    instance_id = %instance.id,
                    error = %err,
                    "Container handle gone, resetting observed state"
                );
                let _ = self
                    .store
                    .record_observed(instance.id, ObservedState::Unknown, None);
                let _ = self.store.fail_task(task.id, &err.to_string());
                self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if err.is_transient() && task.attempts < self.retry_ceiling => {
                warn!(
                    %task_id,
                    instance_id = %instance.id,
                    attempt = task.attempts,
                    ceiling = self.retry_ceiling,
                    error = %err,
                    "Transient failure, retrying with backoff"
                );
                if self.store.retry_task(task.id, &err.to_string()).is_ok() {
                    self.metrics.tasks_retried.fetch_add(1, Ordering::Relaxed);
                    self.schedule_redelivery(task.id, task.attempts);
                }
            }
            Err(err) => {
                error!(
                    %task_id,
                    instance_id = %instance.id,
                    kind = task.kind.as_str(),
                    attempts = task.attempts,
                    error = %err,
                    "Task failed permanently"
                );
                let _ = self.store.fail_task(task.id, &err.to_string());
                let _ = self.store.record_failure(instance.id, &err.to_string());
                self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn schedule_redelivery(&self, task_id: Uuid, attempts: u32) {
        let delay = backoff_delay(self.retry_base_delay, attempts);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = queue.requeue(task_id) {
                error!(%task_id, error = %err, "Failed to redeliver task");
            }
        });
    }

    async fn execute(&self, task: &LifecycleTask, instance: &HostingInstance) -> Result<()> {
        match task.kind {
            TaskKind::Create => self.run_create(instance).await,
            TaskKind::Start => self.run_start(instance).await,
            TaskKind::Stop => self.run_stop(instance).await,
            TaskKind::Remove => self.run_remove(instance).await,
            TaskKind::HealthCheck => self.run_health_check(instance).await,
        }
    }

    async fn run_create(&self, instance: &HostingInstance) -> Result<()> {
        // A previous attempt may have created the container already.
        if let Some(handle) = instance.container_handle.as_deref() {
            match self.driver.inspect(handle).await? {
                RuntimeStatus::Running => {
                    return self
                        .store
                        .record_observed(instance.id, ObservedState::Running, Some(handle));
                }
                RuntimeStatus::Exited => return self.finish_created(instance, handle).await,
                RuntimeStatus::Missing => {}
            }
        }

        let handle = self.driver.create(instance).await?;
        // Persist the handle before any start attempt so a retry reuses it
        // instead of allocating a second container.
        self.store
            .record_observed(instance.id, ObservedState::Requested, Some(&handle))?;
        self.finish_created(instance, &handle).await
    }

    /// Bring a freshly created (or found-exited) container to the desired
    /// runtime state and record the observation.
    async fn finish_created(&self, instance: &HostingInstance, handle: &str) -> Result<()> {
        match instance.desired {
            DesiredState::Running => {
                self.driver.start(handle).await?;
                self.store
                    .record_observed(instance.id, ObservedState::Running, Some(handle))
            }
            DesiredState::Stopped => {
                self.store
                    .record_observed(instance.id, ObservedState::Stopped, Some(handle))
            }
            _ => self
                .store
                .record_observed(instance.id, ObservedState::Requested, Some(handle)),
        }
    }

    async fn run_start(&self, instance: &HostingInstance) -> Result<()> {
        let handle = require_handle(instance)?;
        match self.driver.inspect(handle).await? {
            RuntimeStatus::Running => {} // duplicate effect, nothing to do
            RuntimeStatus::Exited => self.driver.start(handle).await?,
            RuntimeStatus::Missing => {
                return Err(CoordinatorError::NotFound(format!("container {handle}")))
            }
        }
        self.store
            .record_observed(instance.id, ObservedState::Running, Some(handle))
    }

    async fn run_stop(&self, instance: &HostingInstance) -> Result<()> {
        let handle = require_handle(instance)?;
        match self.driver.inspect(handle).await? {
            RuntimeStatus::Exited => {} // duplicate effect, nothing to do
            RuntimeStatus::Running => self.driver.stop(handle).await?,
            RuntimeStatus::Missing => {
                return Err(CoordinatorError::NotFound(format!("container {handle}")))
            }
        }
        self.store
            .record_observed(instance.id, ObservedState::Stopped, Some(handle))
    }

    async fn run_remove(&self, instance: &HostingInstance) -> Result<()> {
        if let Some(handle) = instance.container_handle.as_deref() {
            self.driver.remove(handle).await?;
        }
        if instance.desired == DesiredState::Deleted {
            self.store
                .record_observed(instance.id, ObservedState::Deleted, None)
        } else {
            // Self-healing teardown: clear the handle so the next reconcile
            // tick provisions a fresh container, and charge the restart
            // budget.
            self.store
                .record_observed(instance.id, ObservedState::Unknown, None)?;
            self.store.bump_restart_count(instance.id)?;
            Ok(())
        }
    }

    async fn run_health_check(&self, instance: &HostingInstance) -> Result<()> {
        let Some(handle) = instance.container_handle.as_deref() else {
            return self
                .store
                .record_observed(instance.id, ObservedState::Unknown, None);
        };
        match self.driver.inspect(handle).await? {
            RuntimeStatus::Running => self
                .store
                .record_observed(instance.id, ObservedState::Running, Some(handle)),
            RuntimeStatus::Exited => self
                .store
                .record_observed(instance.id, ObservedState::Stopped, Some(handle)),
            RuntimeStatus::Missing => {
                Err(CoordinatorError::NotFound(format!("container {handle}")))
            }
        }
    }
}

fn require_handle(instance: &HostingInstance) -> Result<&str> {
    instance.container_handle.as_deref().ok_or_else(|| {
        CoordinatorError::NotFound(format!("instance {} has no container handle", instance.id))
    })
}

/// Exponential backoff, doubling per attempt with a capped exponent.
fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(8);
    base * 2u32.pow(exponent)
}
