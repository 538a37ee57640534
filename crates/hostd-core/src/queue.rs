//! Asynchronous lifecycle-task queue.
//!
//! `enqueue` persists the task row and pushes its id onto the transport,
//! returning immediately; workers consume on the other side. The durable
//! task table is the source of truth, so the transport only ever carries
//! ids and a restart recovers by re-pushing whatever is still pending.
//! Delivery is at-least-once; the store's claim step suppresses duplicates.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hostd_common::{CoordinatorError, LifecycleTask, Result, TaskKind, Uuid};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::metrics::CoordinatorMetrics;
use crate::store::StateStore;

/// Broker boundary. The in-process channel is the default; an external
/// message broker slots in behind the same trait.
pub trait TaskTransport: Send + Sync {
    fn push(&self, task_id: Uuid) -> Result<()>;
}

pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl ChannelTransport {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            TaskReceiver {
                rx: Mutex::new(rx),
            },
        )
    }
}

impl TaskTransport for ChannelTransport {
    fn push(&self, task_id: Uuid) -> Result<()> {
        self.tx
            .send(task_id)
            .map_err(|_| CoordinatorError::Internal("task channel closed".to_string()))
    }
}

/// Consumer half of the channel transport, shared by the worker pool.
pub struct TaskReceiver {
    rx: Mutex<mpsc::UnboundedReceiver<Uuid>>,
}

impl TaskReceiver {
    /// Wait up to `wait` for the next task id.
    pub async fn recv(&self, wait: Duration) -> Option<Uuid> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }
}

pub struct TaskQueue {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn TaskTransport>,
    metrics: Arc<CoordinatorMetrics>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<dyn TaskTransport>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            store,
            transport,
            metrics,
        }
    }

    /// Queue plus receiver wired over the in-process channel transport.
    pub fn with_channel(
        store: Arc<dyn StateStore>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> (Arc<Self>, Arc<TaskReceiver>) {
        let (transport, receiver) = ChannelTransport::new();
        (
            Arc::new(Self::new(store, Arc::new(transport), metrics)),
            Arc::new(receiver),
        )
    }

    pub fn enqueue(&self, kind: TaskKind, instance_id: Uuid) -> Result<LifecycleTask> {
        let task = LifecycleTask::new(kind, instance_id);
        self.store.insert_task(&task)?;
        self.transport.push(task.id)?;
        self.metrics.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = %task.id, %instance_id, kind = kind.as_str(), "Task enqueued");
        Ok(task)
    }

    /// Enqueue unless the instance already has a pending or in-flight task.
    pub fn enqueue_if_idle(&self, kind: TaskKind, instance_id: Uuid) -> Result<Option<LifecycleTask>> {
        if self.store.has_active_task(instance_id)? {
            return Ok(None);
        }
        self.enqueue(kind, instance_id).map(Some)
    }

    /// Push an already-persisted task id back onto the transport (retry
    /// redelivery after backoff).
    pub fn requeue(&self, task_id: Uuid) -> Result<()> {
        self.transport.push(task_id)
    }

    /// Re-push every pending task row, called once at startup. Redundant
    /// deliveries are harmless; the claim step drops them.
    pub fn recover_pending(&self) -> Result<usize> {
        let ids = self.store.pending_task_ids()?;
        for id in &ids {
            self.transport.push(*id)?;
        }
        Ok(ids.len())
    }
}
