//! Durable state for instances, lifecycle tasks, and resource samples.
//!
//! The store is the single source of truth: the API layer writes desired
//! state through it, workers and the reconciler write observed state through
//! it, and every component reads through it rather than caching mutable
//! state locally. Desired-state writes carry an optimistic version check;
//! all other writes serialize on the store's connection.

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use std::time::Duration;

use hostd_common::{
    HostingInstance, LifecycleTask, ObservedState, ResourceSample, Result, Uuid,
};

pub trait StateStore: Send + Sync {
    /// Insert a new instance or update the desired spec/state of an
    /// existing one. The caller's `version` must match the stored row;
    /// a mismatch means a concurrent desired-state write won and yields
    /// `Conflict`. Returns the stored row with its bumped version.
    fn upsert_desired_state(&self, instance: &HostingInstance) -> Result<HostingInstance>;

    fn get_instance(&self, id: Uuid) -> Result<HostingInstance>;

    fn list_instances(&self) -> Result<Vec<HostingInstance>>;

    /// Instances whose desired and observed states disagree.
    fn list_drifted(&self) -> Result<Vec<HostingInstance>>;

    /// Record what the container runtime reported. `handle` replaces the
    /// stored container handle outright (`None` clears it).
    fn record_observed(&self, id: Uuid, state: ObservedState, handle: Option<&str>) -> Result<()>;

    /// Mark the instance failed with a last-error summary for the read path.
    fn record_failure(&self, id: Uuid, error: &str) -> Result<()>;

    /// Count a self-healing restart against the instance's budget.
    fn bump_restart_count(&self, id: Uuid) -> Result<u32>;

    fn touch_reconciled(&self, id: Uuid) -> Result<()>;

    /// Cheap liveness probe for the health endpoint.
    fn health_check(&self) -> Result<()>;

    fn insert_task(&self, task: &LifecycleTask) -> Result<()>;

    fn get_task(&self, id: Uuid) -> Result<LifecycleTask>;

    /// Transition a pending task to in-flight, counting the attempt.
    /// Returns `None` when the task is no longer pending, which is how
    /// duplicate deliveries are suppressed under at-least-once transport.
    fn claim_task(&self, id: Uuid) -> Result<Option<LifecycleTask>>;

    fn complete_task(&self, id: Uuid) -> Result<()>;

    /// Put a task back to pending after a transient failure.
    fn retry_task(&self, id: Uuid, error: &str) -> Result<()>;

    fn fail_task(&self, id: Uuid, error: &str) -> Result<()>;

    /// Whether the instance has a pending or in-flight task.
    fn has_active_task(&self, instance_id: Uuid) -> Result<bool>;

    fn list_tasks(&self, instance_id: Uuid, limit: usize) -> Result<Vec<LifecycleTask>>;

    /// Pending task ids in creation order, for startup re-enqueue.
    fn pending_task_ids(&self) -> Result<Vec<Uuid>>;

    /// Return in-flight tasks older than the cutoff to pending. Covers
    /// workers that died mid-operation; the redelivered task re-inspects
    /// before acting.
    fn reset_stale_in_flight(&self, older_than: Duration) -> Result<usize>;

    fn append_sample(&self, sample: &ResourceSample) -> Result<()>;

    /// Most recent samples first.
    fn list_samples(&self, instance_id: Uuid, limit: usize) -> Result<Vec<ResourceSample>>;

    fn prune_samples(&self, retention: Duration) -> Result<usize>;
}
