// API types for the hostd coordinator

use chrono::{DateTime, Utc};
use hostd_common::{
    DesiredState, HostingInstance, LifecycleTask, ObservedState, ResourceSample, TaskKind,
    TaskStatus,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error body of synchronous 4xx/5xx responses. Asynchronous failures never
/// surface here; they appear as observed `failed` plus `last_error` on the
/// instance read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub owner: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env_vars: Option<Vec<String>>,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_limit_millis: Option<u64>,
    pub port: Option<u16>,
    /// Start the instance once created. Defaults to true.
    pub start: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceResponse {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    pub image: String,
    pub desired: DesiredState,
    pub observed: ObservedState,
    pub container_handle: Option<String>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<HostingInstance> for InstanceResponse {
    fn from(instance: HostingInstance) -> Self {
        Self {
            id: instance.id,
            name: instance.name,
            owner: instance.owner,
            image: instance.spec.image,
            desired: instance.desired,
            observed: instance.observed,
            container_handle: instance.container_handle,
            restart_count: instance.restart_count,
            last_error: instance.last_error,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// Body of the 202 responses: the write was recorded and work scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub id: Uuid,
    pub desired: DesiredState,
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<LifecycleTask> for TaskResponse {
    fn from(task: LifecycleTask) -> Self {
        Self {
            id: task.id,
            kind: task.kind,
            status: task.status,
            attempts: task.attempts,
            last_error: task.last_error,
            created_at: task.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleResponse {
    pub sampled_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl From<ResourceSample> for SampleResponse {
    fn from(sample: ResourceSample) -> Self {
        Self {
            sampled_at: sample.sampled_at,
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.memory_bytes,
            disk_bytes: sample.disk_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}
