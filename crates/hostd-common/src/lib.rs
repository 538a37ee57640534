// Re-export dependencies used in public interfaces of common types

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid::{self, Uuid};

pub mod config;

pub use config::CoordinatorConfig;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Invalid instance spec: {0}")]
    InvalidSpec(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Transient errors are retried with backoff; everything else either
    /// surfaces to the caller or triggers a state reset.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinatorError::RuntimeUnavailable(_))
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        CoordinatorError::Storage(err.to_string())
    }
}

// Define the primary Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Caller-declared target status for a hosting instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Requested,
    Running,
    Stopped,
    Deleted,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Requested => "requested",
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
            DesiredState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(DesiredState::Requested),
            "running" => Some(DesiredState::Running),
            "stopped" => Some(DesiredState::Stopped),
            "deleted" => Some(DesiredState::Deleted),
            _ => None,
        }
    }
}

/// Last-known actual status as reported by the container driver and the
/// resource monitor. Mirrors [`DesiredState`] plus the failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Requested,
    Running,
    Stopped,
    Deleted,
    Failed,
    Unknown,
}

impl ObservedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedState::Requested => "requested",
            ObservedState::Running => "running",
            ObservedState::Stopped => "stopped",
            ObservedState::Deleted => "deleted",
            ObservedState::Failed => "failed",
            ObservedState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(ObservedState::Requested),
            "running" => Some(ObservedState::Running),
            "stopped" => Some(ObservedState::Stopped),
            "deleted" => Some(ObservedState::Deleted),
            "failed" => Some(ObservedState::Failed),
            "unknown" => Some(ObservedState::Unknown),
            _ => None,
        }
    }

    /// Terminal states need no further corrective work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObservedState::Deleted)
    }
}

/// Desired configuration of the container backing an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstanceSpec {
    pub image: String,
    pub command: Vec<String>,
    pub env_vars: Option<Vec<String>>,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_limit_millis: Option<u64>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostingInstance {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub spec: InstanceSpec,
    pub desired: DesiredState,
    pub observed: ObservedState,
    /// Runtime-assigned container id. Set at most once per creation cycle;
    /// recreation after deletion allocates a new handle.
    pub container_handle: Option<String>,
    pub version: i64,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl HostingInstance {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, spec: InstanceSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            name: name.into(),
            spec,
            desired: DesiredState::Requested,
            observed: ObservedState::Unknown,
            container_handle: None,
            version: 0,
            restart_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            last_reconciled_at: None,
        }
    }

    /// Whether desired and observed disagree. The string representations
    /// line up for the mirrored variants, so a direct comparison suffices.
    pub fn is_drifted(&self) -> bool {
        self.desired.as_str() != self.observed.as_str()
    }
}

/// Closed set of lifecycle operations; each maps onto the container driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Create,
    Start,
    Stop,
    Remove,
    HealthCheck,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Create => "create",
            TaskKind::Start => "start",
            TaskKind::Stop => "stop",
            TaskKind::Remove => "remove",
            TaskKind::HealthCheck => "health-check",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(TaskKind::Create),
            "start" => Some(TaskKind::Start),
            "stop" => Some(TaskKind::Stop),
            "remove" => Some(TaskKind::Remove),
            "health-check" => Some(TaskKind::HealthCheck),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InFlight => "in-flight",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in-flight" => Some(TaskStatus::InFlight),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Pending and in-flight tasks count against the one-active-task rule.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InFlight)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub instance_id: Uuid,
    pub attempts: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleTask {
    pub fn new(kind: TaskKind, instance_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            instance_id,
            attempts: 0,
            status: TaskStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One point of per-instance usage, appended by the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub instance_id: Uuid,
    pub sampled_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}
