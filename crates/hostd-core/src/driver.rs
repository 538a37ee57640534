//! Thin adapter over the Docker control API.
//!
//! Every call is bounded by a per-call timeout and classified into the
//! coordinator error taxonomy: connection failures and timeouts are
//! transient, a vanished handle is `NotFound`, and a rejected container
//! config is `InvalidSpec`. `stop` and `remove` are idempotent; repeating
//! them converges on the same observed state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use hostd_common::{CoordinatorError, HostingInstance, Result};
use tracing::{info, instrument};

/// Seconds the runtime gets to stop a container before it is killed.
const STOP_GRACE_SECS: i64 = 10;

/// What the runtime reports for a container handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    Exited,
    Missing,
}

/// Control surface for the container runtime. Mutations go through queue
/// workers only; the reconciler and the API layer never call this directly.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn create(&self, instance: &HostingInstance) -> Result<String>;
    async fn start(&self, handle: &str) -> Result<()>;
    async fn stop(&self, handle: &str) -> Result<()>;
    async fn remove(&self, handle: &str) -> Result<()>;
    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus>;
}

/// One-shot resource usage for a running container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstanceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

/// Read-only introspection boundary for the resource monitor, kept apart
/// from [`ContainerDriver`] so the monitor never holds a mutating handle.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn usage(&self, handle: &str) -> Result<InstanceUsage>;
}

#[derive(Clone)]
pub struct DockerDriver {
    docker: Arc<Docker>,
    call_timeout: Duration,
}

impl DockerDriver {
    pub fn new(docker: Arc<Docker>, call_timeout: Duration) -> Self {
        Self {
            docker,
            call_timeout,
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, BollardError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_runtime_error(err)),
            Err(_) => Err(self.timeout_error()),
        }
    }

    fn timeout_error(&self) -> CoordinatorError {
        CoordinatorError::RuntimeUnavailable(format!(
            "container runtime call timed out after {:?}",
            self.call_timeout
        ))
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id, image = %instance.spec.image))]
    async fn create(&self, instance: &HostingInstance) -> Result<String> {
        let spec = &instance.spec;

        let mut labels = HashMap::new();
        labels.insert("hostd.instance".to_string(), instance.id.to_string());
        labels.insert("hostd.owner".to_string(), instance.owner.clone());

        let host_config = HostConfig {
            memory: spec.memory_limit_bytes.map(|b| b as i64),
            nano_cpus: spec.cpu_limit_millis.map(|m| m as i64 * 1_000_000),
            ..Default::default()
        };

        let exposed_ports = spec.port.map(|p| {
            let mut ports = HashMap::new();
            ports.insert(format!("{p}/tcp"), HashMap::new());
            ports
        });

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: spec.env_vars.clone(),
            labels: Some(labels),
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("hostd-{}", instance.id),
            ..Default::default()
        };

        let created = self
            .call(self.docker.create_container(Some(options), config))
            .await?;
        info!(handle = %created.id, "Container created");
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn start(&self, handle: &str) -> Result<()> {
        let fut = self
            .docker
            .start_container(handle, None::<StartContainerOptions<String>>);
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(())) => Ok(()),
            // 304: already running.
            Ok(Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            })) => Ok(()),
            Ok(Err(err)) => Err(map_runtime_error(err)),
            Err(_) => Err(self.timeout_error()),
        }
    }

    #[instrument(skip(self))]
    async fn stop(&self, handle: &str) -> Result<()> {
        let fut = self
            .docker
            .stop_container(handle, Some(StopContainerOptions { t: STOP_GRACE_SECS }));
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(())) => Ok(()),
            // 304: already stopped.
            Ok(Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            })) => Ok(()),
            Ok(Err(err)) => Err(map_runtime_error(err)),
            Err(_) => Err(self.timeout_error()),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, handle: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let fut = self.docker.remove_container(handle, Some(options));
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(())) => Ok(()),
            // Already gone; removal is idempotent.
            Ok(Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            })) => Ok(()),
            Ok(Err(err)) => Err(map_runtime_error(err)),
            Err(_) => Err(self.timeout_error()),
        }
    }

    #[instrument(skip(self))]
    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus> {
        match self
            .call(
                self.docker
                    .inspect_container(handle, None::<InspectContainerOptions>),
            )
            .await
        {
            Ok(details) => {
                let running = details
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    RuntimeStatus::Running
                } else {
                    RuntimeStatus::Exited
                })
            }
            Err(CoordinatorError::NotFound(_)) => Ok(RuntimeStatus::Missing),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl UsageSource for DockerDriver {
    async fn usage(&self, handle: &str) -> Result<InstanceUsage> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(handle, Some(options));
        let stats = match tokio::time::timeout(self.call_timeout, stream.next()).await {
            Ok(Some(Ok(stats))) => stats,
            Ok(Some(Err(err))) => return Err(map_runtime_error(err)),
            Ok(None) => {
                return Err(CoordinatorError::RuntimeUnavailable(format!(
                    "no stats returned for {handle}"
                )))
            }
            Err(_) => return Err(self.timeout_error()),
        };
        Ok(usage_from_stats(&stats))
    }
}

fn usage_from_stats(stats: &Stats) -> InstanceUsage {
    let cpu_percent = cpu_percent_from(
        stats.cpu_stats.cpu_usage.total_usage,
        stats.precpu_stats.cpu_usage.total_usage,
        stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        stats.cpu_stats.online_cpus.unwrap_or(1),
    );
    let memory_bytes = stats.memory_stats.usage.unwrap_or(0);
    let disk_bytes = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| entries.iter().map(|e| e.value).sum())
        .unwrap_or(0);
    InstanceUsage {
        cpu_percent,
        memory_bytes,
        disk_bytes,
    }
}

fn cpu_percent_from(
    cpu_total: u64,
    precpu_total: u64,
    system: u64,
    presystem: u64,
    online_cpus: u64,
) -> f64 {
    let cpu_delta = cpu_total.saturating_sub(precpu_total);
    let system_delta = system.saturating_sub(presystem);
    if system_delta == 0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * online_cpus.max(1) as f64 * 100.0
}

fn map_runtime_error(err: BollardError) -> CoordinatorError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            // A 404 normally means the handle is gone, but create answers
            // 404 for an unknown image, which is a spec problem.
            404 if message.contains("No such image") => CoordinatorError::InvalidSpec(message),
            404 => CoordinatorError::NotFound(message),
            400 => CoordinatorError::InvalidSpec(message),
            409 => CoordinatorError::Conflict(message),
            _ => CoordinatorError::RuntimeUnavailable(message),
        },
        other => CoordinatorError::RuntimeUnavailable(other.to_string()),
    }
}
