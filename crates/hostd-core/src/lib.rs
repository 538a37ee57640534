//! Core engine of the hostd coordinator: the durable state store, the
//! container driver, the lifecycle task queue with its worker pool, the
//! reconciliation loop, and the resource monitor.
//!
//! The store is the single source of truth. The API layer writes desired
//! state and enqueues work; only queue workers touch the container runtime;
//! the reconciler audits drift between the two and schedules corrections.

pub mod driver;
pub mod metrics;
pub mod monitor;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod test_utils;
pub mod worker;

pub use driver::{ContainerDriver, DockerDriver, InstanceUsage, RuntimeStatus, UsageSource};
pub use metrics::{CoordinatorMetrics, MetricsSnapshot};
pub use monitor::ResourceMonitor;
pub use queue::{ChannelTransport, TaskQueue, TaskReceiver, TaskTransport};
pub use reconciler::Reconciler;
pub use store::{SqliteStore, StateStore};
pub use worker::WorkerPool;
