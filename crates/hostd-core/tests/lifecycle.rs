//! End-to-end lifecycle tests over the store, queue, workers, reconciler,
//! and monitor, with a scripted in-memory driver standing in for Docker.

use std::sync::Arc;
use std::time::Duration;

use hostd_common::{
    CoordinatorConfig, CoordinatorError, DesiredState, HostingInstance, InstanceSpec,
    ObservedState, TaskKind, TaskStatus,
};
use hostd_core::test_utils::FakeDriver;
use hostd_core::{
    CoordinatorMetrics, InstanceUsage, Reconciler, ResourceMonitor, SqliteStore, StateStore,
    TaskQueue, WorkerPool,
};

const MB: u64 = 1024 * 1024;

struct Harness {
    store: Arc<SqliteStore>,
    driver: Arc<FakeDriver>,
    queue: Arc<TaskQueue>,
    workers: Arc<WorkerPool>,
    reconciler: Arc<Reconciler>,
    monitor: Arc<ResourceMonitor>,
}

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry_base_delay: Duration::from_millis(1),
        ..Default::default()
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: CoordinatorConfig) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let driver = Arc::new(FakeDriver::new());
        let metrics = Arc::new(CoordinatorMetrics::default());
        let (queue, receiver) = TaskQueue::with_channel(store.clone(), metrics.clone());
        let workers = WorkerPool::new(
            store.clone(),
            driver.clone(),
            queue.clone(),
            receiver,
            metrics.clone(),
            &config,
        );
        let reconciler = Reconciler::new(store.clone(), queue.clone(), metrics.clone(), &config);
        let monitor = ResourceMonitor::new(
            store.clone(),
            driver.clone(),
            queue.clone(),
            metrics.clone(),
            &config,
        );
        Self {
            store,
            driver,
            queue,
            workers,
            reconciler,
            monitor,
        }
    }

    fn create_instance(&self, desired: DesiredState, memory_limit: Option<u64>) -> HostingInstance {
        let mut instance = HostingInstance::new(
            "owner-1",
            "web-1",
            InstanceSpec {
                image: "nginx:alpine".to_string(),
                memory_limit_bytes: memory_limit,
                ..Default::default()
            },
        );
        instance.desired = desired;
        self.store.upsert_desired_state(&instance).unwrap()
    }

    /// Run reconcile ticks with worker drains in between.
    async fn converge(&self, rounds: usize) {
        for _ in 0..rounds {
            self.reconciler.tick().unwrap();
            self.workers.drain(Duration::from_millis(50)).await;
        }
    }

    fn instance(&self, id: hostd_common::Uuid) -> HostingInstance {
        self.store.get_instance(id).unwrap()
    }

    fn tasks_of_kind(&self, id: hostd_common::Uuid, kind: TaskKind) -> usize {
        self.store
            .list_tasks(id, 100)
            .unwrap()
            .iter()
            .filter(|t| t.kind == kind)
            .count()
    }
}

#[tokio::test]
async fn unknown_instance_converges_with_exactly_one_create() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);

    // One tick schedules exactly one create task.
    assert_eq!(harness.reconciler.tick().unwrap(), 1);
    assert_eq!(harness.tasks_of_kind(instance.id, TaskKind::Create), 1);

    // A second tick before the worker runs must not pile on more tasks.
    assert_eq!(harness.reconciler.tick().unwrap(), 0);
    assert_eq!(harness.store.list_tasks(instance.id, 100).unwrap().len(), 1);

    harness.workers.drain(Duration::from_millis(50)).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Running);
    assert!(stored.container_handle.is_some());

    // Converged: the next tick schedules nothing.
    assert_eq!(harness.reconciler.tick().unwrap(), 0);
    assert_eq!(harness.store.list_tasks(instance.id, 100).unwrap().len(), 1);
}

#[tokio::test]
async fn observed_follows_desired_across_stop_start_delete() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);
    harness.converge(1).await;
    assert_eq!(harness.instance(instance.id).observed, ObservedState::Running);

    // Stop.
    let mut stored = harness.instance(instance.id);
    stored.desired = DesiredState::Stopped;
    harness.store.upsert_desired_state(&stored).unwrap();
    harness.converge(1).await;
    assert_eq!(harness.instance(instance.id).observed, ObservedState::Stopped);

    // Back to running.
    let mut stored = harness.instance(instance.id);
    stored.desired = DesiredState::Running;
    harness.store.upsert_desired_state(&stored).unwrap();
    harness.converge(1).await;
    assert_eq!(harness.instance(instance.id).observed, ObservedState::Running);

    // Delete.
    let mut stored = harness.instance(instance.id);
    stored.desired = DesiredState::Deleted;
    harness.store.upsert_desired_state(&stored).unwrap();
    harness.converge(1).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Deleted);
    assert!(stored.container_handle.is_none());
    assert_eq!(harness.driver.container_count(), 0);
}

#[tokio::test]
async fn duplicate_stop_converges_to_the_same_state() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);
    harness.converge(1).await;

    // Two stop tasks against the same instance; the second finds the
    // container already exited and only re-records the observation.
    harness.queue.enqueue(TaskKind::Stop, instance.id).unwrap();
    harness.queue.enqueue(TaskKind::Stop, instance.id).unwrap();
    harness.workers.drain(Duration::from_millis(50)).await;

    assert_eq!(harness.instance(instance.id).observed, ObservedState::Stopped);
    assert_eq!(harness.driver.calls("stop"), 1);
    let tasks = harness.store.list_tasks(instance.id, 100).unwrap();
    assert!(tasks
        .iter()
        .filter(|t| t.kind == TaskKind::Stop)
        .all(|t| t.status == TaskStatus::Succeeded));
}

#[tokio::test]
async fn at_most_one_active_task_per_instance() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);

    let first = harness
        .queue
        .enqueue_if_idle(TaskKind::Create, instance.id)
        .unwrap();
    assert!(first.is_some());
    let second = harness
        .queue
        .enqueue_if_idle(TaskKind::Create, instance.id)
        .unwrap();
    assert!(second.is_none());

    assert_eq!(harness.store.list_tasks(instance.id, 100).unwrap().len(), 1);
}

#[tokio::test]
async fn delete_during_create_leaks_no_container() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);

    // Create is scheduled but has not run yet when the caller deletes.
    harness.reconciler.tick().unwrap();
    let mut stored = harness.instance(instance.id);
    stored.desired = DesiredState::Deleted;
    harness.store.upsert_desired_state(&stored).unwrap();

    // The in-flight create completes against the new desired state, then
    // the next tick supersedes it with the removal.
    harness.converge(2).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Deleted);
    assert_eq!(harness.driver.container_count(), 0);
    assert_eq!(harness.driver.running_containers(), 0);
}

#[tokio::test]
async fn transient_start_failures_retry_within_ceiling() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);
    harness.converge(1).await;

    // Park the instance stopped, then ask for running again with a flaky
    // runtime: three transient failures, success on the fourth attempt.
    let mut stored = harness.instance(instance.id);
    stored.desired = DesiredState::Stopped;
    harness.store.upsert_desired_state(&stored).unwrap();
    harness.converge(1).await;

    harness.driver.fail_transiently("start", 3);
    let mut stored = harness.instance(instance.id);
    stored.desired = DesiredState::Running;
    harness.store.upsert_desired_state(&stored).unwrap();

    harness.converge(1).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Running);

    let tasks = harness.store.list_tasks(instance.id, 100).unwrap();
    let start_task = tasks
        .iter()
        .find(|t| t.kind == TaskKind::Start)
        .expect("start task recorded");
    assert_eq!(start_task.status, TaskStatus::Succeeded);
    assert_eq!(start_task.attempts, 4);
}

#[tokio::test]
async fn exhausted_retries_mark_task_and_instance_failed() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);

    // More transient failures than the ceiling allows.
    harness.driver.fail_transiently("create", 10);
    harness.converge(1).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Failed);
    assert!(stored
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("transient"));

    let tasks = harness.store.list_tasks(instance.id, 100).unwrap();
    let create_task = tasks.iter().find(|t| t.kind == TaskKind::Create).unwrap();
    assert_eq!(create_task.status, TaskStatus::Failed);
    assert_eq!(create_task.attempts, test_config().retry_ceiling);
}

#[tokio::test]
async fn invalid_spec_fails_without_retry() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);

    harness.driver.fail_next(
        "create",
        CoordinatorError::InvalidSpec("No such image: nginx:alpine".to_string()),
    );
    harness.converge(1).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Failed);
    assert_eq!(harness.driver.calls("create"), 1);

    let tasks = harness.store.list_tasks(instance.id, 100).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].attempts, 1);
}

#[tokio::test]
async fn failed_instance_heals_within_restart_budget() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);
    harness.converge(1).await;
    let first_handle = harness.instance(instance.id).container_handle.unwrap();

    // The runtime reports the container dead.
    harness.store.record_failure(instance.id, "oom killed").unwrap();

    // Tick 1 tears the failed container down, tick 2 recreates it.
    harness.converge(2).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Running);
    assert_eq!(stored.restart_count, 1);
    // Recreation allocates a fresh handle.
    assert_ne!(stored.container_handle.unwrap(), first_handle);
}

#[tokio::test]
async fn restart_budget_bounds_self_healing() {
    let config = CoordinatorConfig {
        restart_budget: 1,
        retry_base_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let harness = Harness::with_config(config);
    let instance = harness.create_instance(DesiredState::Running, None);
    harness.converge(1).await;

    harness.store.record_failure(instance.id, "oom killed").unwrap();
    harness.converge(2).await;
    assert_eq!(harness.instance(instance.id).restart_count, 1);

    // Second failure exhausts the budget: no more corrective tasks.
    harness.store.record_failure(instance.id, "oom killed again").unwrap();
    let tasks_before = harness.store.list_tasks(instance.id, 100).unwrap().len();
    harness.converge(3).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("oom killed again"));
    assert_eq!(
        harness.store.list_tasks(instance.id, 100).unwrap().len(),
        tasks_before
    );
}

#[tokio::test]
async fn sustained_memory_breach_emits_exactly_one_stop() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, Some(100 * MB));
    harness.converge(1).await;
    let handle = harness.instance(instance.id).container_handle.unwrap();

    // Three consecutive over-limit samples.
    for _ in 0..3 {
        harness.driver.push_usage(
            &handle,
            InstanceUsage {
                cpu_percent: 12.5,
                memory_bytes: 200 * MB,
                disk_bytes: 0,
            },
        );
    }

    harness.monitor.sample_all().await.unwrap();
    harness.monitor.sample_all().await.unwrap();
    assert_eq!(harness.tasks_of_kind(instance.id, TaskKind::Stop), 0);

    harness.monitor.sample_all().await.unwrap();
    assert_eq!(harness.tasks_of_kind(instance.id, TaskKind::Stop), 1);

    // Samples landed in the store.
    assert_eq!(harness.store.list_samples(instance.id, 10).unwrap().len(), 3);

    // One more over-limit sample must not produce a second stop while the
    // first is still active.
    harness.driver.push_usage(
        &handle,
        InstanceUsage {
            cpu_percent: 12.5,
            memory_bytes: 200 * MB,
            disk_bytes: 0,
        },
    );
    harness.monitor.sample_all().await.unwrap();
    assert_eq!(harness.tasks_of_kind(instance.id, TaskKind::Stop), 1);
}

#[tokio::test]
async fn under_limit_sample_resets_breach_streak() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, Some(100 * MB));
    harness.converge(1).await;
    let handle = harness.instance(instance.id).container_handle.unwrap();

    let over = InstanceUsage {
        cpu_percent: 0.0,
        memory_bytes: 150 * MB,
        disk_bytes: 0,
    };
    let under = InstanceUsage {
        cpu_percent: 0.0,
        memory_bytes: 50 * MB,
        disk_bytes: 0,
    };
    for usage in [over, over, under, over, over] {
        harness.driver.push_usage(&handle, usage);
    }
    for _ in 0..5 {
        harness.monitor.sample_all().await.unwrap();
    }

    // Never three in a row, so no stop was scheduled.
    assert_eq!(harness.tasks_of_kind(instance.id, TaskKind::Stop), 0);
}

#[tokio::test]
async fn vanished_container_resets_state_and_gets_recreated() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);
    harness.converge(1).await;
    let handle = harness.instance(instance.id).container_handle.unwrap();

    // Someone removed the container behind the coordinator's back; stats
    // dry up, the monitor schedules a health check, and the worker resets
    // observed state.
    harness.driver.vanish(&handle);
    harness.monitor.sample_all().await.unwrap();
    assert_eq!(harness.tasks_of_kind(instance.id, TaskKind::HealthCheck), 1);
    harness.workers.drain(Duration::from_millis(50)).await;

    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Unknown);
    assert!(stored.container_handle.is_none());

    // The reconciler repairs with a fresh container.
    harness.converge(1).await;
    let stored = harness.instance(instance.id);
    assert_eq!(stored.observed, ObservedState::Running);
    assert_ne!(stored.container_handle.unwrap(), handle);
}

#[tokio::test]
async fn pending_tasks_are_recovered_after_restart() {
    let harness = Harness::new();
    let instance = harness.create_instance(DesiredState::Running, None);

    // A task persisted before a crash never reached the transport.
    let task = hostd_common::LifecycleTask::new(TaskKind::Create, instance.id);
    harness.store.insert_task(&task).unwrap();

    assert_eq!(harness.queue.recover_pending().unwrap(), 1);
    harness.workers.drain(Duration::from_millis(50)).await;

    assert_eq!(harness.instance(instance.id).observed, ObservedState::Running);
    assert_eq!(
        harness.store.get_task(task.id).unwrap().status,
        TaskStatus::Succeeded
    );
}

#[tokio::test]
async fn fleet_of_instances_converges() {
    let harness = Harness::new();
    let mut ids = Vec::new();
    for (i, desired) in [
        DesiredState::Running,
        DesiredState::Stopped,
        DesiredState::Running,
    ]
    .iter()
    .enumerate()
    {
        let mut instance = HostingInstance::new(
            format!("owner-{i}"),
            format!("app-{i}"),
            InstanceSpec {
                image: "nginx:alpine".to_string(),
                ..Default::default()
            },
        );
        instance.desired = *desired;
        let stored = harness.store.upsert_desired_state(&instance).unwrap();
        ids.push((stored.id, *desired));
    }

    harness.converge(2).await;

    for (id, desired) in ids {
        let stored = harness.instance(id);
        assert_eq!(stored.observed.as_str(), desired.as_str());
        assert!(!stored.is_drifted());
    }
    assert_eq!(harness.driver.running_containers(), 2);
}
