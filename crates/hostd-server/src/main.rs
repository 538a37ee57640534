use std::sync::Arc;

use bollard::Docker;
use hostd_common::CoordinatorConfig;
use hostd_core::{
    CoordinatorMetrics, DockerDriver, Reconciler, ResourceMonitor, SqliteStore, TaskQueue,
    WorkerPool,
};
use hostd_server::{create_app, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hostd_server=debug,hostd_core=debug".into()),
        )
        .init();

    let config = CoordinatorConfig::from_env();
    info!(db_path = %config.db_path.display(), workers = config.workers, "Starting hostd");

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let metrics = Arc::new(CoordinatorMetrics::default());
    let (queue, receiver) = TaskQueue::with_channel(store.clone(), metrics.clone());

    let docker = Arc::new(Docker::connect_with_local_defaults()?);
    let driver = Arc::new(DockerDriver::new(docker.clone(), config.driver_timeout));

    let workers = WorkerPool::new(
        store.clone(),
        driver.clone(),
        queue.clone(),
        receiver,
        metrics.clone(),
        &config,
    );
    workers.spawn(config.workers);

    let reconciler = Reconciler::new(store.clone(), queue.clone(), metrics.clone(), &config);
    tokio::spawn(reconciler.run());

    let monitor = ResourceMonitor::new(
        store.clone(),
        driver.clone(),
        queue.clone(),
        metrics.clone(),
        &config,
    );
    tokio::spawn(monitor.run());

    // Tasks persisted before a crash never made it onto the transport.
    let recovered = queue.recover_pending()?;
    if recovered > 0 {
        info!(count = recovered, "Re-enqueued pending tasks from a previous run");
    }

    let state = AppState {
        store,
        queue,
        metrics,
        docker: Some(docker),
        host_memory_bytes: host_memory_bytes(),
    };
    let app = create_app(state);

    info!(addr = %config.listen_addr, "hostd listening");
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn host_memory_bytes() -> u64 {
    use sysinfo::System;
    let sys = System::new_all();
    sys.total_memory()
}
