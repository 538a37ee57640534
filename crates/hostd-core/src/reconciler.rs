//! Drift audit loop.
//!
//! Each tick compares desired against observed state for every instance and
//! schedules at most one corrective task per drifted instance, skipping any
//! instance that already has an active task. Failed instances are healed by
//! teardown-and-recreate within a per-instance restart budget; drift that
//! outlives the alert threshold is surfaced as a warning and nothing more.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostd_common::{
    CoordinatorConfig, CoordinatorError, DesiredState, HostingInstance, ObservedState, Result,
    TaskKind, Uuid,
};
use tracing::{debug, error, warn};

use crate::metrics::CoordinatorMetrics;
use crate::queue::TaskQueue;
use crate::store::StateStore;

pub struct Reconciler {
    store: Arc<dyn StateStore>,
    queue: Arc<TaskQueue>,
    metrics: Arc<CoordinatorMetrics>,
    interval: Duration,
    restart_budget: u32,
    drift_alert_ticks: u32,
    /// In-flight tasks older than this are presumed orphaned by a dead
    /// worker and returned to pending.
    stale_task_cutoff: Duration,
    /// Consecutive ticks each instance has stayed drifted. Advisory only,
    /// which is why it lives in process memory rather than the store.
    drift_ages: Mutex<HashMap<Uuid, u32>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<TaskQueue>,
        metrics: Arc<CoordinatorMetrics>,
        config: &CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            metrics,
            interval: config.reconcile_interval,
            restart_budget: config.restart_budget,
            drift_alert_ticks: config.drift_alert_ticks,
            stale_task_cutoff: config.driver_timeout * 2,
            drift_ages: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            if let Err(err) = self.tick() {
                error!(error = %err, "Reconcile tick failed");
            }
        }
    }

    /// One reconcile pass; returns how many corrective tasks were scheduled.
    pub fn tick(&self) -> Result<usize> {
        self.metrics.reconcile_ticks.fetch_add(1, Ordering::Relaxed);

        let reset = self.store.reset_stale_in_flight(self.stale_task_cutoff)?;
        if reset > 0 {
            warn!(count = reset, "Returned stale in-flight tasks to pending");
            self.queue.recover_pending()?;
        }

        let drifted = self.store.list_drifted()?;
        let drifted_ids: HashSet<Uuid> = drifted.iter().map(|i| i.id).collect();
        let mut scheduled = 0;

        for instance in &drifted {
            self.track_drift_age(instance)?;

            if self.store.has_active_task(instance.id)? {
                continue;
            }
            let Some(kind) = self.corrective_action(instance) else {
                continue;
            };
            self.queue.enqueue(kind, instance.id)?;
            self.store.touch_reconciled(instance.id)?;
            debug!(
                instance_id = %instance.id,
                desired = instance.desired.as_str(),
                observed = instance.observed.as_str(),
                kind = kind.as_str(),
                "Scheduled corrective task"
            );
            scheduled += 1;
        }

        self.forget_resolved(&drifted_ids)?;
        Ok(scheduled)
    }

    /// Map a drifted instance to its corrective operation, or `None` when
    /// nothing should be scheduled this tick.
    fn corrective_action(&self, instance: &HostingInstance) -> Option<TaskKind> {
        use DesiredState as D;
        use ObservedState as O;

        match (instance.desired, instance.observed) {
            (D::Deleted, observed) if !observed.is_terminal() => Some(TaskKind::Remove),
            (D::Deleted, _) => None,
            // Failed instances heal by teardown-and-recreate until the
            // restart budget runs out; after that they stay failed for an
            // operator to look at.
            (_, O::Failed) => {
                (instance.restart_count < self.restart_budget).then_some(TaskKind::Remove)
            }
            (D::Running, O::Unknown | O::Deleted) => Some(TaskKind::Create),
            (D::Running, O::Requested | O::Stopped) => Some(TaskKind::Start),
            (D::Stopped, O::Running) => Some(TaskKind::Stop),
            (D::Stopped, O::Requested) => Some(TaskKind::Stop),
            (D::Stopped, O::Unknown | O::Deleted) => Some(TaskKind::Create),
            (D::Requested, O::Unknown) => Some(TaskKind::Create),
            _ => None,
        }
    }

    fn track_drift_age(&self, instance: &HostingInstance) -> Result<()> {
        let mut ages = self
            .drift_ages
            .lock()
            .map_err(|_| CoordinatorError::Internal("drift age lock poisoned".to_string()))?;
        let age = ages.entry(instance.id).or_insert(0);
        *age += 1;
        if *age == self.drift_alert_ticks {
            warn!(
                instance_id = %instance.id,
                desired = instance.desired.as_str(),
                observed = instance.observed.as_str(),
                ticks = *age,
                "Drift unresolved past alert threshold"
            );
            self.metrics.drift_alerts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn forget_resolved(&self, still_drifted: &HashSet<Uuid>) -> Result<()> {
        let mut ages = self
            .drift_ages
            .lock()
            .map_err(|_| CoordinatorError::Internal("drift age lock poisoned".to_string()))?;
        ages.retain(|id, _| still_drifted.contains(id));
        Ok(())
    }
}
