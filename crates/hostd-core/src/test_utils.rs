//! Scripted in-memory container driver for exercising the queue, workers,
//! reconciler, and monitor without a real runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use hostd_common::{CoordinatorError, HostingInstance, Result};

use crate::driver::{ContainerDriver, InstanceUsage, RuntimeStatus, UsageSource};

#[derive(Default)]
struct FakeState {
    /// handle -> runtime status
    containers: HashMap<String, RuntimeStatus>,
    /// op -> errors to inject, consumed front-first
    failures: HashMap<&'static str, VecDeque<CoordinatorError>>,
    calls: HashMap<&'static str, u32>,
    /// handle -> scripted usage readings, consumed front-first
    usage: HashMap<String, VecDeque<InstanceUsage>>,
    next_handle: u32,
}

#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an error for the next call of `op` (after any previously
    /// injected ones are consumed).
    pub fn fail_next(&self, op: &'static str, err: CoordinatorError) {
        let mut state = self.state.lock().unwrap();
        state.failures.entry(op).or_default().push_back(err);
    }

    /// Inject `count` transient failures for `op`.
    pub fn fail_transiently(&self, op: &'static str, count: u32) {
        for _ in 0..count {
            self.fail_next(
                op,
                CoordinatorError::RuntimeUnavailable("injected transient failure".to_string()),
            );
        }
    }

    pub fn calls(&self, op: &'static str) -> u32 {
        *self.state.lock().unwrap().calls.get(op).unwrap_or(&0)
    }

    pub fn container_status(&self, handle: &str) -> Option<RuntimeStatus> {
        self.state.lock().unwrap().containers.get(handle).copied()
    }

    pub fn running_containers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|s| **s == RuntimeStatus::Running)
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    /// Queue a usage reading for `handle`; readings are consumed in order
    /// and an empty queue reads as a stats failure.
    pub fn push_usage(&self, handle: &str, usage: InstanceUsage) {
        let mut state = self.state.lock().unwrap();
        state
            .usage
            .entry(handle.to_string())
            .or_default()
            .push_back(usage);
    }

    /// Drop a container behind the coordinator's back, simulating an
    /// out-of-band removal.
    pub fn vanish(&self, handle: &str) {
        self.state.lock().unwrap().containers.remove(handle);
    }

    fn begin(&self, op: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = state.failures.get_mut(op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, _instance: &HostingInstance) -> Result<String> {
        self.begin("create")?;
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = format!("ctr-{}", state.next_handle);
        state
            .containers
            .insert(handle.clone(), RuntimeStatus::Exited);
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.begin("start")?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(handle) {
            Some(status) => {
                *status = RuntimeStatus::Running;
                Ok(())
            }
            None => Err(CoordinatorError::NotFound(format!("container {handle}"))),
        }
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.begin("stop")?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(handle) {
            Some(status) => {
                // Stopping an exited container is a no-op, like the real
                // runtime's 304.
                *status = RuntimeStatus::Exited;
                Ok(())
            }
            None => Err(CoordinatorError::NotFound(format!("container {handle}"))),
        }
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.begin("remove")?;
        self.state.lock().unwrap().containers.remove(handle);
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus> {
        self.begin("inspect")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .get(handle)
            .copied()
            .unwrap_or(RuntimeStatus::Missing))
    }
}

#[async_trait]
impl UsageSource for FakeDriver {
    async fn usage(&self, handle: &str) -> Result<InstanceUsage> {
        self.begin("usage")?;
        let mut state = self.state.lock().unwrap();
        state
            .usage
            .get_mut(handle)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| {
                CoordinatorError::RuntimeUnavailable(format!("no stats scripted for {handle}"))
            })
    }
}
