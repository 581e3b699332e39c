//! In-process runtime.
//!
//! Backs `--runtime memory` for local development and doubles as the test
//! runtime: it records every call and can inject failures or latency per
//! operation.

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, MANAGED_LABEL};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    List,
}

impl RuntimeOp {
    fn name(self) -> &'static str {
        match self {
            RuntimeOp::Create => "create",
            RuntimeOp::Start => "start",
            RuntimeOp::Stop => "stop",
            RuntimeOp::Remove => "remove",
            RuntimeOp::Inspect => "inspect",
            RuntimeOp::List => "list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub op: RuntimeOp,
    pub id: String,
}

struct Container {
    spec: ContainerSpec,
    status: ContainerStatus,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, Container>,
    calls: Vec<RuntimeCall>,
    failures: HashMap<RuntimeOp, usize>,
    latency: HashMap<RuntimeOp, Duration>,
}

#[derive(Default)]
pub struct InMemoryRuntime {
    inner: Mutex<Inner>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail_next(&self, op: RuntimeOp, times: usize) {
        *self.inner.lock().failures.entry(op).or_default() += times;
    }

    pub fn set_latency(&self, op: RuntimeOp, delay: Duration) {
        self.inner.lock().latency.insert(op, delay);
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, op: RuntimeOp, id: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.id == id)
            .count()
    }

    pub fn status(&self, id: &str) -> ContainerStatus {
        self.inner
            .lock()
            .containers
            .get(id)
            .map(|c| c.status)
            .unwrap_or(ContainerStatus::Missing)
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().containers.len()
    }

    pub fn spec(&self, id: &str) -> Option<ContainerSpec> {
        self.inner.lock().containers.get(id).map(|c| c.spec.clone())
    }

    /// Record the call and run injected latency/failure for it.
    async fn enter(&self, op: RuntimeOp, id: &str) -> Result<()> {
        let delay = {
            let mut inner = self.inner.lock();
            inner.calls.push(RuntimeCall {
                op,
                id: id.to_string(),
            });
            inner.latency.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::runtime(op.name(), "injected failure"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.enter(RuntimeOp::Create, &spec.name).await?;
        let id = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        self.inner.lock().containers.insert(
            id.clone(),
            Container {
                spec: spec.clone(),
                status: ContainerStatus::Created,
            },
        );
        debug!(id = %id, name = %spec.name, "Created in-memory container");
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.enter(RuntimeOp::Start, id).await?;
        match self.inner.lock().containers.get_mut(id) {
            Some(container) => {
                container.status = ContainerStatus::Running;
                Ok(())
            }
            None => Err(Error::runtime("start", format!("no such container: {}", id))),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.enter(RuntimeOp::Stop, id).await?;
        if let Some(container) = self.inner.lock().containers.get_mut(id) {
            container.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.enter(RuntimeOp::Remove, id).await?;
        self.inner.lock().containers.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        self.enter(RuntimeOp::Inspect, id).await?;
        Ok(self.status(id))
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        self.enter(RuntimeOp::List, "").await?;
        Ok(self
            .inner
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.spec.labels.contains_key(MANAGED_LABEL))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
