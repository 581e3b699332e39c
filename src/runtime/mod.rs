//! Container runtime boundary.
//!
//! [`ContainerRuntime`] is the contract the lifecycle manager drives. Every
//! call goes through [`BoundedRuntime`], which turns a slow daemon into a
//! [`Error::RuntimeTimeout`] instead of a hang.

pub mod docker;
pub mod memory;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Label attached to every container this service creates.
pub const MANAGED_LABEL: &str = "ephemera.managed";

/// Host port bound to a container-side port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub tty: bool,
    pub ports: Vec<PortMapping>,
    pub shm_size_bytes: Option<i64>,
    pub dns: Vec<String>,
    pub security_opt: Vec<String>,
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn host_ports(&self) -> Vec<u16> {
        self.ports.iter().map(|p| p.host_port).collect()
    }
}

/// Runtime view of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Missing,
}

/// Static part of every container spec, filled from configuration.
#[derive(Debug, Clone)]
pub struct ContainerTemplate {
    pub image: String,
    pub name_prefix: String,
    pub container_ports: Vec<u16>,
    pub env: Vec<String>,
    pub tty: bool,
    pub shm_size_mb: Option<u64>,
    pub dns: Vec<String>,
    pub security_opt: Vec<String>,
    pub binds: Vec<String>,
}

impl Default for ContainerTemplate {
    fn default() -> Self {
        Self {
            image: "linuxserver/chromium:latest".to_string(),
            name_prefix: "chromium-container".to_string(),
            container_ports: vec![3000, 3001],
            env: vec![
                "PUID=1000".to_string(),
                "PGID=1000".to_string(),
                "TZ=Etc/UTC".to_string(),
                "CHROME_CLI=chrome://newtab".to_string(),
            ],
            tty: true,
            shm_size_mb: Some(512),
            dns: Vec::new(),
            security_opt: vec!["seccomp=unconfined".to_string()],
            binds: Vec::new(),
        }
    }
}

impl ContainerTemplate {
    /// Largest port count a single container can be given.
    pub fn max_ports(&self) -> usize {
        self.container_ports.len()
    }

    /// Build a spec mapping `host_ports[i]` to the i-th container port.
    pub fn spec_for(&self, host_ports: &[u16]) -> Result<ContainerSpec> {
        if host_ports.is_empty() || host_ports.len() > self.max_ports() {
            return Err(Error::Validation(format!(
                "port count must be between 1 and {}",
                self.max_ports()
            )));
        }

        let ports = self
            .container_ports
            .iter()
            .zip(host_ports)
            .map(|(&container_port, &host_port)| PortMapping {
                container_port,
                host_port,
            })
            .collect();

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        Ok(ContainerSpec {
            name: format!("{}-{}", self.name_prefix, uuid::Uuid::new_v4()),
            image: self.image.clone(),
            env: self.env.clone(),
            tty: self.tty,
            ports,
            shm_size_bytes: self.shm_size_mb.map(|mb| (mb * 1024 * 1024) as i64),
            dns: self.dns.clone(),
            security_opt: self.security_opt.clone(),
            binds: self.binds.clone(),
            labels,
        })
    }
}

/// Operations against the container engine.
///
/// `stop` and `remove` must succeed on containers that are already stopped
/// or gone.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn inspect(&self, id: &str) -> Result<ContainerStatus>;
    /// Ids of all containers carrying [`MANAGED_LABEL`].
    async fn list_managed(&self) -> Result<Vec<String>>;
    async fn ping(&self) -> Result<()>;
}

/// Apply `timeout` to one runtime call.
pub async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::RuntimeTimeout { op, timeout }),
    }
}

/// Wraps a runtime so every call carries the same deadline.
pub struct BoundedRuntime {
    inner: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl BoundedRuntime {
    pub fn new(inner: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl ContainerRuntime for BoundedRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        with_timeout("create", self.timeout, self.inner.create(spec)).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        with_timeout("start", self.timeout, self.inner.start(id)).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        with_timeout("stop", self.timeout, self.inner.stop(id)).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        with_timeout("remove", self.timeout, self.inner.remove(id)).await
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        with_timeout("inspect", self.timeout, self.inner.inspect(id)).await
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        with_timeout("list", self.timeout, self.inner.list_managed()).await
    }

    async fn ping(&self) -> Result<()> {
        with_timeout("ping", self.timeout, self.inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{InMemoryRuntime, RuntimeOp};
    use super::*;

    #[test]
    fn template_maps_host_ports_in_order() {
        let template = ContainerTemplate::default();
        let spec = template.spec_for(&[41000, 41001]).unwrap();

        assert_eq!(
            spec.ports,
            vec![
                PortMapping { container_port: 3000, host_port: 41000 },
                PortMapping { container_port: 3001, host_port: 41001 },
            ]
        );
        assert!(spec.name.starts_with("chromium-container-"));
        assert_eq!(spec.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(spec.shm_size_bytes, Some(512 * 1024 * 1024));
    }

    #[test]
    fn template_rejects_more_ports_than_exposed() {
        let template = ContainerTemplate::default();
        assert!(matches!(
            template.spec_for(&[1, 2, 3]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(template.spec_for(&[]), Err(Error::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_runtime_times_out_slow_calls() {
        let inner = Arc::new(InMemoryRuntime::new());
        inner.set_latency(RuntimeOp::Stop, Duration::from_secs(60));
        let runtime = BoundedRuntime::new(inner.clone(), Duration::from_secs(2));

        let err = runtime.stop("anything").await.unwrap_err();
        assert!(matches!(err, Error::RuntimeTimeout { op: "stop", .. }));
    }
}
