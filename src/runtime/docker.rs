//! Docker Engine adapter built on bollard.

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, MANAGED_LABEL};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use std::collections::HashMap;
use tracing::{debug, info};

pub struct DockerRuntime {
    docker: Docker,
    stop_grace_secs: i64,
}

impl DockerRuntime {
    /// Connect to `socket` or, when `None`, to the platform default.
    pub fn connect(socket: Option<&str>, request_timeout_secs: u64) -> Result<Self> {
        let docker = match socket {
            Some(path) => {
                let path = path.trim_start_matches("unix://");
                Docker::connect_with_socket(path, request_timeout_secs, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::runtime("connect", e))?;

        info!(socket = socket.unwrap_or("default"), "Connected to Docker");
        Ok(Self {
            docker,
            stop_grace_secs: 10,
        })
    }
}

fn status_code(e: &bollard::errors::Error) -> Option<u16> {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

fn build_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for mapping in &spec.ports {
        let key = format!("{}/tcp", mapping.container_port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(mapping.host_port.to_string()),
            }]),
        );
    }

    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        shm_size: spec.shm_size_bytes,
        dns: non_empty(&spec.dns),
        security_opt: non_empty(&spec.security_opt),
        binds: non_empty(&spec.binds),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        tty: Some(spec.tty),
        exposed_ports: Some(exposed_ports),
        labels: Some(spec.labels.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), build_config(spec))
            .await
            .map_err(|e| Error::runtime("create", e))?;

        for warning in &response.warnings {
            debug!(id = %response.id, warning = %warning, "Docker create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::runtime("start", e))
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_grace_secs,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => {
                debug!(id = %id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(Error::runtime("stop", e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 404: already gone, 409: removal already in progress
            Err(e) if matches!(status_code(&e), Some(404) | Some(409)) => {
                debug!(id = %id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(Error::runtime("remove", e)),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let status = info.state.and_then(|s| s.status);
                Ok(match status {
                    Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
                    Some(ContainerStateStatusEnum::RUNNING)
                    | Some(ContainerStateStatusEnum::PAUSED)
                    | Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Running,
                    _ => ContainerStatus::Exited,
                })
            }
            Err(e) if status_code(&e) == Some(404) => Ok(ContainerStatus::Missing),
            Err(e) => Err(Error::runtime("inspect", e)),
        }
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::runtime("list", e))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::runtime("ping", e))
    }
}
