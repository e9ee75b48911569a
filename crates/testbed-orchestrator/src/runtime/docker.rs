//! Docker runtime implementation.
//!
//! This module implements [`SandboxRuntime`] on top of the Docker Engine API
//! (via bollard). Host ports are always left for the daemon to assign.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::r#trait::{ContainerSpec, ContainerSummary, RuntimeResult, SandboxRuntime};
use crate::error::RuntimeError;
use crate::sandbox::{ImageRef, PullPolicy};

/// Configuration for the Docker runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerRuntimeConfig {
    /// Network driver for fabrics.
    pub network_driver: String,

    /// Whether to remove anonymous volumes with containers.
    pub remove_volumes: bool,

    /// Labels applied to every network and container.
    pub labels: HashMap<String, String>,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            network_driver: "bridge".to_string(),
            remove_volumes: true,
            labels: HashMap::new(),
        }
    }
}

/// [`SandboxRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Connects to the local daemon with default configuration.
    pub async fn connect() -> RuntimeResult<Self> {
        Self::with_config(DockerRuntimeConfig::default()).await
    }

    /// Connects to the local daemon with the given configuration.
    pub async fn with_config(config: DockerRuntimeConfig) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;

        // Verify connection
        docker.ping().await?;

        info!(driver = %config.network_driver, "Connected to Docker daemon");

        Ok(Self { docker, config })
    }

    async fn pull_image(&self, image: &ImageRef) -> RuntimeResult<()> {
        let reference = image.pull_reference();
        info!(image = %reference, "Pulling image");

        let options = CreateImageOptions {
            from_image: reference.as_str(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result?;
            if let Some(status) = progress.status {
                debug!(image = %reference, status = %status, "Pull progress");
            }
        }

        Ok(())
    }

    fn merged_labels(&self, labels: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = self.config.labels.clone();
        merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> RuntimeResult<String> {
        let owned_labels = self.merged_labels(labels);
        let labels: HashMap<&str, &str> = owned_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let options = CreateNetworkOptions {
            name,
            driver: self.config.network_driver.as_str(),
            labels,
            ..Default::default()
        };

        let response = self.docker.create_network(options).await?;
        if response.id.is_empty() {
            return Err(RuntimeError::platform(format!(
                "daemon returned no id for network {}",
                name
            )));
        }

        info!(network = %name, id = %response.id, "Created network");
        Ok(response.id)
    }

    async fn network_gateway(&self, network_id: &str) -> RuntimeResult<Option<String>> {
        let network = self
            .docker
            .inspect_network(network_id, None::<InspectNetworkOptions<String>>)
            .await?;

        let gateway = network
            .ipam
            .and_then(|ipam| ipam.config)
            .into_iter()
            .flatten()
            .filter_map(|config| config.gateway)
            .find(|gateway| !gateway.trim().is_empty());

        Ok(gateway)
    }

    async fn remove_network(&self, network_id: &str) -> RuntimeResult<()> {
        self.docker.remove_network(network_id).await?;
        info!(network = %network_id, "Removed network");
        Ok(())
    }

    async fn ensure_image(&self, image: &ImageRef) -> RuntimeResult<()> {
        match image.pull_policy {
            PullPolicy::Never => Ok(()),
            PullPolicy::Always => self.pull_image(image).await,
            PullPolicy::IfNotPresent => {
                if self.docker.inspect_image(image.reference()).await.is_ok() {
                    debug!(image = %image, "Image present locally");
                    return Ok(());
                }
                self.pull_image(image).await
            }
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|port| (format!("{}/tcp", port), HashMap::new()))
            .collect();

        // No host port: the daemon picks a free one.
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .exposed_ports
            .iter()
            .map(|port| {
                let binding = PortBinding {
                    host_ip: None,
                    host_port: None,
                };
                (format!("{}/tcp", port), Some(vec![binding]))
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            extra_hosts: (!spec.extra_hosts.is_empty()).then(|| spec.extra_hosts.clone()),
            ..Default::default()
        };

        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: HashMap::from([(
                network.clone(),
                EndpointSettings {
                    aliases: spec.network_alias.clone().map(|alias| vec![alias]),
                    ..Default::default()
                },
            )]),
        });

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env_list()),
            labels: Some(self.merged_labels(&spec.labels)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        info!(container = %spec.name, id = %response.id, "Created container");

        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| match RuntimeError::from(e) {
                RuntimeError::Api { status, message } => RuntimeError::Api {
                    status,
                    message: format!("container {} failed to start: {}", container_id, message),
                },
                other => other,
            })?;
        info!(container = %container_id, "Started container");
        Ok(())
    }

    fn follow_logs<'a>(&'a self, container_id: &'a str) -> BoxStream<'a, RuntimeResult<String>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.docker
            .logs(container_id, Some(options))
            .map(|chunk| chunk.map(|log| log.to_string()).map_err(RuntimeError::from))
            .boxed()
    }

    async fn port_mappings(&self, container_id: &str) -> RuntimeResult<HashMap<u16, u16>> {
        let inspect = self.docker.inspect_container(container_id, None).await?;

        let ports = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();

        let mut mappings = HashMap::new();
        for (key, bindings) in ports {
            let Some(internal) = key.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
                continue;
            };
            let host = bindings
                .into_iter()
                .flatten()
                .find_map(|binding| binding.host_port.and_then(|p| p.parse::<u16>().ok()));
            if let Some(host) = host {
                mappings.insert(internal, host);
            }
        }

        Ok(mappings)
    }

    async fn stop_container(&self, container_id: &str, timeout: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.docker.stop_container(container_id, Some(options)).await?;
        debug!(container = %container_id, "Stopped container");
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: self.config.remove_volumes,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await?;
        info!(container = %container_id, "Removed container");
        Ok(())
    }

    async fn container_logs(&self, container_id: &str) -> RuntimeResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk?.to_string());
        }

        Ok(output)
    }

    async fn list_by_image(&self, image: &str) -> RuntimeResult<Vec<ContainerSummary>> {
        let filters: HashMap<String, Vec<String>> =
            [("ancestor".to_string(), vec![image.to_string()])]
                .into_iter()
                .collect();

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image: c.image.unwrap_or_default(),
                    created: c.created.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    fn name(&self) -> &str {
        "docker"
    }
}
