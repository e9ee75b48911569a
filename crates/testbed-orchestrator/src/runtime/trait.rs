//! Container platform trait definition.
//!
//! Every provisioning stage reaches the platform through
//! [`SandboxRuntime`]. Keeping the seam narrow lets the lifecycle be driven
//! by a daemon in production and by an in-memory fake in tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::sandbox::ImageRef;

/// Result type for platform calls.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Core trait for container platforms.
///
/// # Lifecycle
///
/// 1. `create_network()` for the run's fabric
/// 2. `ensure_image()`, `create_container()`, `start_container()` per sandbox
/// 3. `follow_logs()` until the readiness marker shows up
/// 4. `port_mappings()` to learn the host ports
/// 5. `stop_container()`, `remove_container()`, `remove_network()` on teardown
///
/// Implementations must be `Send + Sync`; the orchestrator holds them
/// behind an `Arc`.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Creates an isolated network and returns its identifier.
    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> RuntimeResult<String>;

    /// Returns the gateway address of a network, if the platform reports one.
    async fn network_gateway(&self, network_id: &str) -> RuntimeResult<Option<String>>;

    /// Removes a network.
    async fn remove_network(&self, network_id: &str) -> RuntimeResult<()>;

    /// Makes sure an image is available locally, honouring its pull policy.
    async fn ensure_image(&self, image: &ImageRef) -> RuntimeResult<()>;

    /// Creates a container without starting it, returning its identifier.
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Starts a created container.
    async fn start_container(&self, container_id: &str) -> RuntimeResult<()>;

    /// Follows a container's combined stdout/stderr from its start.
    ///
    /// The stream ends when the container exits.
    fn follow_logs<'a>(&'a self, container_id: &'a str) -> BoxStream<'a, RuntimeResult<String>>;

    /// Returns the mapping from internal port to host port.
    async fn port_mappings(&self, container_id: &str) -> RuntimeResult<HashMap<u16, u16>>;

    /// Stops a container.
    async fn stop_container(&self, container_id: &str, timeout: Duration) -> RuntimeResult<()>;

    /// Removes a container.
    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()>;

    /// Returns everything a container has written so far.
    async fn container_logs(&self, container_id: &str) -> RuntimeResult<String>;

    /// Lists containers (running or not) created from `image`.
    async fn list_by_image(&self, image: &str) -> RuntimeResult<Vec<ContainerSummary>>;

    /// Returns the name of this runtime.
    fn name(&self) -> &str;
}

/// What the platform needs to start one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,

    /// Container name.
    pub name: String,

    /// Environment variables.
    pub env: BTreeMap<String, String>,

    /// Internal ports to publish on dynamically assigned host ports.
    pub exposed_ports: Vec<u16>,

    /// Network to join.
    pub network: Option<String>,

    /// Alias on that network.
    pub network_alias: Option<String>,

    /// Labels.
    pub labels: HashMap<String, String>,

    /// Extra `/etc/hosts` entries (`name:address`).
    pub extra_hosts: Vec<String>,
}

impl ContainerSpec {
    /// Returns the environment as `KEY=value` strings.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// A container as listed by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Container identifier.
    pub id: String,

    /// Image the container was created from.
    pub image: String,

    /// Creation time (Unix seconds).
    pub created: i64,

    /// Labels set on the container.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}
