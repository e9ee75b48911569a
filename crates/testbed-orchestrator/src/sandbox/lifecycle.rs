//! Sandbox state and lifecycle bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ImageRef;
use crate::runtime::ContainerSpec;

/// What a sandbox is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxRole {
    /// The database the service under test talks to.
    Database,
    /// The service under test.
    Service,
}

impl SandboxRole {
    /// Returns the name used in labels and container names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for SandboxRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    /// Declared but not launched.
    Pending,

    /// Launched, waiting for readiness.
    Starting,

    /// Ready; host ports are known.
    Running,

    /// Stopped by cleanup.
    Stopped,

    /// Failed to launch or become ready.
    Failed {
        /// Failure description.
        message: String,
    },
}

impl SandboxState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }
}

/// One externally visible process started on the platform.
///
/// The host-port map is only populated while the sandbox is
/// [`Running`](SandboxState::Running); every other transition clears it.
#[derive(Debug, Clone)]
pub struct Sandbox {
    role: SandboxRole,
    image: ImageRef,
    name: String,
    alias: Option<String>,
    internal_ports: Vec<u16>,
    env: BTreeMap<String, String>,
    labels: HashMap<String, String>,
    extra_hosts: Vec<String>,
    container_id: Option<String>,
    state: SandboxState,
    host_ports: HashMap<u16, u16>,
}

impl Sandbox {
    /// Declares a sandbox that has not been launched yet.
    pub fn new(role: SandboxRole, image: ImageRef, name: impl Into<String>) -> Self {
        Self {
            role,
            image,
            name: name.into(),
            alias: None,
            internal_ports: Vec::new(),
            env: BTreeMap::new(),
            labels: HashMap::new(),
            extra_hosts: Vec::new(),
            container_id: None,
            state: SandboxState::Pending,
            host_ports: HashMap::new(),
        }
    }

    /// Sets the network alias other sandboxes on the fabric can use.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Declares an internal port for host exposure.
    pub fn with_port(mut self, port: u16) -> Self {
        if !self.internal_ports.contains(&port) {
            self.internal_ports.push(port);
        }
        self
    }

    /// Adds an environment variable injected at start.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds several environment variables.
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an `/etc/hosts` entry (`name:address`).
    pub fn with_extra_host(mut self, entry: impl Into<String>) -> Self {
        self.extra_hosts.push(entry.into());
        self
    }

    /// Returns the role.
    pub fn role(&self) -> SandboxRole {
        self.role
    }

    /// Returns the image.
    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    /// Returns the container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the network alias.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Returns the declared internal ports.
    pub fn internal_ports(&self) -> &[u16] {
        &self.internal_ports
    }

    /// Returns the injected environment.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Returns the labels.
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    /// Builds the platform request for this sandbox on `network`.
    pub fn container_spec(&self, network: Option<&str>) -> ContainerSpec {
        ContainerSpec {
            image: self.image.reference().to_string(),
            name: self.name.clone(),
            env: self.env.clone(),
            exposed_ports: self.internal_ports.clone(),
            network: network.map(str::to_string),
            network_alias: self.alias.clone(),
            labels: self.labels.clone(),
            extra_hosts: self.extra_hosts.clone(),
        }
    }

    /// Returns the platform identifier, once launched.
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// Returns the current state.
    pub fn state(&self) -> &SandboxState {
        &self.state
    }

    /// Returns true if the sandbox is running.
    pub fn is_running(&self) -> bool {
        self.state == SandboxState::Running
    }

    /// Returns the host port mapped to `internal_port`; `None` unless running.
    pub fn host_port(&self, internal_port: u16) -> Option<u16> {
        if self.is_running() {
            self.host_ports.get(&internal_port).copied()
        } else {
            None
        }
    }

    /// Records the platform identifier of a freshly launched container.
    pub fn launched(&mut self, container_id: impl Into<String>) {
        self.container_id = Some(container_id.into());
        self.host_ports.clear();
        self.state = SandboxState::Starting;
    }

    /// Marks the sandbox ready with the platform-assigned host ports.
    pub fn mark_running(&mut self, host_ports: HashMap<u16, u16>) {
        self.host_ports = host_ports;
        self.state = SandboxState::Running;
    }

    /// Marks the sandbox failed.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.host_ports.clear();
        self.state = SandboxState::Failed {
            message: message.into(),
        };
    }

    /// Marks the sandbox stopped.
    pub fn mark_stopped(&mut self) {
        self.host_ports.clear();
        self.state = SandboxState::Stopped;
    }
}
