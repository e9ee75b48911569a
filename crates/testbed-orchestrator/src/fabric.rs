//! Isolated networks joining the sandboxes of one run.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, RuntimeError, SandboxError};
use crate::runtime::SandboxRuntime;

/// Label carrying the run identifier on every resource.
pub const RUN_LABEL: &str = "testbed.run";

/// Label carrying the sandbox role on containers.
pub const ROLE_LABEL: &str = "testbed.role";

/// Handle to a created network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fabric {
    id: String,
    name: String,
}

impl Fabric {
    /// Returns the platform identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the network name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Creates and destroys fabrics.
pub struct NetworkFabric {
    runtime: Arc<dyn SandboxRuntime>,
}

impl NetworkFabric {
    /// Creates a fabric manager on `runtime`.
    pub fn new(runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self { runtime }
    }

    /// Creates a network named `name`, labelled with `run_id`.
    pub async fn create(&self, name: &str, run_id: &str) -> Result<Fabric> {
        let labels = HashMap::from([(RUN_LABEL.to_string(), run_id.to_string())]);
        let id = self
            .runtime
            .create_network(name, &labels)
            .await
            .map_err(|e| SandboxError::network_creation(name, e))?;

        info!(network = %name, id = %id, "Network fabric created");
        Ok(Fabric {
            id,
            name: name.to_string(),
        })
    }

    /// Destroys a fabric. A fabric that is already gone is not an error.
    pub async fn destroy(&self, fabric: &Fabric) -> std::result::Result<(), RuntimeError> {
        match self.runtime.remove_network(fabric.id()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(network = %fabric.name(), "Network fabric already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
