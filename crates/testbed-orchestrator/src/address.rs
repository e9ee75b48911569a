//! Resolving how the service sandbox reaches the database.
//!
//! The database's published port is bound in the host's network namespace
//! while the service lives inside the fabric. From there the host is reachable
//! through the fabric gateway on most Linux daemons, or through a well-known
//! alias on desktop runtimes. The gateway is preferred; the alias is the
//! fallback whenever the gateway is unknown.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::fabric::Fabric;
use crate::runtime::SandboxRuntime;

/// Alias used when none is configured.
pub const DEFAULT_HOST_ALIAS: &str = "host.docker.internal";

/// Which branch produced a [`ResolvedAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressSource {
    /// The fabric's gateway address.
    Gateway,
    /// The fixed host alias.
    HostAlias,
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gateway => f.write_str("gateway"),
            Self::HostAlias => f.write_str("host alias"),
        }
    }
}

/// Host and port the service uses for the database. Never has an empty host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAddress {
    host: String,
    port: u16,
    source: AddressSource,
}

impl ResolvedAddress {
    /// Creates an address; `None` if `host` is blank.
    pub fn new(host: impl Into<String>, port: u16, source: AddressSource) -> Option<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return None;
        }
        Some(Self { host, port, source })
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// How the host was found.
    pub fn source(&self) -> AddressSource {
        self.source
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Computes [`ResolvedAddress`]es.
pub struct AddressResolver {
    runtime: Arc<dyn SandboxRuntime>,
    host_alias: String,
}

impl AddressResolver {
    /// Creates a resolver falling back to `host_alias`.
    pub fn new(runtime: Arc<dyn SandboxRuntime>, host_alias: impl Into<String>) -> Self {
        let host_alias = host_alias.into();
        let host_alias = if host_alias.trim().is_empty() {
            DEFAULT_HOST_ALIAS.to_string()
        } else {
            host_alias.trim().to_string()
        };
        Self {
            runtime,
            host_alias,
        }
    }

    /// Returns the fallback alias.
    pub fn host_alias(&self) -> &str {
        &self.host_alias
    }

    /// Resolves the address of the database, published on host port
    /// `database_port`, as seen from inside `fabric`.
    ///
    /// Never fails: any problem with the gateway query selects the alias.
    pub async fn resolve(&self, fabric: &Fabric, database_port: u16) -> ResolvedAddress {
        let gateway = match self.runtime.network_gateway(fabric.id()).await {
            Ok(Some(gateway)) if !gateway.trim().is_empty() => Some(gateway.trim().to_string()),
            Ok(_) => {
                info!(network = %fabric.name(), "Fabric reports no gateway");
                None
            }
            Err(e) => {
                info!(network = %fabric.name(), error = %e, "Gateway query failed");
                None
            }
        };

        let address = match gateway {
            Some(host) => ResolvedAddress {
                host,
                port: database_port,
                source: AddressSource::Gateway,
            },
            None => ResolvedAddress {
                host: self.host_alias.clone(),
                port: database_port,
                source: AddressSource::HostAlias,
            },
        };

        info!(
            address = %address,
            source = %address.source,
            "Resolved database address for service sandbox"
        );
        address
    }
}
