//! Ephemeral test environments built from containers.
//!
//! This crate provisions everything an integration test needs to talk to a
//! service over HTTP and to its database over SQL, and removes it again
//! afterwards. One environment consists of:
//!
//! - **Fabric**: an isolated network joining the sandboxes of one run
//! - **Database sandbox**: Postgres, reachable on the fabric under a fixed
//!   alias and from the host on a dynamically assigned port
//! - **Schema**: applied once, before the service starts
//! - **Service sandbox**: the service under test, configured with the
//!   database address it can reach from inside the fabric, and considered
//!   ready once it prints its readiness marker
//!
//! # Architecture
//!
//! - [`orchestrator`]: the [`SandboxOrchestrator`] lifecycle (`initialize` / `cleanup`)
//! - [`fabric`], [`database`], [`schema`], [`address`], [`service`]: the stages
//! - [`diagnostics`]: log retrieval for sandboxes that fail to start
//! - [`readiness`]: readiness markers in sandbox output
//! - [`runtime`]: the [`SandboxRuntime`] platform seam and its Docker implementation
//! - [`sandbox`]: sandbox state and image references
//! - [`config`], [`error`]: configuration and error types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use testbed_orchestrator::{DockerRuntime, EnvironmentConfig, SandboxOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EnvironmentConfig::from_file("testbed.toml")?;
//!     let runtime = Arc::new(DockerRuntime::with_config(config.runtime.clone()).await?);
//!
//!     let mut env = SandboxOrchestrator::new(runtime, config);
//!     env.initialize().await?;
//!
//!     let url = env.service_url().expect("ready");
//!     let rows = env.db_client().expect("ready").query("SELECT 1", &[]).await?;
//!     println!("{} {}", url, rows.len());
//!
//!     env.cleanup().await;
//!     Ok(())
//! }
//! ```
//!
//! # Failure behaviour
//!
//! A failing stage aborts `initialize()`, which cleans up before returning
//! the error. A service that never becomes ready produces a
//! [`SandboxError::ServiceStart`] carrying its logs. Cleanup never fails; it
//! returns a [`CleanupReport`] of warnings instead.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod address;
pub mod config;
pub mod database;
pub mod diagnostics;
pub mod error;
pub mod fabric;
pub mod orchestrator;
pub mod readiness;
pub mod runtime;
pub mod sandbox;
pub mod schema;
pub mod service;

#[cfg(test)]
mod testing;

// Re-export commonly used types at the crate root
pub use address::{AddressResolver, AddressSource, ResolvedAddress};
pub use config::{
    ApplierKind, CleanupConfig, DatabaseConfig, EnvironmentConfig, NetworkConfig, SchemaConfig,
    ServiceConfig,
};
pub use database::{ConnectionInfo, Credentials, DatabaseConnector, PgConnection, PgConnector};
pub use diagnostics::{DiagnosticCollector, DiagnosticRecord, Resolution, LOG_NOT_FOUND};
pub use error::{CleanupStep, CleanupWarning, Result, RuntimeError, SandboxError};
pub use fabric::{Fabric, NetworkFabric};
pub use orchestrator::{CleanupReport, Endpoints, LifecycleState, SandboxOrchestrator};
pub use readiness::ReadinessProbe;
pub use runtime::{DockerRuntime, DockerRuntimeConfig, SandboxRuntime};
pub use sandbox::{ImageRef, PullPolicy, Sandbox, SandboxRole, SandboxState};
pub use schema::{DriverApplier, MigrationReport, PsqlApplier, SchemaApplier};
pub use service::ServiceSandbox;
