//! The environment lifecycle.
//!
//! [`SandboxOrchestrator`] sequences fabric, database, schema, address
//! resolution and service into one `initialize()` call and tears everything
//! down again in `cleanup()`.
//!
//! ```text
//! UNINITIALIZED -> NETWORK_READY -> DB_READY -> MIGRATED -> READY
//!        \______________\_______________\___________\________-> FAILED
//!  any state --cleanup()--> TERMINATED
//! ```
//!
//! A failed `initialize()` runs `cleanup()` itself before returning the
//! error, so callers never hold a half-provisioned environment.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::address::{AddressResolver, ResolvedAddress};
use crate::config::EnvironmentConfig;
use crate::database::{ConnectionInfo, DatabaseConnector, DatabaseSandbox, PgConnector};
use crate::error::{CleanupStep, CleanupWarning, Result, RuntimeError, SandboxError};
use crate::fabric::{Fabric, NetworkFabric};
use crate::runtime::SandboxRuntime;
use crate::sandbox::Sandbox;
use crate::schema::{self, SchemaApplier};
use crate::service::ServiceSandbox;

/// Where an orchestrator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Nothing provisioned yet.
    Uninitialized,
    /// The fabric exists.
    NetworkReady,
    /// The database is running and connected.
    DbReady,
    /// The schema is applied.
    Migrated,
    /// The service is ready; endpoints are published.
    Ready,
    /// A provisioning stage failed.
    Failed,
    /// `cleanup()` has run.
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::NetworkReady => "NETWORK_READY",
            Self::DbReady => "DB_READY",
            Self::Migrated => "MIGRATED",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Warnings produced by one `cleanup()` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Non-fatal failures, in step order.
    pub warnings: Vec<CleanupWarning>,
}

impl CleanupReport {
    /// Returns true if every step succeeded or failed benignly.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, step: CleanupStep, message: impl fmt::Display) {
        let warning = CleanupWarning::new(step, message);
        warn!(step = %warning.step, error = %warning.message, "Cleanup step failed");
        self.warnings.push(warning);
    }
}

/// Everything an external collaborator needs to talk to a ready environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    /// Run identifier, also found in the `testbed.run` label.
    pub run_id: String,
    /// Fabric name.
    pub network: String,
    /// Base URL of the service.
    pub service_url: String,
    /// Host-visible database URL.
    pub database_url: String,
    /// Database address as seen from inside the fabric.
    pub service_database_address: ResolvedAddress,
}

/// Owns every resource of one test environment.
///
/// Generic over the connector so tests can substitute the database client;
/// the default talks to Postgres.
pub struct SandboxOrchestrator<C: DatabaseConnector = PgConnector> {
    runtime: Arc<dyn SandboxRuntime>,
    applier: Arc<dyn SchemaApplier>,
    connector: C,
    config: EnvironmentConfig,
    run_id: String,
    state: LifecycleState,
    fabric: Option<Fabric>,
    database: Option<Sandbox>,
    service: Option<Sandbox>,
    connection: Option<C::Handle>,
    database_info: Option<ConnectionInfo>,
    address: Option<ResolvedAddress>,
    service_url: Option<String>,
}

impl SandboxOrchestrator<PgConnector> {
    /// Creates an orchestrator using Postgres and the configured applier.
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: EnvironmentConfig) -> Self {
        let applier: Arc<dyn SchemaApplier> = Arc::from(schema::from_config(&config.schema));
        Self::with_parts(runtime, applier, PgConnector, config)
    }
}

impl<C: DatabaseConnector> SandboxOrchestrator<C> {
    /// Creates an orchestrator from explicit parts.
    pub fn with_parts(
        runtime: Arc<dyn SandboxRuntime>,
        applier: Arc<dyn SchemaApplier>,
        connector: C,
        config: EnvironmentConfig,
    ) -> Self {
        Self {
            runtime,
            applier,
            connector,
            config,
            run_id: Uuid::new_v4().simple().to_string(),
            state: LifecycleState::Uninitialized,
            fabric: None,
            database: None,
            service: None,
            connection: None,
            database_info: None,
            address: None,
            service_url: None,
        }
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns the run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Base URL of the service; `None` unless ready.
    pub fn service_url(&self) -> Option<&str> {
        self.ready_then(self.service_url.as_deref())
    }

    /// The database connection; `None` unless ready.
    pub fn db_client(&self) -> Option<&C::Handle> {
        self.ready_then(self.connection.as_ref())
    }

    /// Host-visible database URL; `None` unless ready.
    pub fn database_url(&self) -> Option<String> {
        self.ready_then(self.database_info.as_ref())
            .map(ConnectionInfo::url)
    }

    /// Address the service uses for the database; `None` unless ready.
    pub fn resolved_address(&self) -> Option<&ResolvedAddress> {
        self.ready_then(self.address.as_ref())
    }

    /// The fabric, while it exists.
    pub fn fabric(&self) -> Option<&Fabric> {
        self.fabric.as_ref()
    }

    /// The database sandbox, while owned.
    pub fn database_sandbox(&self) -> Option<&Sandbox> {
        self.database.as_ref()
    }

    /// The service sandbox, while owned.
    pub fn service_sandbox(&self) -> Option<&Sandbox> {
        self.service.as_ref()
    }

    /// Published endpoints; `None` unless ready.
    pub fn endpoints(&self) -> Option<Endpoints> {
        Some(Endpoints {
            run_id: self.run_id.clone(),
            network: self.fabric.as_ref()?.name().to_string(),
            service_url: self.service_url()?.to_string(),
            database_url: self.database_url()?,
            service_database_address: self.resolved_address()?.clone(),
        })
    }

    fn ready_then<T>(&self, value: Option<T>) -> Option<T> {
        value.filter(|_| self.state == LifecycleState::Ready)
    }

    fn resource_name(&self, suffix: &str) -> String {
        let prefix = &self.config.network.name_prefix;
        let short = &self.run_id[..12];
        if suffix.is_empty() {
            format!("{}-{}", prefix, short)
        } else {
            format!("{}-{}-{}", prefix, short, suffix)
        }
    }

    /// Provisions the environment.
    ///
    /// Only valid once, from `UNINITIALIZED`. On failure every resource
    /// acquired so far is released before the error is returned.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(SandboxError::invalid_state_transition(
                self.state,
                LifecycleState::Ready,
            ));
        }

        info!(
            run = %self.run_id,
            runtime = %self.runtime.name(),
            applier = %self.applier.name(),
            "Initializing test environment"
        );

        match self.provision().await {
            Ok(()) => {
                self.state = LifecycleState::Ready;
                info!(
                    run = %self.run_id,
                    service_url = self.service_url.as_deref().unwrap_or_default(),
                    database_url = %self.database_info.as_ref().map(ConnectionInfo::url).unwrap_or_default(),
                    "Test environment ready"
                );
                Ok(())
            }
            Err(e) => {
                error!(run = %self.run_id, stage = %self.state, error = %e, "Provisioning failed");
                self.state = LifecycleState::Failed;
                self.cleanup().await;
                Err(e)
            }
        }
    }

    async fn provision(&mut self) -> Result<()> {
        self.config.validate()?;

        let fabric = NetworkFabric::new(self.runtime.clone())
            .create(&self.resource_name(""), &self.run_id)
            .await?;
        self.fabric = Some(fabric.clone());
        self.state = LifecycleState::NetworkReady;

        let name = self.resource_name("db");
        let database = self.database.insert(DatabaseSandbox::declare(
            &self.config.database,
            &name,
            &self.run_id,
        ));
        let info = DatabaseSandbox::new(self.runtime.clone())
            .start(database, &fabric, &self.config.database)
            .await?;
        let handle = DatabaseSandbox::connect(&self.connector, &info, &self.config.database).await?;
        self.connection = Some(handle);
        self.database_info = Some(info.clone());
        self.state = LifecycleState::DbReady;

        let report = self.applier.apply(&info, &self.config.schema.path).await?;
        debug!(notices = report.notices.len(), warnings = report.warnings.len(), "Migration report");
        self.state = LifecycleState::Migrated;

        let address = AddressResolver::new(self.runtime.clone(), &self.config.network.host_alias)
            .resolve(&fabric, info.port())
            .await;
        self.address = Some(address.clone());

        let name = self.resource_name("svc");
        let service = self.service.insert(ServiceSandbox::declare(
            &self.config.service,
            &self.config.network,
            &info,
            &address,
            &name,
            &self.run_id,
        ));
        let url = ServiceSandbox::new(self.runtime.clone())
            .start(service, &fabric, &self.config.service)
            .await?;
        self.service_url = Some(url);

        Ok(())
    }

    /// Releases everything this orchestrator owns, newest first.
    ///
    /// Callable any number of times from any state. Each step runs even if
    /// an earlier one failed; failures come back as warnings, except those
    /// whose platform status is listed in `cleanup.benign_status_codes`,
    /// which are dropped silently.
    pub async fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let owned = self.owns_resources();

        if let Some(handle) = self.connection.take() {
            if let Err(e) = self.connector.close(handle).await {
                report.warn(CleanupStep::CloseConnection, e);
            }
        }

        if let Some(sandbox) = self.service.take() {
            self.release_sandbox(sandbox, CleanupStep::StopService, &mut report)
                .await;
        }

        if let Some(sandbox) = self.database.take() {
            self.release_sandbox(sandbox, CleanupStep::StopDatabase, &mut report)
                .await;
        }

        if let Some(fabric) = self.fabric.take() {
            if let Err(e) = NetworkFabric::new(self.runtime.clone())
                .destroy(&fabric)
                .await
            {
                if !self.is_benign(&e) {
                    report.warn(CleanupStep::DestroyFabric, e);
                }
            }
        }

        self.database_info = None;
        self.address = None;
        self.service_url = None;
        self.state = LifecycleState::Terminated;

        if owned {
            info!(
                run = %self.run_id,
                warnings = report.warnings.len(),
                "Test environment cleaned up"
            );
        } else {
            debug!(run = %self.run_id, "Nothing to clean up");
        }
        report
    }

    async fn release_sandbox(
        &self,
        mut sandbox: Sandbox,
        step: CleanupStep,
        report: &mut CleanupReport,
    ) {
        let Some(id) = sandbox.container_id().map(str::to_string) else {
            return;
        };

        let mut failure = None;
        if let Err(e) = self
            .runtime
            .stop_container(&id, self.config.cleanup.stop_timeout())
            .await
        {
            if !self.is_benign(&e) {
                failure = Some(e);
            }
        }
        if let Err(e) = self.runtime.remove_container(&id).await {
            if !self.is_benign(&e) && failure.is_none() {
                failure = Some(e);
            }
        }

        sandbox.mark_stopped();
        match failure {
            Some(e) => report.warn(step, e),
            None => debug!(container = %sandbox.name(), "Sandbox released"),
        }
    }

    fn is_benign(&self, error: &RuntimeError) -> bool {
        error.has_status_in(&self.config.cleanup.benign_status_codes)
    }

    fn owns_resources(&self) -> bool {
        self.connection.is_some()
            || self.service.is_some()
            || self.database.is_some()
            || self.fabric.is_some()
    }
}

impl<C: DatabaseConnector> Drop for SandboxOrchestrator<C> {
    fn drop(&mut self) {
        if self.owns_resources() {
            warn!(
                run = %self.run_id,
                "Orchestrator dropped without cleanup(); resources labelled testbed.run={} may need manual removal",
                self.run_id
            );
        }
    }
}

impl<C: DatabaseConnector> fmt::Debug for SandboxOrchestrator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("runtime", &self.runtime.name())
            .field("fabric", &self.fabric)
            .field("service_url", &self.service_url)
            .finish()
    }
}
