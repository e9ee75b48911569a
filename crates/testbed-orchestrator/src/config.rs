//! Environment configuration.
//!
//! Everything the orchestrator needs to provision one environment, loadable
//! from TOML. Every section has working defaults for a Postgres-backed HTTP
//! service, so a config file only has to name what differs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::readiness::ReadinessProbe;
use crate::runtime::DockerRuntimeConfig;
use crate::sandbox::{ImageRef, PullPolicy};

/// Top-level environment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Container runtime settings.
    pub runtime: DockerRuntimeConfig,

    /// Network fabric and address resolution.
    pub network: NetworkConfig,

    /// Database sandbox.
    pub database: DatabaseConfig,

    /// Schema source.
    pub schema: SchemaConfig,

    /// Service under test.
    pub service: ServiceConfig,

    /// Teardown behaviour.
    pub cleanup: CleanupConfig,
}

/// Network fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Prefix for fabric and container names; a per-run suffix is appended.
    pub name_prefix: String,

    /// Host alias used when the fabric gateway cannot be determined.
    pub host_alias: String,

    /// Whether to map `host_alias` to the host gateway inside the service
    /// sandbox when the alias is used.
    pub map_host_alias: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name_prefix: "testbed".to_string(),
            host_alias: "host.docker.internal".to_string(),
            map_host_alias: true,
        }
    }
}

/// Database sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database image.
    pub image: ImageRef,

    /// Database name.
    pub database: String,

    /// User name.
    pub username: String,

    /// Password.
    pub password: String,

    /// Port the database listens on inside the sandbox.
    pub internal_port: u16,

    /// Alias of the database on the fabric.
    pub network_alias: String,

    /// Readiness marker (regular expression).
    pub ready_pattern: String,

    /// How many times the marker must appear.
    pub ready_occurrences: usize,

    /// Startup timeout in seconds.
    pub startup_timeout_secs: u64,

    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            image: ImageRef::new("postgres:18-alpine"),
            database: "testdb".to_string(),
            username: "testuser".to_string(),
            password: "testpass".to_string(),
            internal_port: 5432,
            network_alias: "postgres-db".to_string(),
            ready_pattern: "database system is ready to accept connections".to_string(),
            ready_occurrences: 2,
            startup_timeout_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    /// Returns the startup timeout as a Duration.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Returns the connection timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Builds the readiness probe.
    pub fn readiness_probe(&self) -> Result<ReadinessProbe> {
        build_probe(
            "database",
            &self.ready_pattern,
            self.ready_occurrences,
            self.startup_timeout(),
        )
    }
}

/// How the schema is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplierKind {
    /// The external `psql` client.
    #[default]
    Psql,
    /// The in-process Postgres driver.
    Driver,
}

/// Schema source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Path of the schema definition file.
    pub path: PathBuf,

    /// Which applier runs it.
    pub applier: ApplierKind,

    /// `psql` executable.
    pub psql_binary: PathBuf,

    /// Whether `psql` stops at the first error.
    pub on_error_stop: bool,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("schema.sql"),
            applier: ApplierKind::default(),
            psql_binary: PathBuf::from("psql"),
            on_error_stop: true,
        }
    }
}

/// Service-under-test configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service image; usually built locally, hence never pulled by default.
    pub image: ImageRef,

    /// Port the service listens on inside the sandbox.
    pub internal_port: u16,

    /// Readiness marker (regular expression).
    pub ready_pattern: String,

    /// How many times the marker must appear.
    pub ready_occurrences: usize,

    /// Startup timeout in seconds.
    pub startup_timeout_secs: u64,

    /// Variable receiving the database connection string.
    pub database_url_var: String,

    /// Variable receiving the internal port, if the service reads one.
    pub port_var: Option<String>,

    /// Secret material injected at boot.
    pub secrets: BTreeMap<String, String>,

    /// Additional plain environment.
    pub env: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            image: ImageRef::new("source-person-service:latest").with_pull_policy(PullPolicy::Never),
            internal_port: 3000,
            ready_pattern: "INFO: Server starting on port".to_string(),
            ready_occurrences: 1,
            startup_timeout_secs: 100,
            database_url_var: "DATABASE_URL".to_string(),
            port_var: Some("PORT".to_string()),
            secrets: BTreeMap::from([(
                "ENCRYPTION_KEY_1".to_string(),
                "test-encryption-key-12345".to_string(),
            )]),
            env: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Returns the startup timeout as a Duration.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Builds the readiness probe.
    pub fn readiness_probe(&self) -> Result<ReadinessProbe> {
        build_probe(
            "service",
            &self.ready_pattern,
            self.ready_occurrences,
            self.startup_timeout(),
        )
    }
}

/// Teardown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Grace period before a sandbox is killed, in seconds.
    pub stop_timeout_secs: u64,

    /// Platform status codes meaning "already stopped or gone".
    ///
    /// Failures with these codes are dropped silently during cleanup. The
    /// defaults are Docker's: 304 (not modified), 404 (no such object) and
    /// 409 (conflict, e.g. removal already in progress).
    pub benign_status_codes: Vec<u16>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 10,
            benign_status_codes: vec![304, 404, 409],
        }
    }
}

impl CleanupConfig {
    /// Returns the stop timeout as a Duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl EnvironmentConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SandboxError::configuration(e.to_string()))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.network.host_alias.trim().is_empty() {
            return Err(SandboxError::configuration("network.host_alias is empty"));
        }
        if self.network.name_prefix.trim().is_empty() {
            return Err(SandboxError::configuration("network.name_prefix is empty"));
        }
        if self.database.internal_port == 0 {
            return Err(SandboxError::configuration("database.internal_port is 0"));
        }
        if self.service.internal_port == 0 {
            return Err(SandboxError::configuration("service.internal_port is 0"));
        }
        if self.service.database_url_var.trim().is_empty() {
            return Err(SandboxError::configuration(
                "service.database_url_var is empty",
            ));
        }
        if self.database.username.is_empty() || self.database.database.is_empty() {
            return Err(SandboxError::configuration(
                "database.username and database.database are required",
            ));
        }

        self.database.readiness_probe()?;
        self.service.readiness_probe()?;

        Ok(())
    }
}

fn build_probe(
    section: &str,
    pattern: &str,
    occurrences: usize,
    timeout: Duration,
) -> Result<ReadinessProbe> {
    if pattern.trim().is_empty() {
        return Err(SandboxError::configuration(format!(
            "{}.ready_pattern is empty",
            section
        )));
    }
    if occurrences == 0 {
        return Err(SandboxError::configuration(format!(
            "{}.ready_occurrences must be at least 1",
            section
        )));
    }
    ReadinessProbe::new(pattern, timeout)
        .map(|probe| probe.with_occurrences(occurrences))
        .map_err(|e| SandboxError::configuration(format!("{}.ready_pattern: {}", section, e)))
}
