//! Database sandbox and connection handling.
//!
//! [`DatabaseSandbox`] launches the database on the fabric under a fixed
//! alias and learns its host port. A [`DatabaseConnector`] then opens the
//! single connection the orchestrator hands to test callers.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{Result, SandboxError};
use crate::fabric::{Fabric, ROLE_LABEL, RUN_LABEL};
use crate::runtime::SandboxRuntime;
use crate::sandbox::{self, Sandbox, SandboxRole};

/// Error type returned by connectors.
pub type ConnectorError = Box<dyn std::error::Error + Send + Sync>;

/// Database login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Database name.
    pub database: String,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl From<&DatabaseConfig> for Credentials {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where and how to reach the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
    credentials: Credentials,
}

impl ConnectionInfo {
    /// Creates connection info.
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
        }
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Login.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns the same login at another address.
    pub fn at(&self, host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, self.credentials.clone())
    }

    /// Renders a `postgresql://` URL.
    pub fn url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}?sslmode=disable",
            encode_userinfo(&self.credentials.username),
            encode_userinfo(&self.credentials.password),
            self.host,
            self.port,
            self.credentials.database
        )
    }
}

fn encode_userinfo(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Opens and closes the connection handed to test callers.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Live connection type.
    type Handle: Send + Sync;

    /// Connects and verifies the link.
    async fn connect(&self, info: &ConnectionInfo) -> std::result::Result<Self::Handle, ConnectorError>;

    /// Closes a connection.
    async fn close(&self, handle: Self::Handle) -> std::result::Result<(), ConnectorError>;
}

/// [`DatabaseConnector`] for Postgres over `tokio-postgres`.
#[derive(Debug, Clone, Default)]
pub struct PgConnector;

/// An open Postgres connection.
///
/// Dereferences to [`tokio_postgres::Client`].
pub struct PgConnection {
    client: Client,
    driver: JoinHandle<()>,
}

impl PgConnection {
    /// Empties `tables` and resets their sequences.
    pub async fn truncate_tables(&self, tables: &[&str]) -> std::result::Result<(), tokio_postgres::Error> {
        if tables.is_empty() {
            return Ok(());
        }
        let list = tables
            .iter()
            .map(|table| quote_qualified(table))
            .collect::<Vec<_>>()
            .join(", ");
        self.client
            .batch_execute(&format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", list))
            .await?;
        debug!(tables = tables.len(), "Truncated tables");
        Ok(())
    }
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

#[async_trait]
impl DatabaseConnector for PgConnector {
    type Handle = PgConnection;

    async fn connect(&self, info: &ConnectionInfo) -> std::result::Result<PgConnection, ConnectorError> {
        let (client, connection) = tokio_postgres::connect(&info.url(), NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Database connection ended with error");
            }
        });

        client.simple_query("SELECT 1").await?;
        Ok(PgConnection { client, driver })
    }

    async fn close(&self, handle: PgConnection) -> std::result::Result<(), ConnectorError> {
        let PgConnection { client, driver } = handle;
        drop(client);
        driver.await?;
        Ok(())
    }
}

/// Launches the database sandbox.
pub struct DatabaseSandbox {
    runtime: Arc<dyn SandboxRuntime>,
}

impl DatabaseSandbox {
    /// Creates a launcher on `runtime`.
    pub fn new(runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self { runtime }
    }

    /// Declares the database sandbox of run `run_id`.
    pub fn declare(config: &DatabaseConfig, name: &str, run_id: &str) -> Sandbox {
        Sandbox::new(SandboxRole::Database, config.image.clone(), name)
            .with_alias(&config.network_alias)
            .with_port(config.internal_port)
            .with_env("POSTGRES_DB", &config.database)
            .with_env("POSTGRES_USER", &config.username)
            .with_env("POSTGRES_PASSWORD", &config.password)
            .with_label(RUN_LABEL, run_id)
            .with_label(ROLE_LABEL, SandboxRole::Database.name())
    }

    /// Starts `sandbox` on `fabric` and returns the host-visible address.
    pub async fn start(
        &self,
        sandbox: &mut Sandbox,
        fabric: &Fabric,
        config: &DatabaseConfig,
    ) -> Result<ConnectionInfo> {
        let probe = config.readiness_probe()?;
        let image = sandbox.image().to_string();

        sandbox::launch(self.runtime.as_ref(), sandbox, fabric, &probe)
            .await
            .map_err(|e| SandboxError::database_start(&image, e))?;

        let port = sandbox.host_port(config.internal_port).ok_or_else(|| {
            SandboxError::database_start(&image, format!("port {} not published", config.internal_port))
        })?;

        info!(
            image = %image,
            alias = %config.network_alias,
            host_port = port,
            "Database sandbox ready"
        );
        Ok(ConnectionInfo::new("localhost", port, Credentials::from(config)))
    }

    /// Opens the caller-facing connection, bounded by the connect timeout.
    pub async fn connect<C: DatabaseConnector>(
        connector: &C,
        info: &ConnectionInfo,
        config: &DatabaseConfig,
    ) -> Result<C::Handle> {
        let image = config.image.to_string();
        match tokio::time::timeout(config.connect_timeout(), connector.connect(info)).await {
            Ok(Ok(handle)) => {
                debug!(host = %info.host(), port = info.port(), "Database connection open");
                Ok(handle)
            }
            Ok(Err(e)) => Err(SandboxError::database_start(
                image,
                format!("connection to {}:{} failed: {}", info.host(), info.port(), e),
            )),
            Err(_) => Err(SandboxError::database_start(
                image,
                format!(
                    "connection to {}:{} timed out after {}s",
                    info.host(),
                    info.port(),
                    config.connect_timeout_secs
                ),
            )),
        }
    }
}

impl fmt::Debug for DatabaseSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSandbox")
            .field("runtime", &self.runtime.name())
            .finish()
    }
}
