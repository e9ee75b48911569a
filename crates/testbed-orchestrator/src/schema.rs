//! Applying the schema definition to a running database.
//!
//! The schema is applied once, synchronously, and never retried: a failure
//! means the schema file is broken. Advisory output such as
//! `NOTICE: relation "x" already exists, skipping` does not fail the call.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::process::Command;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, info, warn};

use crate::config::{ApplierKind, SchemaConfig};
use crate::database::ConnectionInfo;
use crate::error::{Result, SandboxError};

/// What a migration printed besides its result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Advisory notices.
    pub notices: Vec<String>,
    /// Other diagnostic output of a successful run.
    pub warnings: Vec<String>,
    /// Standard output.
    pub output: String,
}

impl MigrationReport {
    fn from_streams(stdout: &str, stderr: &str) -> Self {
        let mut report = Self {
            output: stdout.to_string(),
            ..Default::default()
        };
        for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line.contains("NOTICE") {
                report.notices.push(line.to_string());
            } else {
                report.warnings.push(line.to_string());
            }
        }
        report
    }

    fn log(&self, schema: &Path) {
        for notice in &self.notices {
            debug!(schema = %schema.display(), notice = %notice, "Migration notice");
        }
        for warning in &self.warnings {
            warn!(schema = %schema.display(), output = %warning, "Migration wrote to stderr");
        }
    }
}

/// Applies a schema definition file.
#[async_trait]
pub trait SchemaApplier: Send + Sync {
    /// Runs `schema` against the database at `connection`.
    async fn apply(&self, connection: &ConnectionInfo, schema: &Path) -> Result<MigrationReport>;

    /// Returns the name of this applier.
    fn name(&self) -> &str;
}

/// Builds the applier selected by `config`.
pub fn from_config(config: &SchemaConfig) -> Box<dyn SchemaApplier> {
    match config.applier {
        ApplierKind::Psql => Box::new(
            PsqlApplier::new(&config.psql_binary).with_on_error_stop(config.on_error_stop),
        ),
        ApplierKind::Driver => Box::new(DriverApplier),
    }
}

fn migration_error(schema: &Path, reason: impl std::fmt::Display) -> SandboxError {
    SandboxError::migration(schema.display().to_string(), reason)
}

async fn ensure_exists(schema: &Path) -> Result<()> {
    match tokio::fs::metadata(schema).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(migration_error(schema, "not a regular file")),
        Err(e) => Err(migration_error(schema, format!("cannot read schema file: {}", e))),
    }
}

/// Runs the schema through the `psql` command-line client.
#[derive(Debug, Clone)]
pub struct PsqlApplier {
    binary: PathBuf,
    on_error_stop: bool,
}

impl PsqlApplier {
    /// Creates an applier running `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            on_error_stop: true,
        }
    }

    /// Sets whether `psql` stops at the first failing statement.
    pub fn with_on_error_stop(mut self, on_error_stop: bool) -> Self {
        self.on_error_stop = on_error_stop;
        self
    }

    fn command(&self, connection: &ConnectionInfo, schema: &Path) -> Command {
        let credentials = connection.credentials();
        let mut command = Command::new(&self.binary);
        command
            .env("PGPASSWORD", &credentials.password)
            .arg("-h")
            .arg(connection.host())
            .arg("-p")
            .arg(connection.port().to_string())
            .arg("-U")
            .arg(&credentials.username)
            .arg("-d")
            .arg(&credentials.database);
        if self.on_error_stop {
            command.arg("-v").arg("ON_ERROR_STOP=1");
        }
        command
            .arg("-f")
            .arg(schema)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl Default for PsqlApplier {
    fn default() -> Self {
        Self::new("psql")
    }
}

#[async_trait]
impl SchemaApplier for PsqlApplier {
    async fn apply(&self, connection: &ConnectionInfo, schema: &Path) -> Result<MigrationReport> {
        ensure_exists(schema).await?;
        debug!(
            binary = %self.binary.display(),
            schema = %schema.display(),
            host = %connection.host(),
            port = connection.port(),
            "Running psql"
        );

        let output = self
            .command(connection, schema)
            .output()
            .await
            .map_err(|e| {
                migration_error(schema, format!("cannot run {}: {}", self.binary.display(), e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(migration_error(
                schema,
                format!("{} exited with {}: {}", self.binary.display(), output.status, stderr.trim()),
            ));
        }

        let report = MigrationReport::from_streams(&stdout, &stderr);
        report.log(schema);
        info!(
            schema = %schema.display(),
            notices = report.notices.len(),
            "Schema applied"
        );
        Ok(report)
    }

    fn name(&self) -> &str {
        "psql"
    }
}

/// Runs the schema as one batch over the Postgres driver.
///
/// Needs no client tools on the host. Server notices are collected into the
/// report.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverApplier;

impl DriverApplier {
    /// Turns the outcome of the batch and the notices the server sent
    /// while running it into a report.
    fn finish<E: std::fmt::Display>(
        schema: &Path,
        result: std::result::Result<(), E>,
        notices: Vec<String>,
    ) -> Result<MigrationReport> {
        if let Err(e) = result {
            for notice in &notices {
                debug!(schema = %schema.display(), notice = %notice, "Migration notice");
            }
            return Err(migration_error(schema, e));
        }

        let report = MigrationReport {
            notices,
            ..Default::default()
        };
        report.log(schema);
        info!(
            schema = %schema.display(),
            notices = report.notices.len(),
            "Schema applied"
        );
        Ok(report)
    }
}

#[async_trait]
impl SchemaApplier for DriverApplier {
    async fn apply(&self, connection: &ConnectionInfo, schema: &Path) -> Result<MigrationReport> {
        ensure_exists(schema).await?;
        let sql = tokio::fs::read_to_string(schema)
            .await
            .map_err(|e| migration_error(schema, format!("cannot read schema file: {}", e)))?;

        let (client, mut conn) = tokio_postgres::connect(&connection.url(), NoTls)
            .await
            .map_err(|e| migration_error(schema, e))?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| conn.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notice(notice)) => {
                        let _ = tx.send(format!("NOTICE: {}", notice.message()));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Migration connection ended with error");
                        break;
                    }
                }
            }
        });

        let result = client.batch_execute(&sql).await;
        drop(client);
        let _ = driver.await;

        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        Self::finish(schema, result, notices)
    }

    fn name(&self) -> &str {
        "driver"
    }
}
