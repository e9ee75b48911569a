//! Error types for the orchestrator crate.
//!
//! [`SandboxError`] is what callers of the lifecycle API observe. It follows
//! the provisioning stages one-to-one, so a failed `initialize()` tells you
//! which stage broke. [`RuntimeError`] is the lower-level error raised by a
//! [`SandboxRuntime`](crate::runtime::SandboxRuntime) implementation and is
//! wrapped by the stage errors.

use std::fmt;

use thiserror::Error;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors surfaced by the sandbox lifecycle.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The platform could not allocate an isolated network.
    #[error("failed to create network {name}: {source}")]
    NetworkCreation {
        /// Requested network name.
        name: String,
        /// Underlying platform error.
        #[source]
        source: RuntimeError,
    },

    /// The database sandbox failed to start, become ready, or accept a connection.
    #[error("database sandbox {image} failed to start: {reason}")]
    DatabaseStart {
        /// Image reference of the database sandbox.
        image: String,
        /// What went wrong.
        reason: String,
    },

    /// The schema definition could not be applied.
    #[error("schema migration failed for {schema}: {reason}")]
    Migration {
        /// Path of the schema source.
        schema: String,
        /// What went wrong.
        reason: String,
    },

    /// The service sandbox failed to start or never signalled readiness.
    #[error("service sandbox {image} failed to start: {reason}")]
    ServiceStart {
        /// Image reference of the service sandbox.
        image: String,
        /// What went wrong.
        reason: String,
        /// Best-effort log output of the failed sandbox, or the
        /// [`LOG_NOT_FOUND`](crate::diagnostics::LOG_NOT_FOUND) marker.
        diagnostics: String,
    },

    /// The container platform itself is unavailable.
    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A lifecycle operation was called from a state that does not allow it.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The requested state.
        to: String,
    },
}

impl SandboxError {
    /// Creates a network creation error.
    pub fn network_creation(name: impl Into<String>, source: RuntimeError) -> Self {
        Self::NetworkCreation {
            name: name.into(),
            source,
        }
    }

    /// Creates a database start error.
    pub fn database_start(image: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::DatabaseStart {
            image: image.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a migration error.
    pub fn migration(schema: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Migration {
            schema: schema.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a service start error carrying diagnostic text.
    pub fn service_start(
        image: impl Into<String>,
        reason: impl fmt::Display,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::ServiceStart {
            image: image.into(),
            reason: reason.to_string(),
            diagnostics: diagnostics.into(),
        }
    }

    /// Creates a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Creates an invalid state transition error.
    pub fn invalid_state_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns the diagnostic text attached to a service start failure.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::ServiceStart { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Errors reported by a container platform.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The platform answered with an error status.
    #[error("{message} (status {status})")]
    Api {
        /// Numeric status reported by the platform.
        status: u16,
        /// Platform message.
        message: String,
    },

    /// The platform failed without a status code.
    #[error("{0}")]
    Platform(String),

    /// A sandbox's output stream ended before the readiness marker appeared.
    #[error("output of {container_id} ended before readiness marker {pattern:?} was seen")]
    StreamEnded {
        /// Container whose output ended.
        container_id: String,
        /// The readiness pattern that was awaited.
        pattern: String,
    },

    /// Timeout waiting for a condition.
    #[error("timeout after {secs}s waiting for {condition}")]
    Timeout {
        /// The condition that timed out.
        condition: String,
        /// How long we waited.
        secs: u64,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Creates an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Creates a platform error without status.
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform(message.into())
    }

    /// Creates a timeout error.
    pub fn timeout(condition: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            condition: condition.into(),
            secs,
        }
    }

    /// Returns the numeric status reported by the platform, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true if the status is one of `codes`.
    pub fn has_status_in(&self, codes: &[u16]) -> bool {
        self.status_code().is_some_and(|s| codes.contains(&s))
    }

    /// Returns true if the platform reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => Self::Api {
                status: status_code,
                message,
            },
            other => Self::Platform(other.to_string()),
        }
    }
}

/// A non-fatal problem met while tearing resources down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    /// The cleanup step that failed.
    pub step: CleanupStep,
    /// Error text.
    pub message: String,
}

impl CleanupWarning {
    /// Creates a new cleanup warning.
    pub fn new(step: CleanupStep, message: impl fmt::Display) -> Self {
        Self {
            step,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.message)
    }
}

/// The four teardown steps, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupStep {
    /// Closing the database connection handle.
    CloseConnection,
    /// Stopping the service sandbox.
    StopService,
    /// Stopping the database sandbox.
    StopDatabase,
    /// Destroying the network fabric.
    DestroyFabric,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CloseConnection => "close connection",
            Self::StopService => "stop service sandbox",
            Self::StopDatabase => "stop database sandbox",
            Self::DestroyFabric => "destroy fabric",
        };
        f.write_str(name)
    }
}
