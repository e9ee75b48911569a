//! Container platform access.
//!
//! This module provides the trait every stage uses to talk to the platform
//! and the Docker implementation of it.

mod docker;
mod r#trait;

pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use r#trait::{ContainerSpec, ContainerSummary, RuntimeResult, SandboxRuntime};
