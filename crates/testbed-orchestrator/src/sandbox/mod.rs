//! Sandbox model: image references, lifecycle state and launching.

mod image;
mod launch;
mod lifecycle;

pub use image::{ImageRef, PullPolicy};
pub(crate) use launch::launch;
pub use lifecycle::{Sandbox, SandboxRole, SandboxState};
