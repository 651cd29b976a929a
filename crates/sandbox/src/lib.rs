//! Sandbox execution: the opaque [`SandboxRunner`] boundary, a
//! docker-CLI-backed implementation, and the sticky-per-worldline
//! [`SandboxManager`] pool with idle reaping.

mod docker;
mod manager;
mod reaper;
mod runner;

pub use docker::DockerSandboxRunner;
pub use manager::{SandboxManager, SandboxPoolStatus};
pub use reaper::spawn_reaper;
pub use runner::{scan_artifacts, ExecutionResult, SandboxArtifact, SandboxRunner};
