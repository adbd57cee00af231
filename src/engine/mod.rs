//! Container engine capability interface
//!
//! The lifecycle orchestrator only talks to the container runtime through
//! [`ContainerEngine`]. [`docker::DockerEngine`] drives a real Docker
//! daemon; [`fake::FakeEngine`] keeps everything in memory for tests.

pub mod docker;
pub mod fake;
pub mod labels;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;

pub use docker::DockerEngine;
pub use fake::FakeEngine;

/// Snapshot of a container as reported by the engine.
///
/// Fetched fresh for every decision and never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    /// Container exists
    pub exists: bool,
    /// Container is running
    pub running: bool,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Creation time reported by the engine
    pub created_at: Option<DateTime<Utc>>,
}

impl ContainerState {
    /// State of a name the engine does not know
    pub fn absent() -> Self {
        Self::default()
    }
}

/// A managed container, as returned by [`ContainerEngine::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container name
    pub name: String,
    /// Container is running
    pub running: bool,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Creation time reported by the engine
    pub created_at: Option<DateTime<Utc>>,
}

/// Host directory bound into the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Canonical host path
    pub source: PathBuf,
    /// Path inside the container
    pub target: String,
}

/// Everything the engine needs to create a sandbox container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image tag
    pub image: String,
    /// Labels recording the workspace identity
    pub labels: HashMap<String, String>,
    /// Workspace bind mounts
    pub mounts: Vec<BindMount>,
    /// Environment as `KEY=VALUE`
    pub env: Vec<String>,
    /// Added Linux capabilities
    pub cap_add: Vec<String>,
    /// Share the host network namespace
    pub host_network: bool,
    /// Keep-alive command
    pub command: Vec<String>,
}

/// Image build options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Ignore the layer cache
    pub no_cache: bool,
    /// `--build-arg` values
    pub build_args: HashMap<String, String>,
}

/// Captured result of a non-interactive exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code
    pub exit_code: i64,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl ExecOutput {
    /// Check if the command was successful
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Minimal set of container runtime operations the orchestrator relies on
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Current state of `name`; a missing container is not an error
    async fn inspect(&self, name: &str) -> Result<ContainerState>;

    /// Create and start a container.
    ///
    /// Fails with [`crate::EngineError::NameConflict`] when the name is taken.
    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    /// Start a stopped container
    async fn start(&self, name: &str) -> Result<()>;

    /// Remove a container
    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// Run `argv` inside the container as root and capture its output
    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput>;

    /// Run `argv` inside the container attached to the caller's terminal,
    /// returning its exit code once the session ends
    async fn attach(&self, name: &str, argv: &[String]) -> Result<i32>;

    /// Whether an image with `tag` is present locally
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Build `tag` from `context_dir`
    async fn build(&self, tag: &str, context_dir: &std::path::Path, options: &BuildOptions) -> Result<()>;

    /// Last `tail` lines of container output
    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<u8>>;

    /// All containers carrying the sandbox signature label
    async fn list(&self) -> Result<Vec<ContainerSummary>>;
}
