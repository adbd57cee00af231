//! Sandbox image build context
//!
//! The Dockerfile is compiled into the binary. The running executable is
//! copied next to it so the image carries the in-sandbox firewall entry point.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Embedded Dockerfile
pub const DOCKERFILE: &str = include_str!("../assets/Dockerfile");

/// Name of the executable inside the build context
pub const BINARY_NAME: &str = "agentbox";

/// Path of the firewall entry point inside the image
pub const SANDBOX_BINARY_PATH: &str = "/usr/local/bin/agentbox";

/// A temporary build context, removed on drop
pub struct BuildContext {
    dir: TempDir,
}

impl BuildContext {
    /// Write the Dockerfile and a copy of `binary` into a fresh temp directory
    pub fn prepare(binary: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("agentbox-build-").tempdir()?;
        std::fs::write(dir.path().join("Dockerfile"), DOCKERFILE)?;
        std::fs::copy(binary, dir.path().join(BINARY_NAME))?;

        debug!("Prepared build context in {}", dir.path().display());
        Ok(Self { dir })
    }

    /// Build context for the currently running executable
    pub fn for_current_exe() -> Result<Self> {
        Self::prepare(&std::env::current_exe()?)
    }

    /// Context directory
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Files placed in the context
    pub fn files(&self) -> Vec<PathBuf> {
        vec![self.path().join("Dockerfile"), self.path().join(BINARY_NAME)]
    }
}
