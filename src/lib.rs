//! Agent Sandbox
//!
//! Provisions network-restricted containers for AI coding agents, one per
//! set of host directories. A workspace set maps onto a stable container
//! identity; the container's egress is limited to an allow-list by a
//! default-deny firewall installed from inside the sandbox.

#![deny(rust_2018_idioms)]
#![warn(missing_docs)]

pub mod buildctx;
pub mod config;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod sandbox;
pub mod utils;
pub mod workspace;

pub use config::{FirewallConfig, NamingConfig, SandboxConfig};
pub use engine::{ContainerEngine, DockerEngine, FakeEngine};
pub use error::{Result, SandboxError};
pub use sandbox::manager::SandboxManager;
pub use workspace::WorkspaceIdentity;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
