//! Error types for the agent sandbox

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while provisioning or isolating a sandbox
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Bad input, rejected before any side effect
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Recorded mount set differs from the requested one
    #[error(
        "container {name} was created for {recorded:?} but {requested:?} was requested; \
         rerun with --replace to recreate it"
    )]
    Drift {
        /// Container name
        name: String,
        /// Mounts recorded in the container labels
        recorded: Vec<PathBuf>,
        /// Mounts requested by this invocation
        requested: Vec<PathBuf>,
    },

    /// Existing container was created for another network mode
    #[error(
        "container {name} uses the {recorded} network but {requested} was requested; \
         rerun with --replace to recreate it"
    )]
    NetworkMismatch {
        /// Container name
        name: String,
        /// Network mode recorded in the container labels
        recorded: String,
        /// Network mode requested by this invocation
        requested: String,
    },

    /// Container engine failure
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Container never reached the running state
    #[error("container {name} did not reach running state within {waited:?}; it has been removed")]
    ReadinessTimeout {
        /// Container name
        name: String,
        /// Total time spent polling
        waited: Duration,
        /// Recent container logs captured before removal
        logs: String,
    },

    /// Allow-list domain could not be resolved
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Firewall discovery or installation failed
    #[error("firewall setup failed: {0}")]
    Firewall(String),

    /// Post-install reachability check failed
    #[error("firewall verification failed: {0}")]
    Verification(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Command not found
    #[error("Command not found: {0}")]
    CommandNotFound(String),

}

/// Input validation failures
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Path does not exist or is not a directory
    #[error("'{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// Symlinks in the path could not be resolved
    #[error("cannot resolve symlinks for {}: {source}", path.display())]
    UnresolvableSymlink {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Container name is not acceptable to the engine
    #[error("invalid container name '{0}'")]
    InvalidName(String),

    /// Flag combination or flag value is not usable
    #[error("{0}")]
    InvalidFlag(String),
}

/// Container engine failures
#[derive(Error, Debug)]
pub enum EngineError {
    /// No such container or image
    #[error("no such object: {0}")]
    NotFound(String),

    /// Another container already holds this name
    #[error("container name {0} is already in use")]
    NameConflict(String),

    /// A failing engine call, with its output
    #[error("{operation} failed for {target}: {message}")]
    Command {
        /// Engine operation (create, start, exec, ...)
        operation: &'static str,
        /// Container name or image tag
        target: String,
        /// Engine output
        message: String,
    },
}

impl EngineError {
    /// Build a [`EngineError::Command`] from any displayable cause
    pub fn command(operation: &'static str, target: impl Into<String>, message: impl ToString) -> Self {
        EngineError::Command {
            operation,
            target: target.into(),
            message: message.to_string(),
        }
    }
}

/// DNS resolution failures for allow-listed domains
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolutionError {
    /// A CNAME chain points back at a name already on the chain
    #[error("CNAME loop detected resolving {domain}: {target} was already visited")]
    LoopDetected {
        /// Domain whose records contained the repeated target
        domain: String,
        /// Repeated target
        target: String,
    },

    /// Lookup failed or produced no IPv4 addresses
    #[error("failed to resolve {domain}: {reason}")]
    ResolutionFailed {
        /// Domain being resolved
        domain: String,
        /// What went wrong
        reason: String,
    },
}
