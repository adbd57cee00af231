//! Container labels: the only persisted record of a sandbox's identity

use crate::workspace::WorkspaceIdentity;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Signature label
pub const SIGNATURE: &str = "com.agentbox.signature";
/// Slug label
pub const SLUG: &str = "com.agentbox.slug";
/// Label schema version label
pub const SCHEMA_VERSION: &str = "com.agentbox.schema-version";
/// Creation timestamp label
pub const CREATED_AT: &str = "com.agentbox.created-at";
/// JSON mount list label
pub const MOUNTS: &str = "com.agentbox.mounts";
/// Network mode label, `host` or `bridge`
pub const NETWORK: &str = "com.agentbox.network";

/// [`NETWORK`] value for host networking
pub const NETWORK_HOST: &str = "host";
/// [`NETWORK`] value for the default isolated network
pub const NETWORK_BRIDGE: &str = "bridge";

/// Current label schema
pub const CURRENT_SCHEMA: &str = "1";

/// Labels recording `identity` and its network mode at `created_at`
pub fn for_identity(
    identity: &WorkspaceIdentity,
    host_network: bool,
    created_at: DateTime<Utc>,
) -> crate::Result<HashMap<String, String>> {
    let mounts: Vec<String> = identity
        .mounts
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    Ok(HashMap::from([
        (SIGNATURE.to_string(), identity.signature.clone()),
        (SLUG.to_string(), identity.slug.clone()),
        (SCHEMA_VERSION.to_string(), CURRENT_SCHEMA.to_string()),
        (
            CREATED_AT.to_string(),
            created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        (MOUNTS.to_string(), serde_json::to_string(&mounts)?),
        (NETWORK.to_string(), network_mode(host_network).to_string()),
    ]))
}

/// Label value for a network mode
pub fn network_mode(host_network: bool) -> &'static str {
    if host_network {
        NETWORK_HOST
    } else {
        NETWORK_BRIDGE
    }
}

/// Recorded network mode: `Some(true)` for host networking, `None` when
/// the label is missing or unknown
pub fn recorded_host_network(labels: &HashMap<String, String>) -> Option<bool> {
    match labels.get(NETWORK).map(String::as_str) {
        Some(NETWORK_HOST) => Some(true),
        Some(NETWORK_BRIDGE) => Some(false),
        _ => None,
    }
}

/// Recorded mount sources, or `None` when the label is missing or unreadable
pub fn recorded_mounts(labels: &HashMap<String, String>) -> Option<Vec<PathBuf>> {
    let raw = labels.get(MOUNTS)?;
    let mounts: Vec<String> = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Unreadable mount label {:?}: {}", raw, e);
            return None;
        }
    };
    Some(mounts.into_iter().map(PathBuf::from).collect())
}

/// Whether the recorded mounts describe the same directory set as `requested`.
///
/// Recorded paths are canonicalized again where they still exist so that a
/// directory reached through a different symlink never counts as drift.
pub fn same_mount_set(recorded: &[PathBuf], requested: &[PathBuf]) -> bool {
    canonical_set(recorded) == canonical_set(requested)
}

fn canonical_set(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut set: Vec<PathBuf> = paths
        .iter()
        .map(|p| canonical_or_self(p))
        .collect();
    set.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
    set.dedup();
    set
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
