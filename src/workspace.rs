//! Workspace identity derivation
//!
//! Maps a set of host directories onto a stable container identity. The
//! signature depends on the *set* of canonical directories, never on the
//! order or spelling they were given in, so the same workspace always finds
//! its sandbox again.

use crate::config::NamingConfig;
use crate::error::{Result, ValidationError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const MAX_SLUG_LEN: usize = 24;
const FALLBACK_SLUG: &str = "ws";

/// Derived identity of a workspace set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceIdentity {
    /// Container name
    pub name: String,
    /// Short hash over the canonical mount set
    pub signature: String,
    /// Human-readable label
    pub slug: String,
    /// Canonical, deduplicated, sorted mount sources
    pub mounts: Vec<PathBuf>,
}

impl WorkspaceIdentity {
    /// Normalize `dirs` and derive signature, slug and name from them
    pub fn derive<P: AsRef<Path>>(dirs: &[P], naming: &NamingConfig) -> Result<Self> {
        let mounts = normalize(dirs)?;
        let signature = derive_signature(&mounts, naming.salt.as_deref(), naming.signature_width);
        let slug = derive_slug(&mounts);
        let name = derive_name(&slug, &signature, &naming.prefix);

        Ok(Self {
            name,
            signature,
            slug,
            mounts,
        })
    }

    /// Replace the derived name, keeping signature and mounts
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a uniqueness suffix so several sandboxes can share one workspace set
    pub fn with_parallel_suffix(mut self, suffix: impl std::fmt::Display) -> Self {
        self.name = format!("{}-{}", self.name, suffix);
        self
    }
}

/// Validate and canonicalize workspace directories.
///
/// Empty input means the current directory. Every entry must be an existing
/// directory; symlinks are resolved, duplicates collapse, and the result is
/// sorted byte-wise.
pub fn normalize<P: AsRef<Path>>(dirs: &[P]) -> Result<Vec<PathBuf>> {
    let cwd = std::env::current_dir()?;
    let inputs: Vec<&Path> = if dirs.is_empty() {
        vec![Path::new(".")]
    } else {
        dirs.iter().map(AsRef::as_ref).collect()
    };

    let mut canonical = Vec::with_capacity(inputs.len());
    for dir in inputs {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let abs = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            cwd.join(dir)
        };

        match std::fs::metadata(&abs) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(ValidationError::NotADirectory(abs).into()),
        }

        let real = abs
            .canonicalize()
            .map_err(|source| ValidationError::UnresolvableSymlink {
                path: abs.clone(),
                source,
            })?;
        canonical.push(real);
    }

    canonical.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
    canonical.dedup();
    Ok(canonical)
}

/// Short hex hash over the canonical mount set.
///
/// Callers pass the output of [`normalize`]; the paths are hashed in that
/// order, which is what makes the result independent of input order.
pub fn derive_signature(canonical: &[PathBuf], salt: Option<&str>, width: usize) -> String {
    let salt = salt.filter(|s| !s.is_empty());
    let mut hasher = Sha256::new();
    for path in canonical {
        if let Some(salt) = salt {
            hasher.update(salt.as_bytes());
            hasher.update(b"|");
        }
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(b"\n");
    }

    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(width);
    hex
}

/// Human-readable slug from the basenames of the first two mounts
///
/// A basename with nothing left after kebab-casing contributes `ws`.
pub fn derive_slug(canonical: &[PathBuf]) -> String {
    let parts: Vec<String> = canonical
        .iter()
        .take(2)
        .map(|p| {
            let part = p
                .file_name()
                .map(|n| to_kebab(&n.to_string_lossy()))
                .unwrap_or_default();
            if part.is_empty() {
                FALLBACK_SLUG.to_string()
            } else {
                part
            }
        })
        .collect();

    let mut slug = parts.join("-");
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_matches('-').to_string();
    }

    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug
    }
}

/// `{prefix}-{slug}-{signature}`
pub fn derive_name(slug: &str, signature: &str, prefix: &str) -> String {
    format!("{}-{}-{}", prefix, slug, signature)
}

/// Lowercase `s` and collapse every run of non-alphanumerics into one hyphen
fn to_kebab(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}
