//! Configuration types and validation for the agent sandbox

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default human-readable container name prefix
pub const DEFAULT_NAME_PREFIX: &str = "agentbox";

/// Default sandbox image tag
pub const DEFAULT_IMAGE_TAG: &str = "agentbox";

/// Domains every sandbox may reach
pub const BUILTIN_ALLOWED_DOMAINS: &[&str] = &[
    "api.anthropic.com",
    "api.openai.com",
    "generativelanguage.googleapis.com",
    "api.github.com",
    "github.com",
    "registry.npmjs.org",
    "pypi.org",
    "files.pythonhosted.org",
    "sentry.io",
    "statsig.anthropic.com",
    "statsig.com",
];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Container naming
    #[serde(default)]
    pub naming: NamingConfig,

    /// Sandbox image
    #[serde(default)]
    pub image: ImageConfig,

    /// Egress firewall
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Readiness polling after create/start
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

/// Container naming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamingConfig {
    /// Name prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Salt mixed into every signature, separating environments that
    /// share identical directories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,

    /// Hex characters kept from the signature hash
    #[serde(default = "default_signature_width")]
    pub signature_width: usize,
}

/// Sandbox image configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Image tag to build and run
    #[serde(default = "default_image_tag")]
    pub tag: String,

    /// Host environment variables forwarded at container creation
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,
}

/// Egress firewall configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallConfig {
    /// Domains appended to the built-in allow-list
    #[serde(default)]
    pub extra_allowed_domains: Vec<String>,

    /// Endpoint that must be unreachable after installation
    #[serde(default = "default_blocked_probe")]
    pub blocked_probe: String,

    /// Endpoint that must be reachable after installation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_probe: Option<String>,
}

/// Readiness polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// Total wait in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Delay between polls in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_string()
}

fn default_signature_width() -> usize {
    8
}

fn default_image_tag() -> String {
    DEFAULT_IMAGE_TAG.to_string()
}

fn default_passthrough_env() -> Vec<String> {
    ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "GEMINI_API_KEY"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_blocked_probe() -> String {
    "https://example.com".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_interval_ms() -> u64 {
    200
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            salt: None,
            signature_width: default_signature_width(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            tag: default_image_tag(),
            passthrough_env: default_passthrough_env(),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            extra_allowed_domains: Vec::new(),
            blocked_probe: default_blocked_probe(),
            allowed_probe: None,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl ReadinessConfig {
    /// Total wait
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Poll interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl FirewallConfig {
    /// Built-in domains followed by the configured extras, deduplicated
    pub fn allowed_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        let extras = self.extra_allowed_domains.iter().map(|d| d.trim().to_lowercase());
        for domain in BUILTIN_ALLOWED_DOMAINS.iter().map(|d| d.to_string()).chain(extras) {
            if !domain.is_empty() && !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        domains
    }

    /// Endpoint expected to be reachable once the firewall is installed
    pub fn allowed_probe(&self) -> String {
        self.allowed_probe
            .clone()
            .unwrap_or_else(|| "https://api.github.com/zen".to_string())
    }
}

impl SandboxConfig {
    /// Load configuration from a file (`.toml` or JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| SandboxError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let name_fragment = regex::Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$")
            .map_err(|e| SandboxError::Config(e.to_string()))?;
        if !name_fragment.is_match(&self.naming.prefix) {
            return Err(SandboxError::Config(format!(
                "name prefix '{}' is not a valid container name fragment",
                self.naming.prefix
            )));
        }

        if !(8..=64).contains(&self.naming.signature_width) {
            return Err(SandboxError::Config(format!(
                "signature width must be between 8 and 64, got {}",
                self.naming.signature_width
            )));
        }

        for pattern in &self.image.passthrough_env {
            globset::Glob::new(pattern).map_err(|e| {
                SandboxError::Config(format!("invalid passthrough pattern '{}': {}", pattern, e))
            })?;
        }

        if self.readiness.timeout_ms == 0 || self.readiness.interval_ms == 0 {
            return Err(SandboxError::Config(
                "readiness timeout and interval must be non-zero".to_string(),
            ));
        }

        let allowed = self.firewall.allowed_domains();
        if let Some(host) = probe_host(&self.firewall.blocked_probe) {
            if allowed.iter().any(|d| *d == host) {
                return Err(SandboxError::Config(format!(
                    "blocked probe {} is on the allow-list",
                    self.firewall.blocked_probe
                )));
            }
        }

        let reachable = self.firewall.allowed_probe();
        match probe_host(&reachable) {
            Some(host) if allowed.iter().any(|d| *d == host) => {}
            _ => {
                return Err(SandboxError::Config(format!(
                    "allowed probe {} is not on the allow-list",
                    reachable
                )))
            }
        }

        Ok(())
    }

    /// Get default settings path
    pub fn default_settings_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agentbox.json")
    }
}

/// Host part of a probe URL such as `https://example.com/path`
pub fn probe_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest.split(['/', ':', '?']).next()?.trim();
    (!host.is_empty()).then(|| host.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization() {
        let config = SandboxConfig {
            naming: NamingConfig {
                prefix: "dev".to_string(),
                salt: Some("pepper".to_string()),
                ..Default::default()
            },
            firewall: FirewallConfig {
                extra_allowed_domains: vec!["crates.io".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("extraAllowedDomains"));
        let parsed: SandboxConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.naming.prefix, "dev");
        assert_eq!(parsed.naming.salt.as_deref(), Some("pepper"));
        assert_eq!(parsed.firewall.extra_allowed_domains, vec!["crates.io"]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[naming]\nsalt = \"staging\"\n").unwrap();

        let config = SandboxConfig::from_file(&path).unwrap();
        assert_eq!(config.naming.prefix, DEFAULT_NAME_PREFIX);
        assert_eq!(config.naming.salt.as_deref(), Some("staging"));
        assert_eq!(config.naming.signature_width, 8);
        assert_eq!(config.readiness.timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SandboxConfig::default();
        config.naming.prefix = "-bad prefix".to_string();
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::default();
        config.naming.signature_width = 4;
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::default();
        config.firewall.extra_allowed_domains = vec!["example.com".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allowed_check_url_must_be_allow_listed() {
        let mut config = SandboxConfig::default();
        config.firewall.allowed_probe = Some("https://crates.io/api/v1".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not on the allow-list"), "{}", err);

        config.firewall.extra_allowed_domains = vec!["crates.io".to_string()];
        assert!(config.validate().is_ok());

        config.firewall.allowed_probe = Some("https://".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allowed_domains_dedupes_extras() {
        let firewall = FirewallConfig {
            extra_allowed_domains: vec!["GitHub.com".to_string(), "crates.io".to_string()],
            ..Default::default()
        };
        let domains = firewall.allowed_domains();
        assert_eq!(domains.iter().filter(|d| *d == "github.com").count(), 1);
        assert_eq!(domains.last().map(String::as_str), Some("crates.io"));
    }

    #[test]
    fn test_probe_host() {
        assert_eq!(probe_host("https://example.com").as_deref(), Some("example.com"));
        assert_eq!(probe_host("https://Api.GitHub.com:443/zen").as_deref(), Some("api.github.com"));
        assert_eq!(probe_host("https://"), None);
    }
}
