//! Allow-list resolution
//!
//! Domains are resolved to IPv4 leaves, following CNAME targets explicitly
//! so a resolution loop is reported instead of recursing forever.

use crate::error::ResolutionError;
use crate::firewall::cidr::Ipv4Cidr;
use crate::firewall::CommandRunner;
use regex::Regex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use tracing::debug;

/// Longest CNAME chain followed before giving up
pub const MAX_CNAME_DEPTH: usize = 16;

/// One answer record for a name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRecord {
    /// Literal IPv4 address
    Address(Ipv4Addr),
    /// Another hostname (CNAME target)
    Alias(String),
}

/// Source of address records
pub trait DnsLookup {
    /// Records for `domain`, or a description of why the lookup failed
    fn lookup(&self, domain: &str) -> Result<Vec<DnsRecord>, String>;
}

/// [`DnsLookup`] backed by `dig +short`
pub struct DigResolver<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> DigResolver<'a> {
    /// Resolver that runs `dig` through `runner`
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl DnsLookup for DigResolver<'_> {
    fn lookup(&self, domain: &str) -> Result<Vec<DnsRecord>, String> {
        let args = ["+short", "+time=3", "+tries=2", "A", domain].map(String::from);
        let output = self.runner.run("dig", &args).map_err(|e| e.to_string())?;
        if !output.success() {
            return Err(format!("dig exited with status {}: {}", output.status, output.stderr.trim()));
        }
        Ok(parse_dig_short(&output.stdout))
    }
}

/// Parse `dig +short` output: one address or hostname per line
pub fn parse_dig_short(stdout: &str) -> Vec<DnsRecord> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .filter_map(|line| match line.parse::<Ipv4Addr>() {
            Ok(addr) => Some(DnsRecord::Address(addr)),
            Err(_) if is_domain_name(&normalize_domain(line)) => {
                Some(DnsRecord::Alias(normalize_domain(line)))
            }
            Err(_) => None,
        })
        .collect()
}

/// Resolve `domain` to its IPv4 addresses, following CNAME targets.
///
/// `visited` holds the names on the current chain; a target already on it
/// is a loop. Addresses from the whole chain are merged.
pub fn resolve_domain(
    lookup: &dyn DnsLookup,
    domain: &str,
    visited: &mut Vec<String>,
) -> Result<BTreeSet<Ipv4Addr>, ResolutionError> {
    let domain = normalize_domain(domain);
    if visited.len() >= MAX_CNAME_DEPTH {
        return Err(ResolutionError::ResolutionFailed {
            domain,
            reason: format!("CNAME chain longer than {}", MAX_CNAME_DEPTH),
        });
    }
    visited.push(domain.clone());

    let records = lookup
        .lookup(&domain)
        .map_err(|reason| ResolutionError::ResolutionFailed {
            domain: domain.clone(),
            reason,
        })?;

    let mut addresses = BTreeSet::new();
    for record in records {
        match record {
            DnsRecord::Address(addr) if addr.is_unspecified() || addr.is_broadcast() => {
                debug!("Ignoring unusable address {} for {}", addr, domain);
            }
            DnsRecord::Address(addr) => {
                addresses.insert(addr);
            }
            DnsRecord::Alias(target) => {
                let target = normalize_domain(&target);
                if visited.contains(&target) {
                    return Err(ResolutionError::LoopDetected { domain, target });
                }
                debug!("{} is an alias for {}", domain, target);
                addresses.extend(resolve_domain(lookup, &target, visited)?);
            }
        }
    }
    visited.pop();

    if addresses.is_empty() {
        return Err(ResolutionError::ResolutionFailed {
            domain,
            reason: "no IPv4 addresses".to_string(),
        });
    }
    Ok(addresses)
}

/// An allow-list entry and the networks it opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowListEntry {
    /// Entry as configured
    pub name: String,
    /// Resolved networks (single hosts for resolved domains)
    pub networks: BTreeSet<Ipv4Cidr>,
}

/// Resolve every allow-list entry. Literal addresses and CIDR blocks are
/// taken as they are; anything else must be a domain name.
pub fn resolve_allow_list(
    lookup: &dyn DnsLookup,
    entries: &[String],
) -> Result<Vec<AllowListEntry>, ResolutionError> {
    entries
        .iter()
        .map(|entry| {
            let name = normalize_domain(entry);
            if let Ok(cidr) = name.parse::<Ipv4Cidr>() {
                return Ok(AllowListEntry {
                    name,
                    networks: BTreeSet::from([cidr]),
                });
            }
            if !is_domain_name(&name) {
                return Err(ResolutionError::ResolutionFailed {
                    domain: entry.clone(),
                    reason: "not a valid domain name".to_string(),
                });
            }

            let addresses = resolve_domain(lookup, &name, &mut Vec::new())?;
            debug!("{} -> {:?}", name, addresses);
            Ok(AllowListEntry {
                name,
                networks: addresses.into_iter().map(Ipv4Cidr::host).collect(),
            })
        })
        .collect()
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

fn is_domain_name(name: &str) -> bool {
    static DOMAIN: OnceLock<Option<Regex>> = OnceLock::new();
    DOMAIN
        .get_or_init(|| {
            Regex::new(r"^([a-z0-9_]([a-z0-9_-]{0,61}[a-z0-9])?\.)+[a-z]([a-z0-9-]{0,61}[a-z0-9])?$").ok()
        })
        .as_ref()
        .is_some_and(|re| name.len() <= 253 && re.is_match(name))
}
