//! Egress firewall for the inside of a sandbox
//!
//! Runs inside the container as root. Every allow-listed domain is resolved
//! and the bridge networks discovered before the live policy is touched, so
//! a lookup failure leaves the previous policy in place. Installation is
//! flush-then-rebuild; if a command fails midway all chains are switched to
//! DROP before the error is returned.

pub mod bridge;
pub mod cidr;
pub mod resolve;
pub mod rules;

use crate::error::{Result, SandboxError};
use crate::utils::exec::{execute_command, CommandOutput};
use tracing::{debug, error, info, warn};

pub use bridge::discover_bridge_networks;
pub use cidr::Ipv4Cidr;
pub use resolve::{resolve_allow_list, resolve_domain, AllowListEntry, DigResolver, DnsLookup, DnsRecord};
pub use rules::{compile, FirewallCommand, RuleSet, Stage};

/// Runs external programs on behalf of the firewall
pub trait CommandRunner {
    /// Run `program` with `args`, capturing its output
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// [`CommandRunner`] that spawns real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        execute_command(program, args, false).map_err(|e| match e {
            SandboxError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                SandboxError::CommandNotFound(program.to_string())
            }
            other => other,
        })
    }
}

/// Checks whether an endpoint can be reached from inside the sandbox
pub trait Prober {
    /// Whether `url` answers
    fn reachable(&self, url: &str) -> bool;
}

/// [`Prober`] backed by `curl`
pub struct CurlProber<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> CurlProber<'a> {
    /// Prober that runs `curl` through `runner`
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl Prober for CurlProber<'_> {
    fn reachable(&self, url: &str) -> bool {
        let args = ["--silent", "--output", "/dev/null", "--connect-timeout", "5", "--max-time", "10", url]
            .map(String::from);
        self.runner
            .run("curl", &args)
            .map(|out| out.success())
            .unwrap_or(false)
    }
}

/// Endpoints used for the post-install self-check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probes {
    /// Must be unreachable
    pub blocked: String,
    /// Must be reachable
    pub allowed: String,
}

/// Installs, verifies and clears the sandbox egress policy
pub struct Firewall<'a> {
    runner: &'a dyn CommandRunner,
    lookup: &'a dyn DnsLookup,
    prober: &'a dyn Prober,
}

impl<'a> Firewall<'a> {
    /// Firewall driven through the given collaborators
    pub fn new(runner: &'a dyn CommandRunner, lookup: &'a dyn DnsLookup, prober: &'a dyn Prober) -> Self {
        Self {
            runner,
            lookup,
            prober,
        }
    }

    /// Resolve, compile, install and (unless `probes` is `None`) verify the
    /// default-deny policy for `allowed`
    pub fn apply(&self, allowed: &[String], probes: Option<&Probes>) -> Result<RuleSet> {
        info!("Resolving {} allow-listed entries", allowed.len());
        let allow_list = resolve_allow_list(self.lookup, allowed)?;
        let bridges = discover_bridge_networks(self.runner)?;
        let preserved = self.docker_dns_rules();

        let rule_set = compile(&allow_list, &bridges, &preserved);
        info!(
            "Installing firewall: {} allowed networks, {} bridge networks",
            rule_set.address_set.len(),
            rule_set.bridge_networks.len()
        );
        self.install(&rule_set.commands, true)?;

        match probes {
            Some(probes) => self.verify(probes)?,
            None => warn!("Skipping firewall verification"),
        }
        Ok(rule_set)
    }

    /// Remove every rule and set and accept all traffic
    pub fn clear(&self) -> Result<()> {
        info!("Clearing firewall");
        let preserved = self.docker_dns_rules();
        self.install(&rules::clear_commands(&preserved), false)
    }

    /// Assert that the blocked probe fails and the allowed probe succeeds
    pub fn verify(&self, probes: &Probes) -> Result<()> {
        if self.prober.reachable(&probes.blocked) {
            self.lockdown();
            return Err(SandboxError::Verification(format!(
                "{} is reachable but is not allow-listed",
                probes.blocked
            )));
        }
        debug!("{} is blocked as expected", probes.blocked);

        if !self.prober.reachable(&probes.allowed) {
            return Err(SandboxError::Verification(format!(
                "{} is allow-listed but unreachable",
                probes.allowed
            )));
        }
        info!("Firewall verified: {} blocked, {} reachable", probes.blocked, probes.allowed);
        Ok(())
    }

    /// NAT rules for Docker's embedded DNS that must survive the flush
    fn docker_dns_rules(&self) -> Vec<String> {
        let args = ["-t", "nat"].map(String::from);
        match self.runner.run("iptables-save", &args) {
            Ok(out) if out.success() => out
                .stdout
                .lines()
                .filter(|line| line.starts_with("-A") && line.contains(rules::DOCKER_DNS))
                .map(str::to_string)
                .collect(),
            Ok(out) => {
                warn!("iptables-save failed: {}", out.stderr.trim());
                Vec::new()
            }
            Err(e) => {
                warn!("iptables-save failed: {}", e);
                Vec::new()
            }
        }
    }

    fn install(&self, commands: &[FirewallCommand], lockdown_on_failure: bool) -> Result<()> {
        for command in commands {
            debug!("{}", command);
            let failure = match self.runner.run(command.program.as_str(), &command.args) {
                Ok(out) if out.success() => continue,
                Ok(out) => out.stderr.trim().to_string(),
                Err(e) => e.to_string(),
            };

            if command.may_fail {
                debug!("Ignoring failure of `{}`: {}", command, failure);
                continue;
            }

            error!("`{}` failed: {}", command, failure);
            if lockdown_on_failure {
                self.lockdown();
            }
            return Err(SandboxError::Firewall(format!("`{}` failed: {}", command, failure)));
        }
        Ok(())
    }

    fn lockdown(&self) {
        warn!("Closing all chains");
        for command in rules::lockdown_commands() {
            if let Err(e) = self.runner.run(command.program.as_str(), &command.args) {
                error!("`{}` failed during lockdown: {}", command, e);
            }
        }
    }
}
