//! Firewall rule compilation
//!
//! Turns resolved allow-list entries and bridge networks into the ordered
//! `iptables`/`ipset` invocations that install a default-deny policy.
//! Compilation is pure: the same inputs always yield the same rule set.

use crate::firewall::cidr::Ipv4Cidr;
use crate::firewall::resolve::AllowListEntry;
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Name of the ipset holding allow-listed networks
pub const ADDRESS_SET: &str = "agentbox-allowed";

/// Docker's embedded DNS server
pub const DOCKER_DNS: &str = "127.0.0.11";

/// Phase a command belongs to, in installation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Flush previous rules and sets
    Reset,
    /// Loopback, DNS and SSH
    Base,
    /// Build the allow-listed address set
    AddressSet,
    /// Established and related traffic
    Established,
    /// Local bridge networks
    Bridge,
    /// Egress to the address set
    Egress,
    /// Drop policies and explicit rejects
    DefaultDeny,
}

/// Tool a command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    /// `iptables`
    Iptables,
    /// `ipset`
    Ipset,
    /// `ip6tables`
    Ip6tables,
}

impl Program {
    /// Executable name
    pub fn as_str(&self) -> &'static str {
        match self {
            Program::Iptables => "iptables",
            Program::Ipset => "ipset",
            Program::Ip6tables => "ip6tables",
        }
    }
}

/// One firewall command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallCommand {
    /// Installation phase
    pub stage: Stage,
    /// Tool to run
    pub program: Program,
    /// Arguments
    pub args: Vec<String>,
    /// Failure is expected when there is nothing to reset
    pub may_fail: bool,
}

impl FirewallCommand {
    fn new(stage: Stage, program: Program, args: &[&str]) -> Self {
        Self {
            stage,
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
            may_fail: false,
        }
    }

    fn iptables(stage: Stage, args: &[&str]) -> Self {
        Self::new(stage, Program::Iptables, args)
    }

    fn ipset(stage: Stage, args: &[&str]) -> Self {
        Self::new(stage, Program::Ipset, args)
    }

    /// IPv6 commands are best effort: kernels without IPv6 have no ip6 tables
    fn ip6tables(stage: Stage, args: &[&str]) -> Self {
        Self::new(stage, Program::Ip6tables, args).tolerate_failure()
    }

    fn tolerate_failure(mut self) -> Self {
        self.may_fail = true;
        self
    }
}

impl fmt::Display for FirewallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program.as_str(), shell_words::join(&self.args))
    }
}

/// A compiled firewall policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    /// Every allow-listed network, as loaded into [`ADDRESS_SET`]
    pub address_set: BTreeSet<Ipv4Cidr>,
    /// Bridge networks kept open in both directions
    pub bridge_networks: Vec<Ipv4Cidr>,
    /// Commands in installation order
    pub commands: Vec<FirewallCommand>,
}

impl RuleSet {
    /// Commands of one stage
    pub fn stage(&self, stage: Stage) -> impl Iterator<Item = &FirewallCommand> {
        self.commands.iter().filter(move |c| c.stage == stage)
    }
}

/// Compile the default-deny policy.
///
/// `preserved_nat` holds `iptables-save` lines for Docker's embedded DNS,
/// replayed right after the flush.
pub fn compile(
    allow_list: &[AllowListEntry],
    bridge_networks: &[Ipv4Cidr],
    preserved_nat: &[String],
) -> RuleSet {
    use Stage::*;

    let mut commands = reset_commands(preserved_nat);
    commands.extend([
        FirewallCommand::iptables(Base, &["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"]),
        FirewallCommand::iptables(Base, &["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]),
    ]);
    for proto in ["udp", "tcp"] {
        commands.push(FirewallCommand::iptables(
            Base,
            &["-A", "OUTPUT", "-p", proto, "--dport", "53", "-j", "ACCEPT"],
        ));
        commands.push(FirewallCommand::iptables(
            Base,
            &["-A", "INPUT", "-p", proto, "--sport", "53", "-j", "ACCEPT"],
        ));
    }
    commands.extend([
        FirewallCommand::iptables(Base, &["-A", "OUTPUT", "-p", "tcp", "--dport", "22", "-j", "ACCEPT"]),
        FirewallCommand::iptables(
            Base,
            &["-A", "INPUT", "-p", "tcp", "--sport", "22", "-m", "conntrack", "--ctstate", "ESTABLISHED", "-j", "ACCEPT"],
        ),
    ]);

    let address_set: BTreeSet<Ipv4Cidr> = allow_list
        .iter()
        .flat_map(|entry| entry.networks.iter().copied())
        .collect();
    commands.push(FirewallCommand::ipset(AddressSet, &["create", ADDRESS_SET, "hash:net"]));
    for net in &address_set {
        let net = net.to_string();
        commands.push(FirewallCommand::ipset(AddressSet, &["add", ADDRESS_SET, net.as_str(), "-exist"]));
    }

    for chain in ["INPUT", "OUTPUT"] {
        commands.push(FirewallCommand::iptables(
            Established,
            &["-A", chain, "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
        ));
    }

    let mut bridges: Vec<Ipv4Cidr> = Vec::with_capacity(bridge_networks.len());
    for net in bridge_networks {
        if bridges.contains(net) {
            continue;
        }
        if net.prefix() == 0 {
            warn!("Ignoring bridge network {} that would open everything", net);
            continue;
        }
        bridges.push(*net);
        let net = net.to_string();
        commands.push(FirewallCommand::iptables(Bridge, &["-A", "INPUT", "-s", net.as_str(), "-j", "ACCEPT"]));
        commands.push(FirewallCommand::iptables(Bridge, &["-A", "OUTPUT", "-d", net.as_str(), "-j", "ACCEPT"]));
    }

    commands.push(FirewallCommand::iptables(
        Egress,
        &["-A", "OUTPUT", "-m", "set", "--match-set", ADDRESS_SET, "dst", "-j", "ACCEPT"],
    ));

    commands.extend(policy_commands(DefaultDeny, "DROP"));
    commands.extend([
        FirewallCommand::ip6tables(DefaultDeny, &["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"]),
        FirewallCommand::ip6tables(DefaultDeny, &["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]),
    ]);
    commands.extend(ip6_policy_commands(DefaultDeny, "DROP"));
    for chain in ["INPUT", "OUTPUT"] {
        commands.push(FirewallCommand::iptables(
            DefaultDeny,
            &["-A", chain, "-p", "tcp", "-j", "REJECT", "--reject-with", "tcp-reset"],
        ));
        commands.push(FirewallCommand::iptables(
            DefaultDeny,
            &["-A", chain, "-j", "REJECT", "--reject-with", "icmp-port-unreachable"],
        ));
    }

    RuleSet {
        address_set,
        bridge_networks: bridges,
        commands,
    }
}

/// Commands that remove every rule and set and open all chains again
pub fn clear_commands(preserved_nat: &[String]) -> Vec<FirewallCommand> {
    let mut commands = reset_commands(preserved_nat);
    commands.extend(ip6_policy_commands(Stage::Reset, "ACCEPT"));
    commands.extend(policy_commands(Stage::Reset, "ACCEPT"));
    commands
}

/// Commands that close every chain, used when installation fails midway
pub fn lockdown_commands() -> Vec<FirewallCommand> {
    let mut commands = ip6_policy_commands(Stage::DefaultDeny, "DROP");
    commands.extend(policy_commands(Stage::DefaultDeny, "DROP"));
    commands
}

fn policy_commands(stage: Stage, policy: &str) -> Vec<FirewallCommand> {
    ["INPUT", "FORWARD", "OUTPUT"]
        .into_iter()
        .map(|chain| FirewallCommand::iptables(stage, &["-P", chain, policy]))
        .collect()
}

fn ip6_policy_commands(stage: Stage, policy: &str) -> Vec<FirewallCommand> {
    ["INPUT", "FORWARD", "OUTPUT"]
        .into_iter()
        .map(|chain| FirewallCommand::ip6tables(stage, &["-P", chain, policy]))
        .collect()
}

fn reset_commands(preserved_nat: &[String]) -> Vec<FirewallCommand> {
    let mut commands = Vec::new();
    for table in ["filter", "nat", "mangle"] {
        commands.push(FirewallCommand::iptables(Stage::Reset, &["-t", table, "-F"]));
        commands.push(FirewallCommand::iptables(Stage::Reset, &["-t", table, "-X"]));
    }
    commands.push(FirewallCommand::ip6tables(Stage::Reset, &["-F"]));
    commands.push(FirewallCommand::ip6tables(Stage::Reset, &["-X"]));
    commands.push(FirewallCommand::ipset(Stage::Reset, &["destroy", ADDRESS_SET]).tolerate_failure());
    commands.extend(restore_nat_commands(preserved_nat));
    commands
}

/// Replay saved NAT rules, recreating the custom chains they jump through
fn restore_nat_commands(preserved_nat: &[String]) -> Vec<FirewallCommand> {
    let rules: Vec<Vec<String>> = preserved_nat
        .iter()
        .filter_map(|line| match shell_words::split(line) {
            Ok(args) if args.first().map(String::as_str) == Some("-A") => Some(args),
            Ok(_) => None,
            Err(e) => {
                warn!("Dropping unparsable NAT rule {:?}: {}", line, e);
                None
            }
        })
        .collect();

    let mut chains: BTreeSet<&str> = BTreeSet::new();
    for args in &rules {
        for pair in args.windows(2) {
            if (pair[0] == "-A" || pair[0] == "-j") && pair[1].starts_with("DOCKER_") {
                chains.insert(pair[1].as_str());
            }
        }
    }

    let mut commands: Vec<FirewallCommand> = chains
        .into_iter()
        .map(|chain| FirewallCommand::iptables(Stage::Reset, &["-t", "nat", "-N", chain]).tolerate_failure())
        .collect();
    for args in rules {
        let mut full = vec!["-t".to_string(), "nat".to_string()];
        full.extend(args);
        commands.push(FirewallCommand {
            stage: Stage::Reset,
            program: Program::Iptables,
            args: full,
            may_fail: false,
        });
    }
    commands
}
