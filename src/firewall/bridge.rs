//! Discovery of local container bridge networks

use crate::error::{Result, SandboxError};
use crate::firewall::cidr::Ipv4Cidr;
use crate::firewall::CommandRunner;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Read the IPv4 routing table and return the bridge networks to keep open
pub fn discover_bridge_networks(runner: &dyn CommandRunner) -> Result<Vec<Ipv4Cidr>> {
    let args = ["-4", "route", "show"].map(String::from);
    let output = runner.run("ip", &args)?;
    if !output.success() {
        return Err(SandboxError::Firewall(format!(
            "ip route failed: {}",
            output.stderr.trim()
        )));
    }

    let networks = bridge_networks_from_routes(&output.stdout)?;
    info!(
        "Bridge networks: {}",
        networks
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(networks)
}

/// Pick bridge networks out of `ip -4 route show` output.
///
/// Routes inside 172.17.0.0–172.31.255.255, 192.168.0.0/16 and 10.0.0.0/8
/// are kept. With none present, the /24 around the default gateway is used.
pub fn bridge_networks_from_routes(routes: &str) -> Result<Vec<Ipv4Cidr>> {
    let mut networks: Vec<Ipv4Cidr> = Vec::new();
    let mut gateway: Option<Ipv4Addr> = None;

    for line in routes.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(dest) = fields.first() else {
            continue;
        };

        if *dest == "default" {
            if gateway.is_none() {
                gateway = fields
                    .windows(2)
                    .find(|w| w[0] == "via")
                    .and_then(|w| w[1].parse().ok());
            }
            continue;
        }

        match dest.parse::<Ipv4Cidr>() {
            Ok(cidr) if is_bridge_range(&cidr) && !networks.contains(&cidr) => networks.push(cidr),
            Ok(_) => {}
            Err(e) => debug!("Skipping route {:?}: {}", line, e),
        }
    }

    if networks.is_empty() {
        let gateway = gateway.ok_or_else(|| {
            SandboxError::Firewall("no bridge network or default route found".to_string())
        })?;
        debug!("No bridge routes, falling back to default gateway {}", gateway);
        networks.push(Ipv4Cidr::new(gateway, 24));
    }

    Ok(networks)
}

fn is_bridge_range(cidr: &Ipv4Cidr) -> bool {
    let [a, b, ..] = cidr.network().octets();
    let docker = a == 172 && (17..=31).contains(&b) && cidr.prefix() >= 16;
    let lan = Ipv4Cidr::new(Ipv4Addr::new(192, 168, 0, 0), 16);
    let private = Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 8);
    docker || cidr.is_within(&lan) || cidr.is_within(&private)
}
