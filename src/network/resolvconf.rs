//! resolv.conf reading and generation
//!
//! The daemon reads the host's resolver configuration to pick a bridge
//! network that does not shadow a nameserver, and writes a per-container
//! resolv.conf into the container layer at start.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use ipnetwork::Ipv4Network;

use crate::errors::Result;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Host resolver configuration; empty when unreadable (missing resolv.conf
/// is not an error, the caller just gets no nameservers).
pub fn get() -> Vec<u8> {
    fs::read(RESOLV_CONF).unwrap_or_default()
}

/// Nameserver addresses listed in `conf`, comments stripped.
pub fn get_nameservers(conf: &[u8]) -> Vec<IpAddr> {
    let text = String::from_utf8_lossy(conf);
    text.lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter_map(|l| l.strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse().ok())
        .collect()
}

/// IPv4 nameservers as host routes, for overlap checks against candidate
/// bridge networks.
pub fn get_nameservers_as_cidr(conf: &[u8]) -> Vec<Ipv4Network> {
    get_nameservers(conf)
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Ipv4Network::new(v4, 32).ok(),
            IpAddr::V6(_) => None,
        })
        .collect()
}

/// True when every configured nameserver is a loopback resolver containers
/// cannot reach.
pub fn check_local_dns(conf: &[u8]) -> bool {
    get_nameservers(conf).iter().all(|ip| match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    })
}

/// Write a resolv.conf with the given servers and search domains.
pub fn build(path: &Path, dns: &[IpAddr], dns_search: &[String]) -> Result<()> {
    let mut contents = String::new();
    for ns in dns {
        contents.push_str(&format!("nameserver {}\n", ns));
    }
    if !dns_search.is_empty() {
        contents.push_str(&format!("search {}\n", dns_search.join(" ")));
    }
    fs::write(path, contents)?;
    Ok(())
}

/// Fallback servers substituted when the host only has a local resolver.
pub fn default_dns() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
    ]
}
