//! Bridge network driver
//!
//! Owns the host bridge (`docker0` by default), the filter/nat rules around
//! it, and the per-container interface records. Everything is served
//! through job handlers: `init_networkdriver` sets the bridge up and then
//! registers `allocate_interface`, `release_interface`, `allocate_port`
//! and `link` for the lifecycle to call.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use ipnetwork::Ipv4Network;
use log::{debug, info, warn};

use crate::engine::{Engine, Env, Job, Status};
use crate::errors::{DaemonError, Result};
use crate::network::iptables::{self, Chain};
use crate::network::ipallocator::IpAllocator;
use crate::network::portallocator::{PortAllocator, Proto};
use crate::network::portmapper::PortMapper;

/// Bridge created when the user does not name one.
pub const DEFAULT_NETWORK_BRIDGE: &str = "docker0";

/// Name of the daemon's DNAT chain.
pub const DEFAULT_CHAIN: &str = "DOCKER";

const MAX_ALLOCATED_PORT_ATTEMPTS: usize = 10;

const IP_FORWARD_PROC: &str = "/proc/sys/net/ipv4/ip_forward";

// Candidate ranges for a fresh bridge. The gateway does not sit on the
// first usable address of the /16 ranges so that it matches the /24
// gateways which predate them; existing deployments depend on it.
// 172.16.0.0/16 is skipped entirely, it collides with EC2 DNS.
const BRIDGE_ADDRS: &[&str] = &[
    "172.17.42.1/16",
    "10.0.42.1/16",
    "10.1.42.1/16",
    "10.42.42.1/16",
    "172.16.42.1/24",
    "172.16.43.1/24",
    "172.16.44.1/24",
    "10.0.42.1/24",
    "10.0.43.1/24",
    "192.168.42.1/24",
    "192.168.43.1/24",
    "192.168.44.1/24",
];

/// Networking record of one container.
struct NetworkInterface {
    ip: Ipv4Addr,
    port_mappings: Vec<(IpAddr, u16, Proto)>,
}

/// Driver state shared by the per-container handlers.
pub struct BridgeDriver {
    bridge_iface: String,
    network: Ipv4Network,
    default_binding_ip: IpAddr,
    ip_allocator: IpAllocator,
    mapper: PortMapper,
    interfaces: Mutex<HashMap<String, NetworkInterface>>,
}

/// Register the `init_networkdriver` handler. The port allocator is shared
/// with the daemon so shutdown can release every port in one sweep.
pub fn register(eng: &Arc<Engine>, allocator: Arc<PortAllocator>) -> Result<()> {
    eng.register(
        "init_networkdriver",
        Arc::new(move |job: &mut Job| init_driver(job, Arc::clone(&allocator))),
    )
}

fn init_driver(job: &mut Job, allocator: Arc<PortAllocator>) -> Status {
    let enable_iptables = job.env.get_bool("EnableIptables");
    let icc = job.env.get_bool("InterContainerCommunication");
    let ip_forward = job.env.get_bool("EnableIpForward");
    let bridge_ip = job
        .env
        .get("BridgeIP")
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let default_binding_ip = job
        .env
        .get("DefaultBindingIP")
        .and_then(|s| s.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let configured_iface = job
        .env
        .get("BridgeIface")
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let using_default_bridge = configured_iface.is_none();
    let bridge_iface = configured_iface.unwrap_or_else(|| DEFAULT_NETWORK_BRIDGE.to_string());

    let network = match get_iface_addr(&bridge_iface) {
        Some(existing) => {
            // Validate that the bridge ip matches the configured BridgeIP.
            if let Some(ref bip) = bridge_ip {
                let parsed: Ipv4Network = match bip.parse() {
                    Ok(n) => n,
                    Err(e) => return job.errorf(format_args!("invalid bridge ip {}: {}", bip, e)),
                };
                if existing.ip() != parsed.ip() {
                    return job.errorf(format_args!(
                        "bridge ip ({}) does not match existing bridge configuration {}",
                        existing.ip(),
                        parsed.ip()
                    ));
                }
            }
            existing
        }
        None => {
            // If we're not using the default bridge, fail without trying to
            // create it.
            if !using_default_bridge {
                return job.errorf(format_args!("bridge not found: {}", bridge_iface));
            }
            job.logf(format_args!("creating new bridge for {}", bridge_iface));
            match create_bridge(&bridge_iface, bridge_ip.as_deref()) {
                Ok(network) => network,
                Err(e) => return job.error(&e),
            }
        }
    };

    if enable_iptables
        && let Err(e) = setup_iptables(&bridge_iface, network, icc)
    {
        return job.error(&e);
    }

    if ip_forward
        && let Err(e) = fs::write(IP_FORWARD_PROC, "1\n")
    {
        job.logf(format_args!("WARNING: unable to enable IPv4 forwarding: {}", e));
    }

    // Recreate the DNAT chain from scratch so re-initialization cannot
    // accumulate stale rules.
    if let Err(e) = iptables::remove_existing_chain(DEFAULT_CHAIN) {
        return job.error(&e);
    }

    let mapper = PortMapper::new(allocator);
    if enable_iptables {
        match Chain::new(DEFAULT_CHAIN, &bridge_iface) {
            Ok(chain) => mapper.set_chain(chain),
            Err(e) => return job.error(&e),
        }
    }

    let driver = Arc::new(BridgeDriver {
        bridge_iface,
        network,
        default_binding_ip,
        ip_allocator: IpAllocator::new(),
        mapper,
        interfaces: Mutex::new(HashMap::new()),
    });

    let eng = Arc::clone(job.engine());
    let handlers: [(&str, fn(&BridgeDriver, &mut Job) -> Status); 4] = [
        ("allocate_interface", BridgeDriver::allocate),
        ("release_interface", BridgeDriver::release),
        ("allocate_port", BridgeDriver::allocate_port),
        ("link", BridgeDriver::link),
    ];
    for (name, f) in handlers {
        let driver = Arc::clone(&driver);
        // On re-initialization the handlers are already installed; the
        // bridge and ruleset above were revalidated, so that is not an
        // error.
        if let Err(e) = eng.register(name, Arc::new(move |job: &mut Job| f(&driver, job))) {
            debug!("handler {} already registered: {}", name, e);
        }
    }
    Status::Ok
}

impl BridgeDriver {
    /// `allocate_interface CONTAINER_ID`: reserve an address and record the
    /// interface.
    fn allocate(&self, job: &mut Job) -> Status {
        let Some(id) = job.arg(0).map(str::to_string) else {
            return job.errorf("usage: allocate_interface CONTAINER_ID");
        };
        let requested: Option<Ipv4Addr> = job.env.get("RequestedIP").and_then(|s| s.parse().ok());

        let ip = match self.ip_allocator.request_ip(self.network, requested) {
            Ok(ip) => ip,
            Err(e) => return job.error(&e),
        };
        self.interfaces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                id,
                NetworkInterface {
                    ip,
                    port_mappings: Vec::new(),
                },
            );

        let mut out = Env::new();
        out.set("IP", &ip.to_string());
        out.set("Mask", &self.network.mask().to_string());
        out.set("Gateway", &self.network.ip().to_string());
        out.set("Bridge", &self.bridge_iface);
        out.set_int("IPPrefixLen", self.network.prefix() as i64);
        if out.write_to(&mut job.stdout).is_err() {
            return job.errorf("failed to write interface settings");
        }
        Status::Ok
    }

    /// `release_interface CONTAINER_ID`: unmap ports, free the address.
    /// Releasing an unknown id is a no-op.
    fn release(&self, job: &mut Job) -> Status {
        let Some(id) = job.arg(0) else {
            return job.errorf("usage: release_interface CONTAINER_ID");
        };
        let id = id.to_string();
        let iface = self
            .interfaces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        let Some(iface) = iface else {
            job.logf(format_args!("no network information to release for {}", id));
            return Status::Ok;
        };
        for (host_ip, host_port, proto) in &iface.port_mappings {
            if let Err(e) = self.mapper.unmap(*host_ip, *host_port, *proto) {
                info!("unable to unmap port {}:{}/{}: {}", host_ip, host_port, proto, e);
            }
        }
        self.ip_allocator.release_ip(self.network, iface.ip);
        Status::Ok
    }

    /// `allocate_port CONTAINER_ID`: publish one container port on the host.
    fn allocate_port(&self, job: &mut Job) -> Status {
        let Some(id) = job.arg(0).map(str::to_string) else {
            return job.errorf("usage: allocate_port CONTAINER_ID");
        };
        let host_ip: IpAddr = job
            .env
            .get("HostIP")
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.default_binding_ip);
        let host_port = job.env.get_int("HostPort").unwrap_or(0) as u16;
        let container_port = job.env.get_int("ContainerPort").unwrap_or(0) as u16;
        let proto: Proto = match job.env.get("Proto").unwrap_or("tcp").parse() {
            Ok(p) => p,
            Err(e) => return job.error(&e),
        };

        let container_ip = {
            let interfaces = self.interfaces.lock().unwrap_or_else(|p| p.into_inner());
            match interfaces.get(&id) {
                Some(iface) => iface.ip,
                None => {
                    return job.errorf(format_args!("no network interface allocated for {}", id));
                }
            }
        };
        let container = SocketAddrV4::new(container_ip, container_port);

        // Try up to 10 times to get a port that's not already allocated.
        // Explicitly chosen ports are not retried.
        let mut attempt_err = None;
        for _ in 0..MAX_ALLOCATED_PORT_ATTEMPTS {
            match self.mapper.map(container, proto, host_ip, host_port) {
                Ok(mapping) => {
                    self.interfaces
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .entry(id)
                        .and_modify(|iface| {
                            iface
                                .port_mappings
                                .push((mapping.host_ip, mapping.host_port, mapping.proto))
                        });
                    let mut out = Env::new();
                    out.set("HostIP", &mapping.host_ip.to_string());
                    out.set_int("HostPort", mapping.host_port as i64);
                    let _ = out.write_to(&mut job.stdout);
                    return Status::Ok;
                }
                Err(e @ DaemonError::PortAlreadyAllocated { .. }) => {
                    if host_port != 0 {
                        job.logf(format_args!(
                            "failed to bind {}:{}/{} for container address {}",
                            host_ip, host_port, proto, container
                        ));
                        return job.error(&e);
                    }
                    job.logf(format_args!(
                        "failed to bind for container address {}, trying another port",
                        container
                    ));
                    attempt_err = Some(e);
                }
                Err(e) => {
                    job.logf(format_args!(
                        "received an unexpected error during port allocation: {}",
                        e
                    ));
                    return job.error(&e);
                }
            }
        }
        let err = attempt_err.unwrap_or(DaemonError::AllPortsAllocated);
        job.error(&err)
    }

    /// `link ACTION` with ChildIP/ParentIP/Ports env: toggle the FORWARD
    /// rules allowing parent and child to talk on the declared ports.
    fn link(&self, job: &mut Job) -> Status {
        let Some(action) = job.arg(0).map(str::to_string) else {
            return job.errorf("usage: link ACTION");
        };
        if action != "-I" && action != "-D" {
            return job.errorf(format_args!("invalid link action {}", action));
        }
        let child_ip = job.env.get("ChildIP").unwrap_or_default().to_string();
        let parent_ip = job.env.get("ParentIP").unwrap_or_default().to_string();
        let ignore_errors = job.env.get_bool("IgnoreErrors");
        let ports = job.env.get_list("Ports");

        let action = action.as_str();
        let bridge = self.bridge_iface.as_str();
        let (child_ip, parent_ip) = (child_ip.as_str(), parent_ip.as_str());
        for spec in &ports {
            let Some((port, proto)) = spec.split_once('/') else {
                return job.errorf(format_args!("invalid port format for {}", spec));
            };

            let rules: [[&str; 15]; 2] = [
                [
                    action, "FORWARD", "-i", bridge, "-o", bridge,
                    "-p", proto, "-s", parent_ip, "--dport", port, "-d", child_ip, "-j",
                ],
                [
                    action, "FORWARD", "-i", bridge, "-o", bridge,
                    "-p", proto, "-s", child_ip, "--sport", port, "-d", parent_ip, "-j",
                ],
            ];
            for rule in rules {
                let mut args: Vec<&str> = rule.to_vec();
                args.push("ACCEPT");
                if let Err(e) = iptables::raw(&args)
                    && !ignore_errors
                {
                    return job.error(&e);
                }
            }
        }
        Status::Ok
    }
}

/// Program the NAT and FORWARD policy around the bridge.
fn setup_iptables(bridge: &str, network: Ipv4Network, icc: bool) -> Result<()> {
    // Masquerade traffic leaving the bridge network on any other interface.
    let cidr = network.to_string();
    let nat_args = [
        "-t", "nat", "POSTROUTING", "-s", cidr.as_str(), "!", "-o", bridge, "-j", "MASQUERADE",
    ];
    if !iptables::exists(&nat_args) {
        let mut add = nat_args.to_vec();
        add.insert(2, "-I");
        iptables::raw(&add)
            .map_err(|e| DaemonError::Kernel(format!("unable to enable network bridge NAT: {}", e)))?;
    }

    // Bridge-to-bridge traffic follows the inter-container-communication
    // flag. The opposite-polarity rule is removed first so re-initialization
    // with a flipped flag converges.
    let icc_args = ["FORWARD", "-i", bridge, "-o", bridge, "-j"];
    let accept: Vec<&str> = icc_args.iter().chain(&["ACCEPT"]).copied().collect();
    let drop: Vec<&str> = icc_args.iter().chain(&["DROP"]).copied().collect();
    let (install, uninstall) = if icc {
        debug!("enable inter-container communication");
        (&accept, &drop)
    } else {
        debug!("disable inter-container communication");
        (&drop, &accept)
    };
    let mut del = uninstall.clone();
    del.insert(0, "-D");
    let _ = iptables::raw(&del);
    if !iptables::exists(install) {
        let mut add = install.clone();
        add.insert(0, "-I");
        iptables::raw(&add).map_err(|e| {
            DaemonError::Kernel(format!("unable to toggle intercontainer communication: {}", e))
        })?;
    }

    // Accept all non-intercontainer outgoing packets.
    let outgoing = ["FORWARD", "-i", bridge, "!", "-o", bridge, "-j", "ACCEPT"];
    if !iptables::exists(&outgoing) {
        let mut add = outgoing.to_vec();
        add.insert(0, "-I");
        iptables::raw(&add)
            .map_err(|e| DaemonError::Kernel(format!("unable to allow outgoing packets: {}", e)))?;
    }

    // Accept incoming packets belonging to existing connections.
    let established = [
        "FORWARD", "-o", bridge, "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j",
        "ACCEPT",
    ];
    if !iptables::exists(&established) {
        let mut add = established.to_vec();
        add.insert(0, "-I");
        iptables::raw(&add)
            .map_err(|e| DaemonError::Kernel(format!("unable to allow incoming packets: {}", e)))?;
    }
    Ok(())
}

/// Address of an existing interface, if the interface exists and carries an
/// IPv4 address.
fn get_iface_addr(name: &str) -> Option<Ipv4Network> {
    if !Path::new("/sys/class/net").join(name).exists() {
        return None;
    }
    let output = Command::new("ip")
        .args(["-o", "-4", "addr", "show", "dev", name])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_iface_addr(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the `inet A.B.C.D/P` token out of `ip -o -4 addr show` output.
fn parse_iface_addr(output: &str) -> Option<Ipv4Network> {
    let mut tokens = output.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "inet" {
            return tokens.next().and_then(|cidr| cidr.parse().ok());
        }
    }
    None
}

fn run_ip(args: &[&str]) -> Result<()> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| DaemonError::Kernel(format!("failed to run ip: {}", e)))?;
    if !output.status.success() {
        return Err(DaemonError::Kernel(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Create the bridge with an address that conflicts with neither the host's
/// nameservers nor its routes.
fn create_bridge(iface: &str, bridge_ip: Option<&str>) -> Result<Ipv4Network> {
    let nameservers = super::resolvconf::get_nameservers_as_cidr(&super::resolvconf::get());

    let chosen = if let Some(bip) = bridge_ip {
        bip.parse::<Ipv4Network>()
            .map_err(|e| DaemonError::Validation(format!("invalid bridge ip {}: {}", bip, e)))?
    } else {
        let routes = host_routes();
        let mut found = None;
        for addr in BRIDGE_ADDRS {
            let candidate: Ipv4Network = addr.parse().expect("hard-coded CIDR");
            if nameservers.iter().any(|ns| networks_overlap(&candidate, ns)) {
                debug!("{} overlaps a nameserver", candidate);
                continue;
            }
            if routes.iter().any(|r| networks_overlap(&candidate, r)) {
                debug!("{} overlaps an existing route", candidate);
                continue;
            }
            found = Some(candidate);
            break;
        }
        found.ok_or_else(|| DaemonError::NoFreeRange(iface.to_string()))?
    };

    debug!("creating bridge {} with network {}", iface, chosen);
    run_ip(&["link", "add", "name", iface, "type", "bridge"])?;
    run_ip(&["addr", "add", &chosen.to_string(), "dev", iface])?;
    run_ip(&["link", "set", "dev", iface, "up"])?;
    Ok(chosen)
}

fn networks_overlap(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Networks reachable through existing host routes.
fn host_routes() -> Vec<Ipv4Network> {
    match fs::read_to_string("/proc/net/route") {
        Ok(table) => parse_routes(&table),
        Err(e) => {
            warn!("unable to read route table: {}", e);
            Vec::new()
        }
    }
}

/// Parse `/proc/net/route`: destination and mask are little-endian hex.
fn parse_routes(table: &str) -> Vec<Ipv4Network> {
    let mut routes = Vec::new();
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let (Ok(dest), Ok(mask)) = (
            u32::from_str_radix(fields[1], 16),
            u32::from_str_radix(fields[7], 16),
        ) else {
            continue;
        };
        if mask == 0 {
            // Default route covers everything; ignore it.
            continue;
        }
        let ip = Ipv4Addr::from(dest.to_le_bytes());
        if let Ok(net) = Ipv4Network::new(ip, mask.count_ones() as u8) {
            routes.push(net);
        }
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_list_starts_with_large_range() {
        assert_eq!(BRIDGE_ADDRS[0], "172.17.42.1/16");
        for addr in BRIDGE_ADDRS {
            addr.parse::<Ipv4Network>().unwrap();
        }
    }

    #[test]
    fn test_networks_overlap() {
        let a: Ipv4Network = "172.17.42.1/16".parse().unwrap();
        let b: Ipv4Network = "172.17.0.5/32".parse().unwrap();
        let c: Ipv4Network = "10.0.0.0/8".parse().unwrap();
        assert!(networks_overlap(&a, &b));
        assert!(!networks_overlap(&a, &c));
        // Containment in either direction counts.
        assert!(networks_overlap(&c, &"10.1.0.0/16".parse().unwrap()));
    }

    #[test]
    fn test_parse_routes() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
                     eth0\t00000000\t010011AC\t0003\t0\t0\t0\t00000000\t0\t0\t0\n\
                     eth0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0\n";
        let routes = parse_routes(table);
        // The default route is skipped; the 172.17.0.0/16 link route stays.
        assert_eq!(routes, vec!["172.17.0.0/16".parse().unwrap()]);
    }

    #[test]
    fn test_parse_routes_garbage_tolerated() {
        assert!(parse_routes("junk\nnot-a-route line\n").is_empty());
    }

    #[test]
    fn test_parse_iface_addr() {
        let output = "4: docker0    inet 172.17.42.1/16 brd 172.17.255.255 scope global docker0\\       valid_lft forever preferred_lft forever\n";
        let net = parse_iface_addr(output).unwrap();
        assert_eq!(net.ip(), Ipv4Addr::new(172, 17, 42, 1));
        assert_eq!(net.prefix(), 16);
    }

    #[test]
    fn test_parse_iface_addr_no_inet() {
        assert!(parse_iface_addr("4: docker0 <BROADCAST> mtu 1500\n").is_none());
    }

    #[test]
    fn test_candidates_avoid_nameserver() {
        let nameservers = vec!["172.17.0.53/32".parse::<Ipv4Network>().unwrap()];
        let first_clear = BRIDGE_ADDRS
            .iter()
            .map(|a| a.parse::<Ipv4Network>().unwrap())
            .find(|c| !nameservers.iter().any(|ns| networks_overlap(c, ns)))
            .unwrap();
        // 172.17.42.1/16 shadows the nameserver, the next /16 does not.
        assert_eq!(first_clear, "10.0.42.1/16".parse().unwrap());
    }
}
