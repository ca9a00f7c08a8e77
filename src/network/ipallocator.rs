//! Per-network IP address pools
//!
//! Hands out container addresses inside the bridge CIDR. The network
//! address, the gateway (the bridge's own address) and the broadcast
//! address are never allocatable.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;

use crate::errors::{DaemonError, Result};

/// Free-address pools keyed by network.
#[derive(Default)]
pub struct IpAllocator {
    networks: Mutex<HashMap<Ipv4Network, HashSet<u32>>>,
}

fn reserved(network: &Ipv4Network) -> [u32; 3] {
    [
        u32::from(network.network()),
        u32::from(network.ip()),
        u32::from(network.broadcast()),
    ]
}

impl IpAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an address in `network`. With `requested`, that exact
    /// address is reserved or the call fails; otherwise the lowest free
    /// address is picked.
    pub fn request_ip(
        &self,
        network: Ipv4Network,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let mut pools = self.networks.lock().unwrap_or_else(|p| p.into_inner());
        let in_use = pools.entry(network).or_default();
        let reserved = reserved(&network);

        if let Some(ip) = requested {
            if !network.contains(ip) {
                return Err(DaemonError::Validation(format!(
                    "requested IP {} is not in network {}",
                    ip, network
                )));
            }
            let raw = u32::from(ip);
            if reserved.contains(&raw) || !in_use.insert(raw) {
                return Err(DaemonError::AddressInUse(ip.into()));
            }
            return Ok(ip);
        }

        let first = u32::from(network.network()) + 1;
        let last = u32::from(network.broadcast());
        for raw in first..last {
            if reserved.contains(&raw) {
                continue;
            }
            if in_use.insert(raw) {
                return Ok(Ipv4Addr::from(raw));
            }
        }
        Err(DaemonError::IpExhausted(network.to_string()))
    }

    /// Return `ip` to the pool. Releasing a free address is a no-op.
    pub fn release_ip(&self, network: Ipv4Network, ip: Ipv4Addr) {
        let mut pools = self.networks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(in_use) = pools.get_mut(&network) {
            in_use.remove(&u32::from(ip));
        }
    }

    /// Number of addresses currently handed out in `network`.
    pub fn allocated(&self, network: Ipv4Network) -> usize {
        self.networks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&network)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_net() -> Ipv4Network {
        // Bridge at .42.1, the gateway convention of the /16 default range.
        "172.17.42.1/16".parse().unwrap()
    }

    #[test]
    fn test_lowest_free_first() {
        let alloc = IpAllocator::new();
        let ip = alloc.request_ip(bridge_net(), None).unwrap();
        assert_eq!(ip, Ipv4Addr::new(172, 17, 0, 1));
        let ip2 = alloc.request_ip(bridge_net(), None).unwrap();
        assert_eq!(ip2, Ipv4Addr::new(172, 17, 0, 2));
    }

    #[test]
    fn test_gateway_not_allocatable() {
        let net: Ipv4Network = "192.168.42.1/24".parse().unwrap();
        let alloc = IpAllocator::new();
        // .1 is the bridge address here, so the pool starts at .2.
        assert_eq!(
            alloc.request_ip(net, None).unwrap(),
            Ipv4Addr::new(192, 168, 42, 2)
        );
        let err = alloc
            .request_ip(net, Some(Ipv4Addr::new(192, 168, 42, 1)))
            .unwrap_err();
        assert!(matches!(err, DaemonError::AddressInUse(_)));
    }

    #[test]
    fn test_specific_request() {
        let alloc = IpAllocator::new();
        let wanted = Ipv4Addr::new(172, 17, 0, 99);
        assert_eq!(
            alloc.request_ip(bridge_net(), Some(wanted)).unwrap(),
            wanted
        );
        assert!(matches!(
            alloc.request_ip(bridge_net(), Some(wanted)),
            Err(DaemonError::AddressInUse(_))
        ));
    }

    #[test]
    fn test_request_outside_network() {
        let alloc = IpAllocator::new();
        let err = alloc
            .request_ip(bridge_net(), Some(Ipv4Addr::new(10, 0, 0, 5)))
            .unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }

    #[test]
    fn test_release_idempotent_and_reusable() {
        let alloc = IpAllocator::new();
        let ip = alloc.request_ip(bridge_net(), None).unwrap();
        alloc.release_ip(bridge_net(), ip);
        alloc.release_ip(bridge_net(), ip);
        assert_eq!(alloc.request_ip(bridge_net(), None).unwrap(), ip);
    }

    #[test]
    fn test_pool_exhaustion() {
        // /30: network, two hosts, broadcast. The bridge sits on the first
        // host address, leaving exactly one allocatable address.
        let net: Ipv4Network = "10.1.1.1/30".parse().unwrap();
        let alloc = IpAllocator::new();
        assert_eq!(
            alloc.request_ip(net, None).unwrap(),
            Ipv4Addr::new(10, 1, 1, 2)
        );
        assert!(matches!(
            alloc.request_ip(net, None),
            Err(DaemonError::IpExhausted(_))
        ));
    }

    #[test]
    fn test_networks_independent() {
        let a: Ipv4Network = "10.0.42.1/24".parse().unwrap();
        let b: Ipv4Network = "10.1.42.1/24".parse().unwrap();
        let alloc = IpAllocator::new();
        alloc.request_ip(a, None).unwrap();
        assert_eq!(alloc.allocated(a), 1);
        assert_eq!(alloc.allocated(b), 0);
    }
}
