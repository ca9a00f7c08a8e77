//! Host port allocation per (address, protocol)
//!
//! Tracks the ports the daemon hands out for published container ports. An
//! explicit request succeeds only when the port is currently free; a request
//! for port 0 picks any free port in the dynamic range.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::{DaemonError, Result};

/// First port handed out for automatic allocations.
pub const BEGIN_PORT_RANGE: u16 = 1024;
/// Last allocatable port.
pub const END_PORT_RANGE: u16 = 65535;

/// Transport protocol of a port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[default]
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Proto {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            other => Err(DaemonError::Validation(format!(
                "unsupported address type {}",
                other
            ))),
        }
    }
}

#[derive(Default)]
struct PortSet {
    in_use: HashSet<u16>,
    last: u16,
}

/// Per (host address, protocol) port pool.
#[derive(Default)]
pub struct PortAllocator {
    state: Mutex<HashMap<(IpAddr, Proto), PortSet>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `port` on `ip`/`proto`; `port == 0` picks any free port in
    /// [BEGIN_PORT_RANGE, END_PORT_RANGE].
    pub fn request_port(&self, ip: IpAddr, proto: Proto, port: u16) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let set = state.entry((ip, proto)).or_default();

        if port != 0 {
            if !set.in_use.insert(port) {
                return Err(DaemonError::PortAlreadyAllocated {
                    ip,
                    port,
                    proto: proto.to_string(),
                });
            }
            return Ok(port);
        }

        let span = (END_PORT_RANGE - BEGIN_PORT_RANGE) as u32 + 1;
        let start = if set.last < BEGIN_PORT_RANGE {
            BEGIN_PORT_RANGE
        } else {
            set.last
        };
        for i in 1..=span {
            let candidate =
                BEGIN_PORT_RANGE + (((start - BEGIN_PORT_RANGE) as u32 + i) % span) as u16;
            if set.in_use.insert(candidate) {
                set.last = candidate;
                return Ok(candidate);
            }
        }
        Err(DaemonError::AllPortsAllocated)
    }

    /// Return `port` to the pool. Releasing an unallocated port is a no-op.
    pub fn release_port(&self, ip: IpAddr, proto: Proto, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(set) = state.get_mut(&(ip, proto)) {
            set.in_use.remove(&port);
        }
    }

    /// Drop every reservation; used by the shutdown fan-out.
    pub fn release_all(&self) {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Number of ports currently reserved on `ip`/`proto`.
    pub fn allocated(&self, ip: IpAddr, proto: Proto) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(ip, proto))
            .map(|s| s.in_use.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn any_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    #[test]
    fn test_proto_round_trip() {
        assert_eq!("tcp".parse::<Proto>().unwrap(), Proto::Tcp);
        assert_eq!("udp".parse::<Proto>().unwrap(), Proto::Udp);
        assert_eq!(Proto::Tcp.to_string(), "tcp");
        assert!("icmp".parse::<Proto>().is_err());
    }

    #[test]
    fn test_request_specific_port() {
        let alloc = PortAllocator::new();
        assert_eq!(alloc.request_port(any_ip(), Proto::Tcp, 8080).unwrap(), 8080);
        let err = alloc.request_port(any_ip(), Proto::Tcp, 8080).unwrap_err();
        match err {
            DaemonError::PortAlreadyAllocated { ip, port, proto } => {
                assert_eq!(ip, any_ip());
                assert_eq!(port, 8080);
                assert_eq!(proto, "tcp");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_same_port_different_proto() {
        let alloc = PortAllocator::new();
        alloc.request_port(any_ip(), Proto::Tcp, 8080).unwrap();
        alloc.request_port(any_ip(), Proto::Udp, 8080).unwrap();
    }

    #[test]
    fn test_same_port_different_ip() {
        let alloc = PortAllocator::new();
        let a = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2));
        alloc.request_port(a, Proto::Tcp, 8080).unwrap();
        alloc.request_port(b, Proto::Tcp, 8080).unwrap();
    }

    #[test]
    fn test_auto_allocation_in_range() {
        let alloc = PortAllocator::new();
        let p1 = alloc.request_port(any_ip(), Proto::Tcp, 0).unwrap();
        let p2 = alloc.request_port(any_ip(), Proto::Tcp, 0).unwrap();
        assert!(p1 >= BEGIN_PORT_RANGE);
        assert!(p2 >= BEGIN_PORT_RANGE);
        assert_ne!(p1, p2);
    }

    #[test]
    fn test_auto_skips_reserved() {
        let alloc = PortAllocator::new();
        // Claim the first two auto candidates, then ask for an auto port.
        alloc
            .request_port(any_ip(), Proto::Tcp, BEGIN_PORT_RANGE + 1)
            .unwrap();
        alloc
            .request_port(any_ip(), Proto::Tcp, BEGIN_PORT_RANGE + 2)
            .unwrap();
        let p = alloc.request_port(any_ip(), Proto::Tcp, 0).unwrap();
        assert!(p != BEGIN_PORT_RANGE + 1 && p != BEGIN_PORT_RANGE + 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let alloc = PortAllocator::new();
        alloc.request_port(any_ip(), Proto::Tcp, 8080).unwrap();
        alloc.release_port(any_ip(), Proto::Tcp, 8080);
        alloc.release_port(any_ip(), Proto::Tcp, 8080);
        // Port is free again.
        alloc.request_port(any_ip(), Proto::Tcp, 8080).unwrap();
    }

    #[test]
    fn test_release_all() {
        let alloc = PortAllocator::new();
        alloc.request_port(any_ip(), Proto::Tcp, 8080).unwrap();
        alloc.request_port(any_ip(), Proto::Udp, 53).unwrap();
        alloc.release_all();
        assert_eq!(alloc.allocated(any_ip(), Proto::Tcp), 0);
        assert_eq!(alloc.allocated(any_ip(), Proto::Udp), 0);
    }
}
