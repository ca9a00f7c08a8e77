//! Host-to-container port mapping
//!
//! Couples the port allocator with the daemon's DNAT chain: mapping a port
//! reserves it and programs one rule rewriting host traffic to the
//! container address; unmapping reverses both. Before the chain is
//! installed (iptables disabled) mappings only reserve ports.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use log::info;

use crate::errors::{DaemonError, Result};
use crate::network::iptables::{Action, Chain};
use crate::network::portallocator::{PortAllocator, Proto};

/// One established mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub proto: Proto,
    pub container: SocketAddrV4,
}

/// Maintains the DNAT rules for published ports.
pub struct PortMapper {
    allocator: Arc<PortAllocator>,
    chain: Mutex<Option<Chain>>,
    current: Mutex<HashMap<(IpAddr, u16, Proto), Mapping>>,
}

impl PortMapper {
    pub fn new(allocator: Arc<PortAllocator>) -> Self {
        Self {
            allocator,
            chain: Mutex::new(None),
            current: Mutex::new(HashMap::new()),
        }
    }

    /// Install the iptables chain DNAT rules are written to.
    pub fn set_chain(&self, chain: Chain) {
        *self.chain.lock().unwrap_or_else(|p| p.into_inner()) = Some(chain);
    }

    /// Map `host_ip:host_port/proto` to the container address. A zero host
    /// port lets the allocator pick one. Returns the established mapping.
    pub fn map(
        &self,
        container: SocketAddrV4,
        proto: Proto,
        host_ip: IpAddr,
        host_port: u16,
    ) -> Result<Mapping> {
        let port = self.allocator.request_port(host_ip, proto, host_port)?;

        let chain = self.chain.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(chain) = &chain
            && let Err(e) = chain.forward(
                Action::Append,
                host_ip,
                port,
                proto.as_str(),
                *container.ip(),
                container.port(),
            )
        {
            self.allocator.release_port(host_ip, proto, port);
            return Err(e);
        }

        let mapping = Mapping {
            host_ip,
            host_port: port,
            proto,
            container,
        };
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((host_ip, port, proto), mapping.clone());
        Ok(mapping)
    }

    /// Tear down a mapping: delete the DNAT rule and free the port.
    pub fn unmap(&self, host_ip: IpAddr, host_port: u16, proto: Proto) -> Result<()> {
        let Some(mapping) = self
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(host_ip, host_port, proto))
        else {
            return Err(DaemonError::NotFound(format!(
                "port mapping {}:{}/{}",
                host_ip, host_port, proto
            )));
        };

        let chain = self.chain.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(chain) = &chain
            && let Err(e) = chain.forward(
                Action::Delete,
                host_ip,
                host_port,
                proto.as_str(),
                *mapping.container.ip(),
                mapping.container.port(),
            )
        {
            info!("unable to remove DNAT rule for {}:{}: {}", host_ip, host_port, e);
        }

        self.allocator.release_port(host_ip, proto, host_port);
        Ok(())
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.current.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
