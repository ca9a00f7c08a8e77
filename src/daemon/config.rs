//! Daemon configuration
//!
//! Mirrors the daemon's command-line surface; the binary's flag parser is a
//! thin shim filling this in. Validation catches the flag combinations that
//! cannot work together before any state is touched.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::errors::{DaemonError, Result};

/// Bridge name that disables container networking entirely.
pub const DISABLE_NETWORK_BRIDGE: &str = "none";

const DEFAULT_NETWORK_MTU: i32 = 1500;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Single-instance pid file.
    pub pidfile: PathBuf,
    /// Root of all daemon state.
    pub root: PathBuf,
    /// Re-start containers according to their restart policy on boot.
    pub auto_restart: bool,
    /// DNS servers handed to containers; empty copies the host's.
    pub dns: Vec<IpAddr>,
    pub dns_search: Vec<String>,
    pub enable_iptables: bool,
    pub enable_ip_forward: bool,
    /// Default address for published ports.
    pub default_ip: IpAddr,
    /// Pre-existing bridge to attach to; empty creates the default bridge,
    /// "none" disables networking.
    pub bridge_iface: String,
    /// CIDR for the bridge address; incompatible with `bridge_iface`.
    pub bridge_ip: String,
    pub inter_container_communication: bool,
    pub graph_driver: String,
    pub exec_driver: String,
    /// Container interface MTU; 0 picks the default.
    pub mtu: i32,
    pub enable_selinux_support: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pidfile: PathBuf::from("/var/run/docker.pid"),
            root: PathBuf::from("/var/lib/docker"),
            auto_restart: true,
            dns: Vec::new(),
            dns_search: Vec::new(),
            enable_iptables: true,
            enable_ip_forward: true,
            default_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bridge_iface: String::new(),
            bridge_ip: String::new(),
            inter_container_communication: true,
            graph_driver: String::new(),
            exec_driver: "native".to_string(),
            mtu: 0,
            enable_selinux_support: false,
        }
    }
}

impl DaemonConfig {
    /// Reject mutually-incompatible settings.
    pub fn validate(&self) -> Result<()> {
        if !self.bridge_iface.is_empty() && !self.bridge_ip.is_empty() {
            return Err(DaemonError::Validation(
                "you specified -b & --bip, mutually exclusive options; please specify only one"
                    .to_string(),
            ));
        }
        if !self.enable_iptables && !self.inter_container_communication {
            return Err(DaemonError::Validation(
                "you specified --iptables=false with --icc=false; ICC uses iptables to function"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn network_disabled(&self) -> bool {
        self.bridge_iface == DISABLE_NETWORK_BRIDGE
    }

    pub fn effective_mtu(&self) -> i32 {
        if self.mtu == 0 { DEFAULT_NETWORK_MTU } else { self.mtu }
    }
}
