//! Networking layer: bridge driver, allocators, port mapping, iptables
//!
//! The lifecycle never calls this module directly; it goes through the job
//! bus (`init_networkdriver`, `allocate_interface`, `release_interface`,
//! `allocate_port`, `link`), which keeps the shared kernel state (bridge
//! device, iptables tables, ip_forward) mutated from exactly one place.

pub mod bridge;
pub mod ipallocator;
pub mod iptables;
pub mod portallocator;
pub mod portmapper;
pub mod resolvconf;

pub use bridge::{DEFAULT_CHAIN, DEFAULT_NETWORK_BRIDGE};
pub use ipallocator::IpAllocator;
pub use portallocator::{PortAllocator, Proto};
pub use portmapper::{Mapping, PortMapper};
