//! sandboxd: a Linux container management daemon
//!
//! The daemon owns the lifecycle of OS-level containers on a single host:
//! isolated process trees under namespaces and cgroups, with a layered root
//! filesystem and bridge networking under iptables.
//!
//! # Modules
//!
//! - **engine**: the job bus every subsystem communicates through
//! - **truncindex**: prefix-unique lookup over container ids
//! - **namegraph**: persistent name/link graph backed by SQLite
//! - **store**: the in-memory container registry
//! - **network**: bridge driver, IP/port allocators, port mapper, iptables
//! - **execdriver**: process spawning under namespaces and cgroups
//! - **container**: container objects, state machine, exit monitor
//! - **daemon**: boot sequence, restore, shutdown fan-out, job handlers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sandboxd::daemon::{Daemon, DaemonConfig};
//! use sandboxd::engine::Engine;
//! use sandboxd::network::{PortAllocator, bridge};
//!
//! let eng = Engine::new();
//! let ports = Arc::new(PortAllocator::new());
//! bridge::register(&eng, Arc::clone(&ports))?;
//! let daemon = Daemon::new(DaemonConfig::default(), Arc::clone(&eng), ports)?;
//! let mut job = eng.job("containers", &[]);
//! job.run()?;
//! ```

// Core modules
pub mod errors;
pub mod names;
pub mod utils;

// Infrastructure
pub mod engine;
pub mod namegraph;
pub mod signal;
pub mod store;
pub mod truncindex;

// Subsystems
pub mod container;
pub mod execdriver;
pub mod network;
pub mod storage;

// Orchestration
pub mod daemon;

// Public API
pub use container::{Container, ContainerConfig, HostConfig, RestartPolicy};
pub use daemon::{Daemon, DaemonConfig};
pub use engine::{Engine, Job, Status};
pub use errors::{DaemonError, Result};

/// Daemon version reported by the `version` handler and used for the
/// init-binary filename.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that touch process-wide state (signals, env vars,
    /// the port allocator's shared range).
    pub fn serial_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
