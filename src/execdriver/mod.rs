//! Execution driver contract
//!
//! A driver spawns, monitors and signals container init processes. The
//! lifecycle talks to it exclusively through [`Driver`]; the shipped
//! implementation is the native clone(2)-based driver in [`native`].

pub mod native;

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::errors::{DaemonError, Result};

/// Cgroup resource limits applied to a container.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    /// Memory limit in bytes; 0 means unlimited.
    pub memory: u64,
    /// Memory+swap limit in bytes; 0 means unlimited.
    pub memory_swap: u64,
    /// Relative CPU share weight; 0 keeps the default.
    pub cpu_shares: u64,
    /// Cpuset specification, e.g. "0-2".
    pub cpuset: Option<String>,
}

/// The veth/bridge side of a container's networking.
#[derive(Debug, Clone)]
pub struct ExecInterface {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub bridge: String,
}

/// How the container's network namespace is set up.
#[derive(Debug, Clone, Default)]
pub struct ExecNetwork {
    /// Share the host's namespace instead of creating one.
    pub host_networking: bool,
    /// Bridge interface settings, when bridged.
    pub interface: Option<ExecInterface>,
    /// Join this container's network namespace instead of creating one.
    pub container_id: Option<String>,
    pub mtu: i32,
}

/// One bind mount into the container rootfs.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: PathBuf,
    /// Destination inside the container, absolute.
    pub destination: String,
    pub writable: bool,
    pub private: bool,
}

/// Everything the driver needs to start one container process.
#[derive(Debug, Clone, Default)]
pub struct ExecCommand {
    pub id: String,
    pub rootfs: PathBuf,
    pub init_path: PathBuf,
    pub entrypoint: String,
    pub arguments: Vec<String>,
    /// Environment as KEY=VALUE strings.
    pub env: Vec<String>,
    pub working_dir: String,
    pub user: String,
    pub hostname: String,
    pub tty: bool,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub network: ExecNetwork,
    pub resources: Option<Resources>,
    pub mounts: Vec<BindMount>,
    pub process_label: String,
    pub mount_label: String,
}

/// Sinks receiving the init process's stdout and stderr.
pub struct Pipes {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl Pipes {
    pub fn new(
        stdout: impl Write + Send + 'static,
        stderr: impl Write + Send + 'static,
    ) -> Self {
        Self {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// Discard all output.
    pub fn discard() -> Self {
        Self::new(std::io::sink(), std::io::sink())
    }
}

/// Driver-side view of a container, authoritative over in-memory state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Info {
    pub running: bool,
    pub pid: i32,
}

impl Info {
    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Invoked once the init process exists, before the driver blocks waiting
/// for it; the caller records the PID and wires up state.
pub type StartCallback<'a> = &'a (dyn Fn(i32) + Send + Sync);

/// Capability set every execution driver fulfills.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Start the init process and block until it exits, returning its exit
    /// code. `start_callback` fires as soon as the process exists.
    fn run(&self, cmd: &ExecCommand, pipes: Pipes, start_callback: StartCallback<'_>)
    -> Result<i32>;

    /// Send `signal` to the init process. Fails when the container is not
    /// running.
    fn kill(&self, id: &str, signal: i32) -> Result<()>;

    /// Freeze the container's process tree.
    fn pause(&self, id: &str) -> Result<()>;

    /// Thaw the container's process tree.
    fn unpause(&self, id: &str) -> Result<()>;

    /// Forceful best-effort teardown of a (possibly stale) container.
    fn terminate(&self, id: &str, pid: i32) -> Result<()>;

    /// Liveness and PID as the kernel sees them.
    fn info(&self, id: &str) -> Info;
}

/// Instantiate a driver by name. An empty name selects the default.
pub fn new_driver(name: &str, root: &Path) -> Result<Box<dyn Driver>> {
    match name {
        "" | "native" => Ok(Box::new(native::NativeDriver::new(root)?)),
        other => Err(DaemonError::Validation(format!(
            "unknown exec driver: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_driver_default_is_native() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = new_driver("", tmp.path()).unwrap();
        assert_eq!(driver.name(), "native");
    }

    #[test]
    fn test_new_driver_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(new_driver("lxc-ng", tmp.path()).is_err());
    }

    #[test]
    fn test_exec_command_default() {
        let cmd = ExecCommand::default();
        assert!(cmd.entrypoint.is_empty());
        assert!(!cmd.privileged);
        assert!(cmd.network.interface.is_none());
        assert!(cmd.resources.is_none());
    }

    #[test]
    fn test_info_default_not_running() {
        let info = Info::default();
        assert!(!info.is_running());
        assert_eq!(info.pid, 0);
    }
}
