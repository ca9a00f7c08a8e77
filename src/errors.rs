//! Error types for daemon operations

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors that can occur across the daemon subsystems
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("name graph error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Multiple ids match prefix {0}, use a longer prefix")]
    AmbiguousPrefix(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("No command specified")]
    NoCommand,

    #[error("Bind for {ip}:{port}/{proto} failed: port is already allocated")]
    PortAlreadyAllocated { ip: IpAddr, port: u16, proto: String },

    #[error("IP address is already allocated: {0}")]
    AddressInUse(IpAddr),

    #[error("all allocated ports have been exhausted")]
    AllPortsAllocated,

    #[error("no available ip addresses on network {0}")]
    IpExhausted(String),

    #[error(
        "Could not find a free IP address range for interface '{0}'. \
         Please configure its address manually"
    )]
    NoFreeRange(String),

    #[error("Kernel error: {0}")]
    Kernel(String),

    #[error("No such job handler: {0}")]
    NoSuchHandler(String),

    #[error("Job {name} failed: {message}")]
    JobFailed { name: String, message: String },

    #[error("Storage driver error: {0}")]
    Storage(String),

    #[error("Timeout exceeded")]
    Timeout,

    #[error("{0}")]
    Fatal(String),
}

impl DaemonError {
    /// Boot-time failures that must abort the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaemonError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_error_display() {
        let err = DaemonError::NoCommand;
        assert_eq!(err.to_string(), "No command specified");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = DaemonError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_port_allocated_carries_diagnostics() {
        let err = DaemonError::PortAlreadyAllocated {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            proto: "tcp".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:8080/tcp"));
        assert!(msg.contains("already allocated"));
    }

    #[test]
    fn test_fatal_detection() {
        assert!(DaemonError::Fatal("non-root".to_string()).is_fatal());
        assert!(!DaemonError::NoCommand.is_fatal());
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
