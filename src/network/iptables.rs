//! Thin wrapper over the iptables command
//!
//! All firewall state the daemon owns goes through here: raw rule
//! manipulation, existence probes, and the daemon's own nat-table chain
//! that carries the per-port DNAT rules.

use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;

use log::debug;

use crate::errors::{DaemonError, Result};

/// Rule operation passed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Append,
    Insert,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Append => "-A",
            Action::Insert => "-I",
            Action::Delete => "-D",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "-A" => Ok(Action::Append),
            "-I" => Ok(Action::Insert),
            "-D" => Ok(Action::Delete),
            other => Err(DaemonError::Validation(format!(
                "invalid iptables action {}",
                other
            ))),
        }
    }
}

/// Run iptables with `args`, returning stdout. A non-zero exit or spawn
/// failure is a kernel error carrying stderr verbatim.
pub fn raw<S: AsRef<str>>(args: &[S]) -> Result<Vec<u8>> {
    let args: Vec<&str> = args.iter().map(|s| s.as_ref()).collect();
    debug!("iptables {}", args.join(" "));
    let output = Command::new("iptables")
        .args(&args)
        .output()
        .map_err(|e| DaemonError::Kernel(format!("failed to run iptables: {}", e)))?;
    if !output.status.success() {
        return Err(DaemonError::Kernel(format!(
            "iptables {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

/// Probe whether a rule exists. `args` is the rule spec, optionally led by
/// `-t <table>`; the check flag is spliced in before the chain name.
pub fn exists<S: AsRef<str>>(args: &[S]) -> bool {
    let mut check: Vec<&str> = args.iter().map(|s| s.as_ref()).collect();
    let at = if check.first() == Some(&"-t") { 2 } else { 0 };
    check.insert(at, "-C");
    Command::new("iptables")
        .args(&check)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Remove a leftover chain from a previous daemon run, if present.
pub fn remove_existing_chain(name: &str) -> Result<()> {
    if raw(&["-t", "nat", "-L", name]).is_err() {
        return Ok(());
    }
    let chain = Chain {
        name: name.to_string(),
        bridge: String::new(),
    };
    chain.remove();
    Ok(())
}

/// The daemon's nat-table chain holding one DNAT rule per published port.
///
/// Traffic addressed to a local destination is diverted into the chain from
/// PREROUTING and OUTPUT.
#[derive(Debug, Clone)]
pub struct Chain {
    pub name: String,
    pub bridge: String,
}

fn jump_args<'a>(chain: &'a str, builtin: &'a str) -> Vec<&'a str> {
    let mut args = vec![
        "-t",
        "nat",
        builtin,
        "-m",
        "addrtype",
        "--dst-type",
        "LOCAL",
    ];
    if builtin == "OUTPUT" {
        // Loopback must keep resolving locally.
        args.extend(["!", "--dst", "127.0.0.0/8"]);
    }
    args.extend(["-j", chain]);
    args
}

/// Argument vector of one DNAT forwarding rule, without the leading table
/// selection. Split out so the rule shape is testable without iptables.
pub fn forward_rule_args(
    chain: &str,
    action: Action,
    ip: IpAddr,
    port: u16,
    proto: &str,
    dest_addr: Ipv4Addr,
    dest_port: u16,
    bridge: &str,
) -> Vec<String> {
    let daddr = if ip.is_unspecified() {
        "0/0".to_string()
    } else {
        ip.to_string()
    };
    vec![
        "-t".to_string(),
        "nat".to_string(),
        action.as_str().to_string(),
        chain.to_string(),
        "-p".to_string(),
        proto.to_string(),
        "-d".to_string(),
        daddr,
        "--dport".to_string(),
        port.to_string(),
        "!".to_string(),
        "-i".to_string(),
        bridge.to_string(),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        format!("{}:{}", dest_addr, dest_port),
    ]
}

impl Chain {
    /// Create the chain and divert locally-addressed traffic into it.
    pub fn new(name: &str, bridge: &str) -> Result<Chain> {
        raw(&["-t", "nat", "-N", name])?;
        let chain = Chain {
            name: name.to_string(),
            bridge: bridge.to_string(),
        };
        for builtin in ["PREROUTING", "OUTPUT"] {
            let rule = jump_args(name, builtin);
            if !exists(&rule) {
                let mut add = rule.clone();
                let at = 2; // after "-t nat"
                add.insert(at, "-A");
                raw(&add)?;
            }
        }
        Ok(chain)
    }

    /// Add or remove one DNAT rule for a published port.
    pub fn forward(
        &self,
        action: Action,
        ip: IpAddr,
        port: u16,
        proto: &str,
        dest_addr: Ipv4Addr,
        dest_port: u16,
    ) -> Result<()> {
        let args = forward_rule_args(
            &self.name, action, ip, port, proto, dest_addr, dest_port, &self.bridge,
        );
        raw(&args)?;
        Ok(())
    }

    /// Best-effort teardown: unhook the jumps, flush, delete.
    pub fn remove(&self) {
        for builtin in ["PREROUTING", "OUTPUT"] {
            let rule = jump_args(&self.name, builtin);
            let mut del = rule.clone();
            del.insert(2, "-D");
            let _ = raw(&del);
        }
        let _ = raw(&["-t", "nat", "-F", &self.name]);
        let _ = raw(&["-t", "nat", "-X", &self.name]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_strings() {
        assert_eq!(Action::Append.as_str(), "-A");
        assert_eq!(Action::Insert.as_str(), "-I");
        assert_eq!(Action::Delete.as_str(), "-D");
        assert_eq!("-I".parse::<Action>().unwrap(), Action::Insert);
        assert!("-X".parse::<Action>().is_err());
    }

    #[test]
    fn test_forward_rule_shape() {
        let args = forward_rule_args(
            "DOCKER",
            Action::Append,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            8080,
            "tcp",
            Ipv4Addr::new(172, 17, 0, 2),
            80,
            "docker0",
        );
        assert_eq!(
            args,
            vec![
                "-t", "nat", "-A", "DOCKER", "-p", "tcp", "-d", "10.0.0.1", "--dport", "8080",
                "!", "-i", "docker0", "-j", "DNAT", "--to-destination", "172.17.0.2:80",
            ]
        );
    }

    #[test]
    fn test_forward_rule_unspecified_ip() {
        let args = forward_rule_args(
            "DOCKER",
            Action::Delete,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            53,
            "udp",
            Ipv4Addr::new(172, 17, 0, 3),
            53,
            "docker0",
        );
        assert_eq!(args[2], "-D");
        assert_eq!(args[7], "0/0");
        assert_eq!(args[5], "udp");
    }

    #[test]
    fn test_jump_args_output_excludes_loopback() {
        let pre = jump_args("DOCKER", "PREROUTING");
        assert!(!pre.contains(&"127.0.0.0/8"));
        let out = jump_args("DOCKER", "OUTPUT");
        assert!(out.contains(&"127.0.0.0/8"));
        assert_eq!(*out.last().unwrap(), "DOCKER");
    }
}
