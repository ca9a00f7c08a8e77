//! Container objects: configuration, state, disk representation
//!
//! A container is a leaf entity owned by the store. All mutation happens
//! through the daemon's lifecycle operations under the per-container
//! operation lock; the container itself only knows how to persist and
//! restore itself.

pub mod state;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DaemonError, Result};
use crate::network::Proto;
use crate::utils;

pub use state::{State, StateSnapshot};

const CONFIG_FILE: &str = "config.json";
const HOST_CONFIG_FILE: &str = "hostconfig.json";

/// Image-derived and user-provided process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    pub hostname: String,
    pub user: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub image: String,
    pub working_dir: String,
    pub tty: bool,
    pub open_stdin: bool,
    pub labels: HashMap<String, String>,
    /// Exposed container ports, `PORT/PROTO` form.
    pub exposed_ports: Vec<String>,
    /// Deprecated exposure specs which may still carry `host:port:port`.
    pub port_specs: Vec<String>,
    pub network_disabled: bool,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    /// Memory limit in bytes; 0 is unlimited.
    pub memory: u64,
    /// Memory+swap limit in bytes; 0 is unlimited.
    pub memory_swap: u64,
    /// Relative CPU weight; 0 keeps the default.
    pub cpu_shares: u64,
    /// Cpuset specification, e.g. "0-2".
    pub cpuset: String,
}

/// Restart policy consulted when the init process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    #[default]
    No,
    Always,
    OnFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct RestartPolicy {
    pub name: RestartPolicyKind,
    pub maximum_retry_count: u32,
}

/// One `host -> container` published port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    /// Host address to bind on; `None` uses the daemon default.
    pub host_ip: Option<String>,
    /// 0 lets the allocator pick.
    pub host_port: u16,
    pub container_port: u16,
    pub proto: Proto,
}

/// One bind mount requested by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BindSpec {
    pub source: PathBuf,
    pub destination: String,
    pub writable: bool,
}

/// Host-side settings of a container.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfig {
    pub binds: Vec<BindSpec>,
    pub port_bindings: Vec<PortBinding>,
    /// `name:alias` link declarations, consumed at start.
    pub links: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub privileged: bool,
    /// "" or "bridge", "host", "container:<id>", "none".
    pub network_mode: String,
    pub restart_policy: RestartPolicy,
}

/// Network allocation held while the container runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkSettings {
    pub ip_address: String,
    pub ip_prefix_len: u8,
    pub gateway: String,
    pub bridge: String,
    pub port_mappings: Vec<PortMappingRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMappingRecord {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub proto: Proto,
}

/// On-disk shape of `config.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerJson {
    id: String,
    created: DateTime<Utc>,
    path: String,
    args: Vec<String>,
    config: ContainerConfig,
    state: StateSnapshot,
    image: String,
    network_settings: Option<NetworkSettings>,
    name: String,
    driver: String,
    exec_driver: String,
}

/// The unit of lifecycle.
pub struct Container {
    pub id: String,
    pub created: DateTime<Utc>,
    /// Resolved entrypoint binary.
    pub path: String,
    /// Resolved entrypoint arguments.
    pub args: Vec<String>,
    pub config: ContainerConfig,
    pub image: String,
    pub driver: String,
    pub exec_driver: String,
    pub state: State,
    name: RwLock<String>,
    host_config: RwLock<HostConfig>,
    network_settings: Mutex<Option<NetworkSettings>>,
    basefs: Mutex<Option<PathBuf>>,
    root: PathBuf,
    /// Serializes lifecycle transitions on this container.
    pub(crate) op_lock: Mutex<()>,
    /// Set while the user is stopping the container, so the exit monitor
    /// does not fight the stop with a policy restart.
    wants_stop: AtomicBool,
    /// Consecutive policy restarts, for back-off pacing.
    restart_count: AtomicU32,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Container {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        name: String,
        path: String,
        args: Vec<String>,
        config: ContainerConfig,
        host_config: HostConfig,
        image: String,
        driver: String,
        exec_driver: String,
        root: PathBuf,
    ) -> Self {
        Self {
            id,
            created: Utc::now(),
            path,
            args,
            config,
            image,
            driver,
            exec_driver,
            state: State::new(),
            name: RwLock::new(name),
            host_config: RwLock::new(host_config),
            network_settings: Mutex::new(None),
            basefs: Mutex::new(None),
            root,
            op_lock: Mutex::new(()),
            wants_stop: AtomicBool::new(false),
            restart_count: AtomicU32::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(format!("{}-json.log", self.id))
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.write().unwrap_or_else(|p| p.into_inner()) = name;
    }

    pub fn host_config(&self) -> HostConfig {
        self.host_config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn update_host_config(&self, f: impl FnOnce(&mut HostConfig)) {
        f(&mut self.host_config.write().unwrap_or_else(|p| p.into_inner()));
    }

    pub fn network_settings(&self) -> Option<NetworkSettings> {
        self.network_settings
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_network_settings(&self, settings: Option<NetworkSettings>) {
        *self
            .network_settings
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = settings;
    }

    pub fn basefs(&self) -> Option<PathBuf> {
        self.basefs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_basefs(&self, path: Option<PathBuf>) {
        *self.basefs.lock().unwrap_or_else(|p| p.into_inner()) = path;
    }

    pub fn wants_stop(&self) -> bool {
        self.wants_stop.load(Ordering::SeqCst)
    }

    pub fn set_wants_stop(&self, value: bool) {
        self.wants_stop.store(value, Ordering::SeqCst);
    }

    pub(crate) fn bump_restart_count(&self) -> u32 {
        self.restart_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_restart_count(&self) {
        self.restart_count.store(0, Ordering::SeqCst);
    }

    /// Hostname defaults to the short id.
    pub fn hostname(&self) -> String {
        if self.config.hostname.is_empty() {
            utils::truncate_id(&self.id).to_string()
        } else {
            self.config.hostname.clone()
        }
    }

    /// Persist `config.json` and `hostconfig.json` atomically.
    pub fn to_disk(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let json = ContainerJson {
            id: self.id.clone(),
            created: self.created,
            path: self.path.clone(),
            args: self.args.clone(),
            config: self.config.clone(),
            state: self.state.snapshot(),
            image: self.image.clone(),
            network_settings: self.network_settings(),
            name: self.name(),
            driver: self.driver.clone(),
            exec_driver: self.exec_driver.clone(),
        };
        let data = serde_json::to_vec_pretty(&json)
            .map_err(|e| DaemonError::Validation(format!("serialize container: {}", e)))?;
        utils::atomic_write_file(&self.root.join(CONFIG_FILE), &data)?;
        self.write_host_config()
    }

    /// Persist only `hostconfig.json`.
    pub fn write_host_config(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.host_config())
            .map_err(|e| DaemonError::Validation(format!("serialize host config: {}", e)))?;
        utils::atomic_write_file(&self.root.join(HOST_CONFIG_FILE), &data)
    }

    /// Load a container back from its root directory. The directory name is
    /// the authoritative id and must match the stored one.
    pub fn from_disk(root: &Path) -> Result<Container> {
        let id = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DaemonError::Validation(format!("bad container root {:?}", root)))?
            .to_string();

        let data = fs::read(root.join(CONFIG_FILE))?;
        let json: ContainerJson = serde_json::from_slice(&data)
            .map_err(|e| DaemonError::Validation(format!("parse {}: {}", CONFIG_FILE, e)))?;
        if json.id != id {
            return Err(DaemonError::Validation(format!(
                "container {} is stored at {}",
                json.id, id
            )));
        }

        let host_config = match fs::read(root.join(HOST_CONFIG_FILE)) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| DaemonError::Validation(format!("parse {}: {}", HOST_CONFIG_FILE, e)))?,
            Err(_) => HostConfig::default(),
        };

        Ok(Container {
            id: json.id,
            created: json.created,
            path: json.path,
            args: json.args,
            config: json.config,
            image: json.image,
            driver: json.driver,
            exec_driver: json.exec_driver,
            state: State::from_snapshot(json.state),
            name: RwLock::new(json.name),
            host_config: RwLock::new(host_config),
            network_settings: Mutex::new(json.network_settings),
            basefs: Mutex::new(None),
            root: root.to_path_buf(),
            op_lock: Mutex::new(()),
            wants_stop: AtomicBool::new(false),
            restart_count: AtomicU32::new(0),
        })
    }
}

/// One line of the `<id>-json.log` file.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: String,
    pub log: String,
    pub time: DateTime<Utc>,
}

/// Adapts a byte stream into JSON log lines appended to the container log.
pub struct JsonLogWriter {
    stream: &'static str,
    file: fs::File,
    buf: Vec<u8>,
}

impl JsonLogWriter {
    pub fn open(path: &Path, stream: &'static str) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            stream,
            file,
            buf: Vec::new(),
        })
    }

    fn flush_line(&mut self, line: String) -> std::io::Result<()> {
        let entry = LogLine {
            stream: self.stream.to_string(),
            log: line,
            time: Utc::now(),
        };
        let mut data = serde_json::to_vec(&entry).map_err(std::io::Error::other)?;
        data.push(b'\n');
        self.file.write_all(&data)
    }
}

impl Write for JsonLogWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
            self.buf = rest;
            self.flush_line(line)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            self.flush_line(line)?;
        }
        self.file.flush()
    }
}

impl Drop for JsonLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_container(root: &Path) -> Container {
        let id = "a".repeat(64);
        Container::new(
            id.clone(),
            "/happy_turing".to_string(),
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "true".to_string()],
            ContainerConfig {
                hostname: String::new(),
                env: vec!["PATH=/bin".to_string()],
                ..Default::default()
            },
            HostConfig::default(),
            "img123".to_string(),
            "vfs".to_string(),
            "native".to_string(),
            root.join(&id),
        )
    }

    #[test]
    fn test_hostname_defaults_to_short_id() {
        let tmp = tempdir().unwrap();
        let c = sample_container(tmp.path());
        assert_eq!(c.hostname(), "a".repeat(12));
    }

    #[test]
    fn test_disk_round_trip() {
        let tmp = tempdir().unwrap();
        let c = sample_container(tmp.path());
        c.state.set_running(100);
        c.state.set_stopped(3);
        c.set_network_settings(Some(NetworkSettings {
            ip_address: "172.17.0.2".to_string(),
            ip_prefix_len: 16,
            gateway: "172.17.42.1".to_string(),
            bridge: "docker0".to_string(),
            port_mappings: vec![PortMappingRecord {
                host_ip: "0.0.0.0".to_string(),
                host_port: 8080,
                container_port: 80,
                proto: Proto::Tcp,
            }],
        }));
        c.to_disk().unwrap();

        let restored = Container::from_disk(c.root()).unwrap();
        assert_eq!(restored.id, c.id);
        assert_eq!(restored.path, "/bin/sh");
        assert_eq!(restored.name(), "/happy_turing");
        assert_eq!(restored.state.exit_code(), 3);
        assert!(!restored.state.is_running());
        let net = restored.network_settings().unwrap();
        assert_eq!(net.ip_address, "172.17.0.2");
        assert_eq!(net.port_mappings.len(), 1);
    }

    #[test]
    fn test_from_disk_id_mismatch() {
        let tmp = tempdir().unwrap();
        let c = sample_container(tmp.path());
        c.to_disk().unwrap();

        // Move the directory so the stored id no longer matches.
        let moved = tmp.path().join("b".repeat(64));
        fs::rename(c.root(), &moved).unwrap();
        assert!(Container::from_disk(&moved).is_err());
    }

    #[test]
    fn test_from_disk_missing_host_config() {
        let tmp = tempdir().unwrap();
        let c = sample_container(tmp.path());
        c.to_disk().unwrap();
        fs::remove_file(c.root().join(HOST_CONFIG_FILE)).unwrap();
        let restored = Container::from_disk(c.root()).unwrap();
        assert_eq!(
            restored.host_config().restart_policy.name,
            RestartPolicyKind::No
        );
    }

    #[test]
    fn test_restart_policy_serde_names() {
        let json = serde_json::to_string(&RestartPolicyKind::OnFailure).unwrap();
        assert_eq!(json, "\"on-failure\"");
        let parsed: RestartPolicyKind = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(parsed, RestartPolicyKind::Always);
    }

    #[test]
    fn test_update_host_config() {
        let tmp = tempdir().unwrap();
        let c = sample_container(tmp.path());
        c.update_host_config(|hc| {
            hc.links = vec!["db:alias".to_string()];
            hc.restart_policy.name = RestartPolicyKind::Always;
        });
        let hc = c.host_config();
        assert_eq!(hc.links, vec!["db:alias"]);
        assert_eq!(hc.restart_policy.name, RestartPolicyKind::Always);
    }

    #[test]
    fn test_json_log_writer() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("c-json.log");
        {
            let mut w = JsonLogWriter::open(&path, "stdout").unwrap();
            w.write_all(b"hello\nwor").unwrap();
            w.write_all(b"ld\n").unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<LogLine> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].log, "hello");
        assert_eq!(lines[1].log, "world");
        assert_eq!(lines[0].stream, "stdout");
    }

    #[test]
    fn test_wants_stop_flag() {
        let tmp = tempdir().unwrap();
        let c = sample_container(tmp.path());
        assert!(!c.wants_stop());
        c.set_wants_stop(true);
        assert!(c.wants_stop());
        c.set_wants_stop(false);
        assert!(!c.wants_stop());
    }
}
