//! Daemon orchestrator: boot, restore, shutdown
//!
//! Boot order is strict: pidfile first, then root/tmp directories, storage
//! driver, bridge network, name graph, init binary, exec driver, restore,
//! shutdown hooks, job handlers. Shutdown fans out in the fixed order
//! stop-containers, release-ports, storage cleanup, close name graph, with
//! pidfile removal last (it was registered first, and hooks run LIFO).

pub mod config;
mod handlers;
mod lifecycle;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::container::Container;
use crate::engine::Engine;
use crate::errors::{DaemonError, Result};
use crate::execdriver;
use crate::namegraph::NameGraph;
use crate::names;
use crate::network::PortAllocator;
use crate::network::resolvconf;
use crate::storage::{self, GraphDriver};
use crate::store::ContainerStore;
use crate::truncindex::TruncIndex;
use crate::utils::{self, KernelVersion};
use crate::VERSION;

pub use config::{DISABLE_NETWORK_BRIDGE, DaemonConfig};

const MIN_KERNEL: KernelVersion = KernelVersion {
    kernel: 3,
    major: 8,
    minor: 0,
};

/// Time a container gets between SIGTERM and SIGKILL during shutdown.
const SHUTDOWN_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Daemon {
    config: DaemonConfig,
    root: PathBuf,
    repository: PathBuf,
    containers: ContainerStore,
    id_index: TruncIndex,
    container_graph: NameGraph,
    driver: Box<dyn GraphDriver>,
    exec_driver: Box<dyn execdriver::Driver>,
    port_allocator: Arc<PortAllocator>,
    eng: Arc<Engine>,
    sys_init_path: PathBuf,
    /// DNS servers for containers; empty means copy the host's resolv.conf.
    dns: Vec<IpAddr>,
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon").field("root", &self.root).finish_non_exhaustive()
    }
}

impl Daemon {
    /// Full boot: platform gate, then the ordered boot sequence.
    pub fn new(
        config: DaemonConfig,
        eng: Arc<Engine>,
        port_allocator: Arc<PortAllocator>,
    ) -> Result<Arc<Daemon>> {
        platform_check()?;
        Self::new_unchecked(config, eng, port_allocator)
    }

    /// Boot without the OS/privilege gate; for embedding and tests that
    /// drive the daemon against a scratch root with networking disabled.
    pub fn new_unchecked(
        config: DaemonConfig,
        eng: Arc<Engine>,
        port_allocator: Arc<PortAllocator>,
    ) -> Result<Arc<Daemon>> {
        config.validate()?;

        // Claim the pidfile before any other state; its removal is the very
        // last shutdown hook.
        utils::create_pid_file(&config.pidfile)?;
        {
            let pidfile = config.pidfile.clone();
            eng.on_shutdown(move || utils::remove_pid_file(&pidfile));
        }

        let root = utils::read_symlinked_directory(&config.root)?;
        fs::create_dir_all(&root)?;

        let tmp = std::env::var_os("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("tmp"));
        fs::create_dir_all(&tmp)?;
        let tmp = utils::read_symlinked_directory(&tmp)?;
        unsafe { std::env::set_var("TMPDIR", &tmp) };

        let driver = storage::new_driver(&config.graph_driver, &root)?;
        debug!("using graph driver {}", driver.name());
        if config.enable_selinux_support && driver.name() == "btrfs" {
            return Err(DaemonError::Fatal(
                "SELinux is not supported with the btrfs storage driver".to_string(),
            ));
        }

        let repository = root.join("containers");
        fs::create_dir_all(&repository)?;
        // Homes of the image graph, volumes and tag store collaborators.
        fs::create_dir_all(root.join("graph"))?;
        fs::create_dir_all(root.join("volumes"))?;

        if !config.network_disabled() {
            let mut job = eng.job("init_networkdriver", &[]);
            job.env.set_bool("EnableIptables", config.enable_iptables);
            job.env
                .set_bool("InterContainerCommunication", config.inter_container_communication);
            job.env.set_bool("EnableIpForward", config.enable_ip_forward);
            job.env.set("BridgeIface", &config.bridge_iface);
            job.env.set("BridgeIP", &config.bridge_ip);
            job.env
                .set("DefaultBindingIP", &config.default_ip.to_string());
            job.run()?;
        }

        let container_graph = NameGraph::open(&root.join("linkgraph.db"))?;

        let sys_init_path = install_init_binary(&root)?;

        let exec_driver = execdriver::new_driver(&config.exec_driver, &root.join("execdriver"))?;

        let dns = resolve_dns(&config);

        let daemon = Arc::new(Daemon {
            config,
            root,
            repository,
            containers: ContainerStore::new(),
            id_index: TruncIndex::new(),
            container_graph,
            driver,
            exec_driver,
            port_allocator,
            eng: Arc::clone(&eng),
            sys_init_path,
            dns,
        });

        daemon.restore()?;

        {
            let daemon = Arc::clone(&daemon);
            eng.on_shutdown(move || {
                daemon.shutdown();
                daemon.port_allocator.release_all();
                if let Err(e) = daemon.driver.cleanup() {
                    error!("storage driver cleanup: {}", e);
                }
                daemon.container_graph.close();
            });
        }

        handlers::install(&daemon)?;
        Ok(daemon)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.eng
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn containers(&self) -> &ContainerStore {
        &self.containers
    }

    pub fn graph_driver(&self) -> &dyn GraphDriver {
        self.driver.as_ref()
    }

    pub fn execution_driver(&self) -> &dyn execdriver::Driver {
        self.exec_driver.as_ref()
    }

    pub fn system_init_path(&self) -> &Path {
        &self.sys_init_path
    }

    pub(crate) fn dns(&self) -> &[IpAddr] {
        &self.dns
    }

    pub(crate) fn container_root(&self, id: &str) -> PathBuf {
        self.repository.join(id)
    }

    /// Look a container up by full id, unique id prefix, or name.
    pub fn get(&self, name: &str) -> Option<Arc<Container>> {
        if let Ok(id) = self.id_index.get(name) {
            return self.containers.get(&id);
        }
        self.get_by_name(name).ok()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<Container>> {
        let full = full_container_name(name)?;
        let id = self
            .container_graph
            .get(&full)
            .ok_or_else(|| DaemonError::NotFound(format!("could not find entity for {}", full)))?;
        self.containers
            .get(&id)
            .ok_or_else(|| DaemonError::NotFound(format!("could not find container for {}", id)))
    }

    /// Containers linked under `name`, as `(path, container)` pairs.
    pub fn children(&self, name: &str) -> Result<Vec<(String, Arc<Container>)>> {
        let full = full_container_name(name)?;
        let mut children = Vec::new();
        for (path, id) in self.container_graph.walk(&full, 1)? {
            match self.containers.get(&id) {
                Some(c) => children.push((path, c)),
                None => debug!("name graph references unknown container {}", id),
            }
        }
        Ok(children)
    }

    /// Record `alias` for `child` under `parent`'s name. Idempotent.
    pub fn register_link(&self, parent: &Container, child: &Container, alias: &str) -> Result<()> {
        let full = format!("{}/{}", parent.name().trim_end_matches('/'), alias);
        if !self.container_graph.exists(&full) {
            self.container_graph.set(&full, &child.id)?;
        }
        Ok(())
    }

    pub(crate) fn generate_id_and_name(&self, name: Option<&str>) -> Result<(String, String)> {
        let id = utils::generate_random_id();
        match name {
            None => {
                let name = self.generate_new_name(&id)?;
                Ok((id, name))
            }
            Some(name) => {
                let name = self.reserve_name(&id, name)?;
                Ok((id, name))
            }
        }
    }

    pub(crate) fn reserve_name(&self, id: &str, name: &str) -> Result<String> {
        let stripped = name.trim_start_matches('/');
        if stripped.is_empty()
            || !stripped
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
        {
            return Err(DaemonError::Validation(format!(
                "invalid container name ({}), only [a-zA-Z0-9_.-] are allowed",
                name
            )));
        }
        let full = format!("/{}", stripped);

        match self.container_graph.set(&full, id) {
            Ok(()) => Ok(full),
            Err(DaemonError::Conflict(_)) => {
                match self
                    .container_graph
                    .get(&full)
                    .and_then(|owner| self.containers.get(&owner))
                {
                    Some(owner) => Err(DaemonError::Conflict(format!(
                        "the name {} is already assigned to {}; delete (or rename) that \
                         container to be able to reuse the name",
                        stripped,
                        utils::truncate_id(&owner.id)
                    ))),
                    None => {
                        // A stale graph entry with no live container; free
                        // the name and take it.
                        self.container_graph.delete(&full)?;
                        self.container_graph.set(&full, id)?;
                        Ok(full)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn generate_new_name(&self, id: &str) -> Result<String> {
        for retry in 0..6 {
            let name = format!("/{}", names::get_random_name(retry));
            match self.container_graph.set(&name, id) {
                Ok(()) => return Ok(name),
                Err(DaemonError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        let name = format!("/{}", utils::truncate_id(id));
        self.container_graph.set(&name, id)?;
        Ok(name)
    }

    fn ensure_name(&self, container: &Arc<Container>) -> Result<()> {
        if container.name().is_empty() {
            let name = self.generate_new_name(&container.id)?;
            container.set_name(name);
            if let Err(e) = container.to_disk() {
                debug!("error saving container name: {}", e);
            }
        }
        Ok(())
    }

    /// Make a container object usable by the daemon, reconciling its
    /// recorded run state against the exec driver.
    pub(crate) fn register(self: &Arc<Self>, container: Arc<Container>) -> Result<()> {
        if self.exists(&container.id) {
            return Err(DaemonError::Conflict(format!(
                "container {} is already loaded",
                container.id
            )));
        }
        self.ensure_name(&container)?;
        self.id_index.insert(&container.id)?;
        self.containers.add(Arc::clone(&container));

        if container.state.is_running() {
            let info = self.exec_driver.info(&container.id);
            if info.is_running() {
                debug!("adopting running container {}", container.id);
                container.state.adopt_running(info.pid);
                self.spawn_adoption_watcher(Arc::clone(&container));
            } else {
                debug!(
                    "container {} was supposed to be running but is not",
                    container.id
                );
                let stale_pid = container.state.pid();
                if let Err(e) = self.exec_driver.terminate(&container.id, stale_pid) {
                    debug!("terminate of stale container failed: {}", e);
                }
                self.driver.put(&container.id);
                container.set_network_settings(None);
                container.state.set_stopped(-127);
                if let Err(e) = container.to_disk() {
                    debug!("saving stopped state to disk: {}", e);
                }
            }
        }
        Ok(())
    }

    /// A daemon restart loses the exec driver's wait on adopted containers;
    /// poll the driver until the process goes away.
    fn spawn_adoption_watcher(self: &Arc<Self>, container: Arc<Container>) {
        let daemon = Arc::clone(self);
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(Duration::from_secs(1));
                if !container.state.is_running() {
                    return;
                }
                if !daemon.exec_driver.info(&container.id).is_running() {
                    debug!("adopted container {} exited", container.id);
                    container.state.set_stopped(0);
                    daemon.release_resources(&container);
                    if let Err(e) = container.to_disk() {
                        debug!("saving adopted container state: {}", e);
                    }
                    return;
                }
            }
        });
    }

    /// Load every container directory, reconcile against the name graph and
    /// the exec driver, then apply restart policies.
    fn restore(self: &Arc<Self>) -> Result<()> {
        let debug_mode =
            std::env::var("DEBUG").is_ok() || std::env::var("TEST").is_ok();
        if !debug_mode {
            info!("loading containers...");
        }

        let mut loaded: HashMap<String, Arc<Container>> = HashMap::new();
        for entry in fs::read_dir(&self.repository)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match Container::from_disk(&entry.path()) {
                Ok(container) => {
                    // A layer from another graph driver cannot be mounted
                    // by this daemon; leave the directory untouched.
                    if !container.driver.is_empty() && container.driver != self.driver.name() {
                        debug!(
                            "not loading {}: created with graph driver {}",
                            id, container.driver
                        );
                        continue;
                    }
                    debug!("loaded container {}", container.id);
                    loaded.insert(id, Arc::new(container));
                }
                Err(e) => error!("failed to load container {}: {}", id, e),
            }
        }

        let mut registered: Vec<Arc<Container>> = Vec::new();

        // The name graph is authoritative for canonical names. Shallowest
        // path first, so a link alias can never shadow the canonical name.
        let mut entries = self.container_graph.walk("/", -1).unwrap_or_default();
        entries.sort_by(|a, b| {
            let depth_a = a.0.matches('/').count();
            let depth_b = b.0.matches('/').count();
            depth_a.cmp(&depth_b).then_with(|| a.0.cmp(&b.0))
        });
        for (path, id) in entries {
            if let Some(container) = loaded.remove(&id) {
                container.set_name(path);
                match self.register(Arc::clone(&container)) {
                    Ok(()) => registered.push(container),
                    Err(e) => debug!("failed to register container {}: {}", id, e),
                }
            }
        }

        // Directories with no name-graph entry get a fresh name.
        for (id, container) in loaded {
            match self.generate_new_name(&id) {
                Ok(name) => container.set_name(name),
                Err(e) => debug!("setting default name for {}: {}", id, e),
            }
            match self.register(Arc::clone(&container)) {
                Ok(()) => registered.push(container),
                Err(e) => debug!("failed to register container {}: {}", id, e),
            }
        }

        if self.config.auto_restart {
            for container in &registered {
                if container.state.is_running() {
                    continue;
                }
                let policy = container.host_config().restart_policy;
                let should = match policy.name {
                    crate::container::RestartPolicyKind::Always => true,
                    crate::container::RestartPolicyKind::OnFailure => {
                        container.state.exit_code() != 0
                    }
                    crate::container::RestartPolicyKind::No => false,
                };
                if should {
                    debug!("restarting container {}", container.id);
                    if let Err(e) = self.start(container) {
                        debug!("failed to restart container {}: {}", container.id, e);
                    }
                }
            }
        }

        if !debug_mode {
            info!("loading containers: done");
        }
        Ok(())
    }

    /// Stop every running container: SIGTERM in parallel, SIGKILL for the
    /// stragglers after the timeout.
    pub fn shutdown(self: &Arc<Self>) {
        debug!("starting clean shutdown of all containers...");
        std::thread::scope(|scope| {
            for container in self.containers.list() {
                if !container.state.is_running() {
                    continue;
                }
                let daemon = self;
                scope.spawn(move || {
                    debug!("stopping {}", container.id);
                    container.set_wants_stop(true);
                    if let Err(e) = daemon.kill_container(&container, libc::SIGTERM) {
                        debug!("kill 15 error for {}: {}", container.id, e);
                    }
                    if container
                        .state
                        .wait_stop(Some(SHUTDOWN_STOP_TIMEOUT))
                        .is_err()
                    {
                        if let Err(e) = daemon.kill_container(&container, libc::SIGKILL) {
                            debug!("kill 9 error for {}: {}", container.id, e);
                        }
                        let _ = container.state.wait_stop(Some(SHUTDOWN_STOP_TIMEOUT));
                    }
                    debug!("container stopped {}", container.id);
                });
            }
        });
    }
}

/// Prefix a user-visible name with the root slash.
pub fn full_container_name(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(DaemonError::Validation(
            "container name cannot be empty".to_string(),
        ));
    }
    if name.starts_with('/') {
        Ok(name.to_string())
    } else {
        Ok(format!("/{}", name))
    }
}

fn platform_check() -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Err(DaemonError::Fatal(
            "the daemon is only supported on linux".to_string(),
        ));
    }
    utils::require_root()?;
    match KernelVersion::current() {
        Ok(version) => {
            if version < MIN_KERNEL && std::env::var("DOCKER_NOWARN_KERNEL_VERSION").is_err() {
                warn!(
                    "you are running linux kernel version {}, which might be unstable running \
                     this daemon; please upgrade to at least {}",
                    version, MIN_KERNEL
                );
            }
        }
        Err(e) => warn!("{}", e),
    }
    Ok(())
}

/// Copy the daemon helper binary into the root so the original can be
/// replaced (e.g. during a package upgrade) without breaking running state.
fn install_init_binary(root: &Path) -> Result<PathBuf> {
    let local = root.join("init").join(format!("dockerinit-{}", VERSION));
    if local.exists() {
        return Ok(local);
    }
    let current = std::env::current_exe()
        .map_err(|e| DaemonError::Fatal(format!("could not locate daemon binary: {}", e)))?;
    utils::copy_file(&current, &local)?;
    let mut perms = fs::metadata(&local)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
    fs::set_permissions(&local, perms)?;
    Ok(local)
}

/// Containers cannot reach a loopback resolver on the host; substitute
/// public DNS when that is all the host has.
fn resolve_dns(config: &DaemonConfig) -> Vec<IpAddr> {
    if !config.dns.is_empty() {
        return config.dns.clone();
    }
    let host_conf = resolvconf::get();
    if !resolvconf::get_nameservers(&host_conf).is_empty() && resolvconf::check_local_dns(&host_conf)
    {
        let fallback = resolvconf::default_dns();
        info!(
            "local (127.0.0.1) DNS resolver found in resolv.conf and containers can't use it; \
             using default external servers: {:?}",
            fallback
        );
        return fallback;
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_container_name() {
        assert_eq!(full_container_name("web").unwrap(), "/web");
        assert_eq!(full_container_name("/web").unwrap(), "/web");
        assert!(full_container_name("").is_err());
    }

    #[test]
    fn test_resolve_dns_configured_wins() {
        let config = DaemonConfig {
            dns: vec!["1.1.1.1".parse().unwrap()],
            ..Default::default()
        };
        assert_eq!(resolve_dns(&config), vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_min_kernel_constant() {
        assert!(KernelVersion::parse("3.7.0").unwrap() < MIN_KERNEL);
        assert!(KernelVersion::parse("3.8.1").unwrap() > MIN_KERNEL);
    }
}
