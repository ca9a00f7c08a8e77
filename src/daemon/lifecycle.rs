//! Container lifecycle operations
//!
//! Every transition runs under the container's operation lock. Start
//! acquires resources in a fixed order (network, mount, runtime files,
//! links, process); any failure rolls the acquired resources back in
//! reverse. The exit monitor mirrors that teardown after the process dies
//! and evaluates the restart policy.

use std::fs;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::container::{
    Container, ContainerConfig, HostConfig, JsonLogWriter, NetworkSettings, PortMappingRecord,
    RestartPolicyKind,
};
use crate::daemon::Daemon;
use crate::engine::Env;
use crate::errors::{DaemonError, Result};
use crate::execdriver::{
    BindMount, ExecCommand, ExecInterface, ExecNetwork, Pipes, Resources,
};
use crate::network::resolvconf;
use crate::storage;

/// Grace period between SIGTERM and SIGKILL on stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Policy-restart back-off: step per consecutive restart, capped.
const RESTART_BACKOFF_STEP: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(5);

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

type StartSignal = (Mutex<Option<std::result::Result<(), String>>>, Condvar);

fn parse_link(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once(':') {
        Some((name, alias)) if !name.is_empty() && !alias.is_empty() => Ok((name, alias)),
        None if !spec.is_empty() => Ok((spec, spec)),
        _ => Err(DaemonError::Validation(format!(
            "bad format for link: {}",
            spec
        ))),
    }
}

fn entrypoint_and_args(config: &ContainerConfig) -> (String, Vec<String>) {
    if !config.entrypoint.is_empty() {
        let mut args = config.entrypoint[1..].to_vec();
        args.extend(config.cmd.iter().cloned());
        (config.entrypoint[0].clone(), args)
    } else {
        (config.cmd[0].clone(), config.cmd[1..].to_vec())
    }
}

impl Daemon {
    /// Create a container: reserve id+name, build the init and container
    /// layers, persist the configs. No process is started.
    pub fn create(
        self: &Arc<Self>,
        name: Option<&str>,
        config: ContainerConfig,
        host_config: HostConfig,
    ) -> Result<(Arc<Container>, Vec<String>)> {
        let mut warnings = Vec::new();
        if config.port_specs.iter().any(|p| p.contains(':')) {
            warnings.push(
                "The mapping to public ports on your host via EXPOSE (host:port:port) has \
                 been deprecated. Use -p to publish the ports."
                    .to_string(),
            );
        }
        if config.entrypoint.is_empty() && config.cmd.is_empty() {
            return Err(DaemonError::NoCommand);
        }
        let image = config.image.clone();
        if image.is_empty() || !self.graph_driver().exists(&image) {
            return Err(DaemonError::NotFound(format!("no such image: {}", image)));
        }

        let (id, full_name) = self.generate_id_and_name(name)?;
        let (path, args) = entrypoint_and_args(&config);
        let root = self.container_root(&id);

        let built: Result<Arc<Container>> = (|| {
            // The directory doubles as a barrier against id races.
            fs::create_dir(&root)?;
            let mut perms = fs::metadata(&root)?.permissions();
            std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
            fs::set_permissions(&root, perms)?;

            let init_id = format!("{}-init", id);
            self.graph_driver().create(&init_id, Some(&image))?;
            let init_path = self.graph_driver().get(&init_id, "")?;
            storage::setup_init_layer(&init_path)?;
            self.graph_driver().put(&init_id);
            self.graph_driver().create(&id, Some(&init_id))?;

            let container = Arc::new(Container::new(
                id.clone(),
                full_name.clone(),
                path.clone(),
                args.clone(),
                config.clone(),
                host_config.clone(),
                image.clone(),
                self.graph_driver().name().to_string(),
                self.execution_driver().name().to_string(),
                root.clone(),
            ));
            container.to_disk()?;
            self.register(Arc::clone(&container))?;
            Ok(container)
        })();

        match built {
            Ok(container) => Ok((container, warnings)),
            Err(e) => {
                // Unwind everything the failed create left behind.
                let _ = self.container_graph.purge(&id);
                let _ = self.graph_driver().remove(&id);
                let _ = self.graph_driver().remove(&format!("{}-init", id));
                let _ = fs::remove_dir_all(&root);
                Err(e)
            }
        }
    }

    /// Start the container. Starting a running container is a no-op.
    pub fn start(self: &Arc<Self>, container: &Arc<Container>) -> Result<()> {
        let _guard = container.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.do_start(container, true)
    }

    fn start_from_monitor(self: &Arc<Self>, container: &Arc<Container>) -> Result<()> {
        let _guard = container.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.do_start(container, false)
    }

    fn do_start(self: &Arc<Self>, container: &Arc<Container>, user_initiated: bool) -> Result<()> {
        if container.state.is_running() {
            return Ok(());
        }
        if container.state.is_paused() {
            return Err(DaemonError::InvalidState(
                "cannot start a paused container, unpause it first".to_string(),
            ));
        }
        if user_initiated {
            container.set_wants_stop(false);
            container.reset_restart_count();
        } else if container.wants_stop() {
            return Err(DaemonError::InvalidState(
                "container stop was requested".to_string(),
            ));
        }

        if self.needs_bridge_network(container) {
            self.allocate_network(container)?;
        }

        let basefs = match self.graph_driver().get(&container.id, "") {
            Ok(path) => path,
            Err(e) => {
                self.release_resources(container);
                return Err(e);
            }
        };
        container.set_basefs(Some(basefs));

        let staged = self
            .write_runtime_files(container)
            .and_then(|_| self.setup_links(container))
            .and_then(|_| self.build_exec_command(container));
        let cmd = match staged {
            Ok(cmd) => cmd,
            Err(e) => {
                self.release_resources(container);
                return Err(e);
            }
        };

        if let Err(e) = self.spawn_monitor(container, cmd) {
            self.release_resources(container);
            return Err(e);
        }
        if let Err(e) = container.to_disk() {
            debug!("error persisting started container: {}", e);
        }
        Ok(())
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL. Blocks until stopped.
    pub fn stop(&self, container: &Arc<Container>, timeout: Duration) -> Result<()> {
        let _guard = container.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.do_stop(container, timeout)
    }

    fn do_stop(&self, container: &Arc<Container>, timeout: Duration) -> Result<()> {
        if !container.state.is_running() {
            return Err(DaemonError::InvalidState(
                "container is not running".to_string(),
            ));
        }
        container.set_wants_stop(true);
        if let Err(e) = self.kill_container(container, libc::SIGTERM) {
            debug!("error sending SIGTERM to {}: {}", container.id, e);
            self.kill_container(container, libc::SIGKILL)?;
        }
        match container.state.wait_stop(Some(timeout)) {
            Ok(_) => Ok(()),
            Err(DaemonError::Timeout) => {
                info!(
                    "container {} failed to exit within {}s, killing it",
                    container.id,
                    timeout.as_secs()
                );
                self.kill_container(container, libc::SIGKILL)?;
                container.state.wait_stop(Some(DEFAULT_STOP_TIMEOUT))?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop then start, under one lock hold.
    pub fn restart(self: &Arc<Self>, container: &Arc<Container>, timeout: Duration) -> Result<()> {
        let _guard = container.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        match self.do_stop(container, timeout) {
            Ok(()) => {}
            // Restarting a stopped container just starts it.
            Err(DaemonError::InvalidState(_)) => {}
            Err(e) => return Err(e),
        }
        self.do_start(container, true)
    }

    /// Forward `signal` to the init process without waiting.
    pub fn kill(&self, container: &Arc<Container>, signal: i32) -> Result<()> {
        let _guard = container.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        if !container.state.is_running() {
            return Err(DaemonError::InvalidState(
                "container is not running".to_string(),
            ));
        }
        if signal == libc::SIGKILL {
            container.set_wants_stop(true);
        }
        self.kill_container(container, signal)
    }

    /// Raw signal forward, shared with shutdown; no state checks.
    pub(crate) fn kill_container(&self, container: &Container, signal: i32) -> Result<()> {
        self.execution_driver().kill(&container.id, signal)
    }

    pub fn pause(&self, container: &Arc<Container>) -> Result<()> {
        let _guard = container.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        if !container.state.is_running() {
            return Err(DaemonError::InvalidState(
                "container is not running, cannot pause".to_string(),
            ));
        }
        if container.state.is_paused() {
            return Err(DaemonError::InvalidState(
                "container is already paused".to_string(),
            ));
        }
        self.execution_driver().pause(&container.id)?;
        container.state.set_paused();
        if let Err(e) = container.to_disk() {
            debug!("error persisting paused state: {}", e);
        }
        Ok(())
    }

    pub fn unpause(&self, container: &Arc<Container>) -> Result<()> {
        let _guard = container.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        if !container.state.is_paused() {
            return Err(DaemonError::InvalidState(
                "container is not paused".to_string(),
            ));
        }
        self.execution_driver().unpause(&container.id)?;
        container.state.set_unpaused();
        if let Err(e) = container.to_disk() {
            debug!("error persisting unpaused state: {}", e);
        }
        Ok(())
    }

    /// Block until the container stops; returns the exit code.
    pub fn wait(&self, container: &Arc<Container>, timeout: Option<Duration>) -> Result<i32> {
        container.state.wait_stop(timeout)
    }

    /// Remove a container. Running containers require `force`, which kills
    /// them first.
    pub fn delete(self: &Arc<Self>, container: &Arc<Container>, force: bool) -> Result<()> {
        let _guard = container.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        if container.state.is_running() {
            if !force {
                return Err(DaemonError::InvalidState(
                    "impossible to remove a running container, stop it first or use force"
                        .to_string(),
                ));
            }
            container.set_wants_stop(true);
            if container.state.is_paused() {
                let _ = self.execution_driver().unpause(&container.id);
            }
            if let Err(e) = self.kill_container(container, libc::SIGKILL) {
                debug!("error killing {} for removal: {}", container.id, e);
            }
            let _ = container.state.wait_stop(Some(DEFAULT_STOP_TIMEOUT));
        }

        // Normally the monitor has already torn these down; release is
        // idempotent.
        self.release_resources(container);

        if let Err(e) = self.container_graph.purge(&container.id) {
            warn!("error purging names for {}: {}", container.id, e);
        }
        self.containers.delete(&container.id);
        if let Err(e) = self.id_index.delete(&container.id) {
            debug!("id index delete: {}", e);
        }
        if let Err(e) = self.graph_driver().remove(&container.id) {
            warn!("error removing container layer: {}", e);
        }
        if let Err(e) = self.graph_driver().remove(&format!("{}-init", container.id)) {
            warn!("error removing init layer: {}", e);
        }
        if let Err(e) = fs::remove_dir_all(container.root()) {
            warn!("error removing container root: {}", e);
        }
        Ok(())
    }

    fn needs_bridge_network(&self, container: &Container) -> bool {
        if self.config.network_disabled() || container.config.network_disabled {
            return false;
        }
        let mode = container.host_config().network_mode;
        !(mode == "host" || mode == "none" || mode.starts_with("container:"))
    }

    /// Acquire an interface and publish the configured ports, through the
    /// job bus.
    fn allocate_network(&self, container: &Arc<Container>) -> Result<()> {
        let mut job = self.eng.job("allocate_interface", &[&container.id]);
        job.run()?;
        let out = Env::from_lines(&job.stdout.to_string_lossy());

        let mut settings = NetworkSettings {
            ip_address: out.get("IP").unwrap_or_default().to_string(),
            ip_prefix_len: out.get_int("IPPrefixLen").unwrap_or(0) as u8,
            gateway: out.get("Gateway").unwrap_or_default().to_string(),
            bridge: out.get("Bridge").unwrap_or_default().to_string(),
            port_mappings: Vec::new(),
        };

        for binding in container.host_config().port_bindings {
            let mut job = self.eng.job("allocate_port", &[&container.id]);
            if let Some(host_ip) = &binding.host_ip {
                job.env.set("HostIP", host_ip);
            }
            job.env.set_int("HostPort", binding.host_port as i64);
            job.env
                .set_int("ContainerPort", binding.container_port as i64);
            job.env.set("Proto", binding.proto.as_str());
            if let Err(e) = job.run() {
                // Set what we have so release can see the interface.
                container.set_network_settings(Some(settings));
                self.release_resources(container);
                return Err(e);
            }
            let out = Env::from_lines(&job.stdout.to_string_lossy());
            settings.port_mappings.push(PortMappingRecord {
                host_ip: out.get("HostIP").unwrap_or_default().to_string(),
                host_port: out.get_int("HostPort").unwrap_or(0) as u16,
                container_port: binding.container_port,
                proto: binding.proto,
            });
        }
        container.set_network_settings(Some(settings));
        Ok(())
    }

    /// Render `/etc/resolv.conf`, `/etc/hosts` and `/etc/hostname` into the
    /// container layer.
    fn write_runtime_files(&self, container: &Arc<Container>) -> Result<()> {
        let basefs = container.basefs().ok_or_else(|| {
            DaemonError::InvalidState("container rootfs is not mounted".to_string())
        })?;
        let etc = basefs.join("etc");
        fs::create_dir_all(&etc)?;

        let container_dns: Vec<std::net::IpAddr> = container
            .config
            .dns
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        let dns = if !container_dns.is_empty() {
            container_dns
        } else {
            self.dns().to_vec()
        };
        if dns.is_empty() {
            // No override anywhere: containers see the host's resolv.conf.
            fs::write(etc.join("resolv.conf"), resolvconf::get())?;
        } else {
            let search = if !container.config.dns_search.is_empty() {
                container.config.dns_search.clone()
            } else {
                self.config.dns_search.clone()
            };
            resolvconf::build(&etc.join("resolv.conf"), &dns, &search)?;
        }

        let hostname = container.hostname();
        fs::write(etc.join("hostname"), format!("{}\n", hostname))?;

        let mut hosts = String::from("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n");
        if let Some(net) = container.network_settings()
            && !net.ip_address.is_empty()
        {
            hosts.push_str(&format!("{}\t{}\n", net.ip_address, hostname));
        }
        for link in &container.host_config().links {
            let (name, alias) = parse_link(link)?;
            if let Ok(child) = self.get_by_name(name)
                && let Some(child_net) = child.network_settings()
                && !child_net.ip_address.is_empty()
            {
                hosts.push_str(&format!("{}\t{}\n", child_net.ip_address, alias));
            }
        }
        fs::write(etc.join("hosts"), hosts)?;
        Ok(())
    }

    /// Record link aliases in the name graph and open the firewall between
    /// the linked pairs.
    fn setup_links(&self, container: &Arc<Container>) -> Result<()> {
        let host_config = container.host_config();
        if host_config.links.is_empty() {
            return Ok(());
        }
        let own_net = container.network_settings().ok_or_else(|| {
            DaemonError::InvalidState("cannot use links without container networking".to_string())
        })?;

        for link in &host_config.links {
            let (name, alias) = parse_link(link)?;
            let child = self.get_by_name(name)?;
            if !child.state.is_running() {
                return Err(DaemonError::InvalidState(format!(
                    "cannot link to a non running container: {} as {}",
                    name, alias
                )));
            }
            let child_net = child.network_settings().ok_or_else(|| {
                DaemonError::InvalidState(format!(
                    "cannot link to container {} without networking",
                    name
                ))
            })?;
            self.register_link(container, &child, alias)?;
            self.link_job(
                "-I",
                &own_net.ip_address,
                &child_net.ip_address,
                &child.config.exposed_ports,
                false,
            )?;
        }
        Ok(())
    }

    fn link_job(
        &self,
        action: &str,
        parent_ip: &str,
        child_ip: &str,
        ports: &[String],
        ignore_errors: bool,
    ) -> Result<()> {
        if ports.is_empty() {
            return Ok(());
        }
        let mut job = self.eng.job("link", &[action]);
        job.env.set("ParentIP", parent_ip);
        job.env.set("ChildIP", child_ip);
        job.env.set_list("Ports", ports);
        job.env.set_bool("IgnoreErrors", ignore_errors);
        job.run()
    }

    /// Tear down everything start acquired, in reverse order: link rules,
    /// network allocation, rootfs mount. Safe to call repeatedly.
    pub(crate) fn release_resources(&self, container: &Container) {
        if let Some(own_net) = container.network_settings() {
            for link in &container.host_config().links {
                if let Ok((name, _)) = parse_link(link)
                    && let Ok(child) = self.get_by_name(name)
                    && let Some(child_net) = child.network_settings()
                    && let Err(e) = self.link_job(
                        "-D",
                        &own_net.ip_address,
                        &child_net.ip_address,
                        &child.config.exposed_ports,
                        true,
                    )
                {
                    debug!("error removing link rules: {}", e);
                }
            }
            let mut job = self.eng.job("release_interface", &[&container.id]);
            if let Err(e) = job.run() {
                warn!("error releasing network for {}: {}", container.id, e);
            }
            container.set_network_settings(None);
        }
        self.graph_driver().put(&container.id);
        container.set_basefs(None);
    }

    fn build_exec_command(&self, container: &Arc<Container>) -> Result<ExecCommand> {
        let host_config = container.host_config();
        let basefs = container.basefs().ok_or_else(|| {
            DaemonError::InvalidState("container rootfs is not mounted".to_string())
        })?;

        let interface = container.network_settings().and_then(|net| {
            let ip: Ipv4Addr = net.ip_address.parse().ok()?;
            let gateway: Ipv4Addr = net.gateway.parse().ok()?;
            Some(ExecInterface {
                ip,
                prefix_len: net.ip_prefix_len,
                gateway,
                bridge: net.bridge,
            })
        });
        let network = ExecNetwork {
            host_networking: host_config.network_mode == "host",
            container_id: host_config
                .network_mode
                .strip_prefix("container:")
                .map(str::to_string),
            interface,
            mtu: self.config.effective_mtu(),
        };

        let config = &container.config;
        let resources = (config.memory > 0 || config.cpu_shares > 0 || !config.cpuset.is_empty())
            .then(|| Resources {
                memory: config.memory,
                memory_swap: config.memory_swap,
                cpu_shares: config.cpu_shares,
                cpuset: (!config.cpuset.is_empty()).then(|| config.cpuset.clone()),
            });

        let mut env = config.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push(DEFAULT_PATH.to_string());
        }

        Ok(ExecCommand {
            id: container.id.clone(),
            rootfs: basefs,
            init_path: self.sys_init_path.clone(),
            entrypoint: container.path.clone(),
            arguments: container.args.clone(),
            env,
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            hostname: container.hostname(),
            tty: config.tty,
            privileged: host_config.privileged,
            cap_add: host_config.cap_add.clone(),
            cap_drop: host_config.cap_drop.clone(),
            network,
            resources,
            mounts: host_config
                .binds
                .iter()
                .map(|b| BindMount {
                    source: b.source.clone(),
                    destination: b.destination.clone(),
                    writable: b.writable,
                    private: true,
                })
                .collect(),
            process_label: String::new(),
            mount_label: String::new(),
        })
    }

    /// Run the exec driver on a dedicated worker and block until the init
    /// process exists (or creation failed).
    fn spawn_monitor(self: &Arc<Self>, container: &Arc<Container>, cmd: ExecCommand) -> Result<()> {
        let signal: Arc<StartSignal> = Arc::new((Mutex::new(None), Condvar::new()));

        let daemon = Arc::clone(self);
        let monitored = Arc::clone(container);
        let monitor_signal = Arc::clone(&signal);
        std::thread::Builder::new()
            .name(format!("monitor-{}", crate::utils::truncate_id(&container.id)))
            .spawn(move || monitor(daemon, monitored, cmd, monitor_signal))
            .map_err(|e| DaemonError::Kernel(format!("failed to spawn monitor: {}", e)))?;

        let (lock, cond) = &*signal;
        let mut started = lock.lock().unwrap_or_else(|p| p.into_inner());
        while started.is_none() {
            started = cond.wait(started).unwrap_or_else(|p| p.into_inner());
        }
        match started.take().expect("checked above") {
            Ok(()) => Ok(()),
            Err(message) => Err(DaemonError::Kernel(message)),
        }
    }
}

fn notify_start(signal: &StartSignal, result: std::result::Result<(), String>) {
    let (lock, cond) = signal;
    let mut slot = lock.lock().unwrap_or_else(|p| p.into_inner());
    if slot.is_none() {
        *slot = Some(result);
        cond.notify_all();
    }
}

/// Worker owning one container run: wires the log files, runs the driver,
/// records the exit, releases resources, and applies the restart policy.
fn monitor(
    daemon: Arc<Daemon>,
    container: Arc<Container>,
    cmd: ExecCommand,
    signal: Arc<StartSignal>,
) {
    let log_path = container.log_path();
    let pipes = match (
        JsonLogWriter::open(&log_path, "stdout"),
        JsonLogWriter::open(&log_path, "stderr"),
    ) {
        (Ok(out), Ok(err)) => Pipes::new(out, err),
        (Err(e), _) | (_, Err(e)) => {
            notify_start(&signal, Err(format!("cannot open container log: {}", e)));
            daemon.release_resources(&container);
            return;
        }
    };

    let callback_container = Arc::clone(&container);
    let callback_signal = Arc::clone(&signal);
    let start_callback = move |pid: i32| {
        callback_container.state.set_running(pid);
        if let Err(e) = callback_container.to_disk() {
            debug!("error persisting running state: {}", e);
        }
        notify_start(&callback_signal, Ok(()));
    };

    let run_result = daemon
        .execution_driver()
        .run(&cmd, pipes, &start_callback);

    let started = {
        let (lock, _) = &*signal;
        lock.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    };
    if !started {
        let message = match &run_result {
            Err(e) => e.to_string(),
            Ok(code) => format!("container exited before start completed ({})", code),
        };
        notify_start(&signal, Err(message));
        daemon.release_resources(&container);
        return;
    }

    let exit_code = match run_result {
        Ok(code) => code,
        Err(e) => {
            warn!("error waiting on container {}: {}", container.id, e);
            -1
        }
    };
    debug!("container {} exited with {}", container.id, exit_code);
    container.state.set_stopped(exit_code);
    if let Err(e) = container.to_disk() {
        debug!("error persisting stopped state: {}", e);
    }
    daemon.release_resources(&container);

    let policy = container.host_config().restart_policy;
    let should_restart = !container.wants_stop()
        && !daemon.engine().is_shutdown()
        && match policy.name {
            RestartPolicyKind::Always => true,
            RestartPolicyKind::OnFailure => exit_code != 0,
            RestartPolicyKind::No => false,
        };
    if !should_restart {
        return;
    }

    container.state.set_restarting(exit_code);
    if let Err(e) = container.to_disk() {
        debug!("error persisting restarting state: {}", e);
    }
    let attempts = container.bump_restart_count();
    let delay = RESTART_BACKOFF_STEP
        .saturating_mul(attempts)
        .min(RESTART_BACKOFF_MAX);
    std::thread::sleep(delay);

    if let Err(e) = daemon.start_from_monitor(&container) {
        debug!("failed to restart container {}: {}", container.id, e);
        container.state.set_stopped(exit_code);
        if let Err(e) = container.to_disk() {
            debug!("error persisting state after failed restart: {}", e);
        }
    }
}
