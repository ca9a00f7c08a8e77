//! Native execution driver: clone(2), namespaces, cgroup v2
//!
//! The init process is created with new PID/mount/UTS/IPC namespaces (plus
//! a network namespace unless the container shares the host's or another
//! container's). The child half performs rootfs setup with pivot_root,
//! drops bounding capabilities and execs the entrypoint; the parent half
//! finishes bridge plumbing from the host side, then reaps the child.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, clone, setns};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Gid, Pid, Uid, chdir, chroot, pivot_root, sethostname, setgid, setuid};

use crate::errors::{DaemonError, Result};
use crate::execdriver::{Driver, ExecCommand, ExecInterface, Info, Pipes, Resources, StartCallback};
use crate::utils;

const DRIVER_NAME: &str = "native";

/// Stack handed to clone(2) for the child before it execs.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Capability numbers as defined by the kernel ABI.
const ALL_CAPS: &[(&str, u32)] = &[
    ("CHOWN", 0),
    ("DAC_OVERRIDE", 1),
    ("DAC_READ_SEARCH", 2),
    ("FOWNER", 3),
    ("FSETID", 4),
    ("KILL", 5),
    ("SETGID", 6),
    ("SETUID", 7),
    ("SETPCAP", 8),
    ("LINUX_IMMUTABLE", 9),
    ("NET_BIND_SERVICE", 10),
    ("NET_BROADCAST", 11),
    ("NET_ADMIN", 12),
    ("NET_RAW", 13),
    ("IPC_LOCK", 14),
    ("IPC_OWNER", 15),
    ("SYS_MODULE", 16),
    ("SYS_RAWIO", 17),
    ("SYS_CHROOT", 18),
    ("SYS_PTRACE", 19),
    ("SYS_PACCT", 20),
    ("SYS_ADMIN", 21),
    ("SYS_BOOT", 22),
    ("SYS_NICE", 23),
    ("SYS_RESOURCE", 24),
    ("SYS_TIME", 25),
    ("SYS_TTY_CONFIG", 26),
    ("MKNOD", 27),
    ("LEASE", 28),
    ("AUDIT_WRITE", 29),
    ("AUDIT_CONTROL", 30),
    ("SETFCAP", 31),
    ("MAC_OVERRIDE", 32),
    ("MAC_ADMIN", 33),
    ("SYSLOG", 34),
    ("WAKE_ALARM", 35),
    ("BLOCK_SUSPEND", 36),
    ("AUDIT_READ", 37),
];

/// Capabilities a non-privileged container keeps by default.
const DEFAULT_CAPS: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "FSETID",
    "FOWNER",
    "MKNOD",
    "NET_RAW",
    "SETGID",
    "SETUID",
    "SETFCAP",
    "SETPCAP",
    "NET_BIND_SERVICE",
    "SYS_CHROOT",
    "KILL",
    "AUDIT_WRITE",
];

/// Resolve the effective capability set from the default list plus the
/// configured add/drop lists ("all" is honored in both).
pub(crate) fn tweak_capabilities(cap_add: &[String], cap_drop: &[String]) -> Vec<u32> {
    let drop_all = cap_drop.iter().any(|c| c.eq_ignore_ascii_case("all"));
    let add_all = cap_add.iter().any(|c| c.eq_ignore_ascii_case("all"));

    ALL_CAPS
        .iter()
        .filter(|(name, _)| {
            let added = add_all || cap_add.iter().any(|c| c.eq_ignore_ascii_case(name));
            let dropped = cap_drop.iter().any(|c| c.eq_ignore_ascii_case(name));
            let default = !drop_all && DEFAULT_CAPS.contains(name);
            (default || added) && !dropped
        })
        .map(|(_, number)| *number)
        .collect()
}

fn cgroup_root() -> PathBuf {
    std::env::var("SANDBOXD_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup"))
}

/// Cgroup v2 directory for one container.
struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    fn for_id(id: &str) -> Self {
        Self {
            path: cgroup_root().join(format!("sandboxd-{}", id)),
        }
    }

    fn create(id: &str) -> Result<Self> {
        let cg = Self::for_id(id);
        fs::create_dir_all(&cg.path)
            .map_err(|e| DaemonError::Kernel(format!("failed to create cgroup: {}", e)))?;
        Ok(cg)
    }

    fn write_file(&self, name: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(name), value).map_err(|e| {
            DaemonError::Kernel(format!("failed to write cgroup {}: {}", name, e))
        })
    }

    fn apply(&self, resources: &Resources) -> Result<()> {
        if resources.memory > 0 {
            self.write_file("memory.max", &resources.memory.to_string())?;
            if resources.memory_swap > resources.memory {
                let swap = resources.memory_swap - resources.memory;
                self.write_file("memory.swap.max", &swap.to_string())?;
            }
        }
        if resources.cpu_shares > 0 {
            // Map the v1 share range [2, 262144] onto the v2 weight range.
            let shares = resources.cpu_shares.clamp(2, 262144);
            let weight = 1 + ((shares - 2) * 9999) / 262142;
            self.write_file("cpu.weight", &weight.to_string())?;
        }
        if let Some(cpuset) = &resources.cpuset {
            self.write_file("cpuset.cpus", cpuset)?;
        }
        Ok(())
    }

    fn add_process(&self, pid: Pid) -> Result<()> {
        self.write_file("cgroup.procs", &pid.as_raw().to_string())
    }

    fn freeze(&self) -> Result<()> {
        self.write_file("cgroup.freeze", "1")
    }

    fn thaw(&self) -> Result<()> {
        self.write_file("cgroup.freeze", "0")
    }

    /// PIDs currently in the cgroup, empty when it does not exist.
    fn procs(&self) -> Vec<i32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|text| text.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    fn remove(&self) {
        if let Err(e) = fs::remove_dir(&self.path)
            && self.path.exists()
        {
            debug!("failed to remove cgroup {}: {}", self.path.display(), e);
        }
    }
}

struct ChildContext {
    cmd: ExecCommand,
    netns_path: Option<PathBuf>,
    sync_r: OwnedFd,
    stdout_w: OwnedFd,
    stderr_w: OwnedFd,
    close_fds: Vec<RawFd>,
}

/// Clone-based execution driver.
pub struct NativeDriver {
    #[allow(dead_code)]
    root: PathBuf,
    active: Mutex<HashMap<String, Pid>>,
}

impl NativeDriver {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            active: Mutex::new(HashMap::new()),
        })
    }

    fn active_pid(&self, id: &str) -> Option<Pid> {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .copied()
    }

    fn clone_flags(cmd: &ExecCommand) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC;
        if !cmd.network.host_networking && cmd.network.container_id.is_none() {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    fn netns_path(&self, cmd: &ExecCommand) -> Result<Option<PathBuf>> {
        let Some(other) = &cmd.network.container_id else {
            return Ok(None);
        };
        let pid = self.active_pid(other).ok_or_else(|| {
            DaemonError::InvalidState(format!(
                "{} is not a valid running container to join",
                other
            ))
        })?;
        Ok(Some(PathBuf::from(format!("/proc/{}/ns/net", pid))))
    }
}

impl Driver for NativeDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn run(
        &self,
        cmd: &ExecCommand,
        pipes: Pipes,
        start_callback: StartCallback<'_>,
    ) -> Result<i32> {
        let netns_path = self.netns_path(cmd)?;
        let (stdout_r, stdout_w) = nix::unistd::pipe()
            .map_err(|e| DaemonError::Kernel(format!("pipe failed: {}", e)))?;
        let (stderr_r, stderr_w) = nix::unistd::pipe()
            .map_err(|e| DaemonError::Kernel(format!("pipe failed: {}", e)))?;
        let (sync_r, sync_w) = nix::unistd::pipe()
            .map_err(|e| DaemonError::Kernel(format!("pipe failed: {}", e)))?;

        let cgroup = if utils::is_root() {
            let cg = Cgroup::create(&cmd.id)?;
            if let Some(resources) = &cmd.resources {
                cg.apply(resources)?;
            }
            Some(cg)
        } else {
            warn!("skipping cgroup configuration for {} (not running as root)", cmd.id);
            None
        };

        let ctx = ChildContext {
            cmd: cmd.clone(),
            netns_path,
            sync_r,
            stdout_w,
            stderr_w,
            close_fds: vec![stdout_r.as_raw_fd(), stderr_r.as_raw_fd(), sync_w.as_raw_fd()],
        };

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let flags = Self::clone_flags(cmd);
        let pid = unsafe {
            clone(
                Box::new(move || child_main(&ctx)),
                &mut stack,
                flags,
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(|e| DaemonError::Kernel(format!("clone failed: {}", e)))?;
        // The child's ends were duplicated into it by clone; the closure
        // (and the write fds it owns) has been dropped on this side.

        if let Some(cg) = &cgroup
            && let Err(e) = cg.add_process(pid)
        {
            warn!("failed to place {} into its cgroup: {}", cmd.id, e);
        }

        // Host-side network plumbing must precede the child's exec; the
        // sync pipe keeps the child parked until it is done.
        if let Some(iface) = &cmd.network.interface
            && flags.contains(CloneFlags::CLONE_NEWNET)
        {
            if let Err(e) = setup_veth(pid, &cmd.id, iface, cmd.network.mtu) {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                if let Some(cg) = &cgroup {
                    cg.remove();
                }
                return Err(e);
            }
        }
        drop(sync_w);

        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(cmd.id.clone(), pid);

        start_callback(pid.as_raw());

        let Pipes { stdout, stderr } = pipes;
        let out_copier = spawn_copier(stdout_r, stdout);
        let err_copier = spawn_copier(stderr_r, stderr);

        let status = wait_for_exit(pid);

        let _ = out_copier.join();
        let _ = err_copier.join();

        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&cmd.id);
        if let Some(cg) = cgroup {
            cg.remove();
        }
        status
    }

    fn kill(&self, id: &str, signal: i32) -> Result<()> {
        let pid = match self.active_pid(id) {
            Some(pid) => pid,
            None => {
                // Containers adopted across a daemon restart are not in the
                // active table, but their cgroup still knows them.
                let info = self.info(id);
                if !info.is_running() {
                    return Err(DaemonError::InvalidState(format!(
                        "container {} is not running",
                        id
                    )));
                }
                Pid::from_raw(info.pid)
            }
        };
        let sig = Signal::try_from(signal)
            .map_err(|_| DaemonError::Validation(format!("invalid signal {}", signal)))?;
        kill(pid, sig).map_err(|e| DaemonError::Kernel(format!("kill failed: {}", e)))
    }

    fn pause(&self, id: &str) -> Result<()> {
        Cgroup::for_id(id).freeze()
    }

    fn unpause(&self, id: &str) -> Result<()> {
        Cgroup::for_id(id).thaw()
    }

    fn terminate(&self, id: &str, pid: i32) -> Result<()> {
        debug!("terminating stale container {} (pid {})", id, pid);
        if pid > 0 && Path::new(&format!("/proc/{}", pid)).exists() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            // Not necessarily our child; poll the process table instead of
            // waiting on it.
            for _ in 0..50 {
                let _ = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG));
                if !Path::new(&format!("/proc/{}", pid)).exists() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        Cgroup::for_id(id).remove();
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        Ok(())
    }

    fn info(&self, id: &str) -> Info {
        // The cgroup procs file is authoritative when present.
        let procs = Cgroup::for_id(id).procs();
        if let Some(pid) = procs.first() {
            return Info {
                running: true,
                pid: *pid,
            };
        }
        match self.active_pid(id) {
            Some(pid) if Path::new(&format!("/proc/{}", pid)).exists() => Info {
                running: true,
                pid: pid.as_raw(),
            },
            _ => Info::default(),
        }
    }
}

fn spawn_copier(
    fd: OwnedFd,
    mut sink: Box<dyn Write + Send>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut src = File::from(fd);
        let _ = std::io::copy(&mut src, &mut sink);
        let _ = sink.flush();
    })
}

fn wait_for_exit(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, status)) => return Ok(status),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(DaemonError::Kernel(format!("waitpid failed: {}", e))),
        }
    }
}

/// Create the host-side veth pair, enslave it to the bridge and configure
/// the container end inside the child's network namespace.
fn setup_veth(pid: Pid, id: &str, iface: &ExecInterface, mtu: i32) -> Result<()> {
    let short = utils::truncate_id(id);
    let host = format!("veth{}", &short[..7.min(short.len())]);
    let peer = format!("{}p", host);
    let mtu = if mtu > 0 { mtu } else { 1500 };
    let mtu = mtu.to_string();

    run_ip(&[
        "link", "add", &host, "mtu", &mtu, "type", "veth", "peer", "name", &peer, "mtu", &mtu,
    ])?;
    let result = (|| {
        run_ip(&["link", "set", &host, "master", &iface.bridge])?;
        run_ip(&["link", "set", &host, "up"])?;
        run_ip(&["link", "set", &peer, "netns", &pid.as_raw().to_string()])?;

        // `ip netns` wants a handle under /var/run/netns; link the child's
        // proc entry there for the duration of the configuration.
        let netns_dir = Path::new("/var/run/netns");
        fs::create_dir_all(netns_dir)?;
        let handle = netns_dir.join(short);
        let _ = fs::remove_file(&handle);
        std::os::unix::fs::symlink(format!("/proc/{}/ns/net", pid.as_raw()), &handle)?;
        let netns_result = (|| {
            let addr = format!("{}/{}", iface.ip, iface.prefix_len);
            run_ip(&["netns", "exec", short, "ip", "link", "set", "lo", "up"])?;
            run_ip(&["netns", "exec", short, "ip", "link", "set", &peer, "name", "eth0"])?;
            run_ip(&["netns", "exec", short, "ip", "addr", "add", &addr, "dev", "eth0"])?;
            run_ip(&["netns", "exec", short, "ip", "link", "set", "eth0", "up"])?;
            run_ip(&[
                "netns", "exec", short, "ip", "route", "add", "default", "via",
                &iface.gateway.to_string(),
            ])
        })();
        let _ = fs::remove_file(&handle);
        netns_result
    })();
    if result.is_err() {
        let _ = run_ip(&["link", "del", &host]);
    }
    result
}

fn run_ip(args: &[&str]) -> Result<()> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| DaemonError::Kernel(format!("failed to run ip: {}", e)))?;
    if !output.status.success() {
        return Err(DaemonError::Kernel(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Child half. Everything below runs in the cloned process; errors go to the
// (already redirected) stderr and exit the child with status 1.

fn child_main(ctx: &ChildContext) -> isize {
    if let Err(e) = child_setup(ctx) {
        eprintln!("container init failed: {}", e);
        return 1;
    }
    // child_setup ends in exec and only returns on failure.
    1
}

fn child_setup(ctx: &ChildContext) -> Result<()> {
    let cmd = &ctx.cmd;

    // Raw fd plumbing; these fds never outlive the exec below.
    unsafe {
        if libc::dup2(ctx.stdout_w.as_raw_fd(), 1) < 0 || libc::dup2(ctx.stderr_w.as_raw_fd(), 2) < 0
        {
            return Err(DaemonError::Kernel("dup2 stdio failed".to_string()));
        }
        for fd in &ctx.close_fds {
            libc::close(*fd);
        }
        libc::close(ctx.stdout_w.as_raw_fd());
        libc::close(ctx.stderr_w.as_raw_fd());

        // Wait for the parent to finish veth plumbing (the pipe closes
        // either way).
        let mut sync = [0u8; 1];
        libc::read(ctx.sync_r.as_raw_fd(), sync.as_mut_ptr().cast(), 1);
    }

    if let Some(path) = &ctx.netns_path {
        let file = File::open(path)
            .map_err(|e| DaemonError::Kernel(format!("open {}: {}", path.display(), e)))?;
        setns(&file, CloneFlags::CLONE_NEWNET)
            .map_err(|e| DaemonError::Kernel(format!("setns: {}", e)))?;
    }

    if !cmd.hostname.is_empty() {
        sethostname(&cmd.hostname)
            .map_err(|e| DaemonError::Kernel(format!("sethostname: {}", e)))?;
    }

    setup_rootfs(cmd)?;

    apply_process_label(&cmd.process_label);

    if !cmd.privileged {
        drop_bounding_capabilities(&cmd.cap_add, &cmd.cap_drop)?;
    }

    let (uid, gid) = parse_user(&cmd.user);
    if let Some(gid) = gid {
        setgid(Gid::from_raw(gid)).map_err(|e| DaemonError::Kernel(format!("setgid: {}", e)))?;
    }
    if let Some(uid) = uid {
        setuid(Uid::from_raw(uid)).map_err(|e| DaemonError::Kernel(format!("setuid: {}", e)))?;
    }

    let cwd = if cmd.working_dir.is_empty() {
        "/"
    } else {
        cmd.working_dir.as_str()
    };
    chdir(cwd).map_err(|e| DaemonError::Kernel(format!("chdir {}: {}", cwd, e)))?;

    let mut env = cmd.env.clone();
    if !cmd.hostname.is_empty() && !env.iter().any(|e| e.starts_with("HOSTNAME=")) {
        env.push(format!("HOSTNAME={}", cmd.hostname));
    }
    if cmd.tty && !env.iter().any(|e| e.starts_with("TERM=")) {
        env.push("TERM=xterm".to_string());
    }

    let program = CString::new(cmd.entrypoint.as_str())
        .map_err(|_| DaemonError::Validation("entrypoint contains nul byte".to_string()))?;
    let mut args = vec![program.clone()];
    for arg in &cmd.arguments {
        args.push(
            CString::new(arg.as_str())
                .map_err(|_| DaemonError::Validation("argument contains nul byte".to_string()))?,
        );
    }
    let env: Vec<CString> = env
        .iter()
        .filter_map(|e| CString::new(e.as_str()).ok())
        .collect();

    nix::unistd::execvpe(&program, &args, &env)
        .map_err(|e| DaemonError::Kernel(format!("exec {}: {}", cmd.entrypoint, e)))?;
    unreachable!()
}

fn setup_rootfs(cmd: &ExecCommand) -> Result<()> {
    let rootfs = &cmd.rootfs;
    let no_pivot = std::env::var("DOCKER_RAMDISK").is_ok();

    let kerr = |what: &str, e: nix::Error| DaemonError::Kernel(format!("{}: {}", what, e));

    // Stop mount events from leaking back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| kerr("make / private", e))?;

    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| kerr("bind rootfs", e))?;

    for m in &cmd.mounts {
        let target = rootfs.join(m.destination.trim_start_matches('/'));
        if m.source.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if !target.exists() {
                fs::write(&target, b"")?;
            }
        }
        let mut flags = MsFlags::MS_BIND | MsFlags::MS_REC;
        if m.private {
            flags |= MsFlags::MS_PRIVATE;
        }
        mount(Some(&m.source), &target, None::<&str>, flags, None::<&str>)
            .map_err(|e| kerr("bind mount", e))?;
        if !m.writable {
            mount(
                Some(&m.source),
                &target,
                None::<&str>,
                flags | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| kerr("remount read-only", e))?;
        }
    }

    if no_pivot {
        chroot(rootfs).map_err(|e| kerr("chroot", e))?;
        chdir("/").map_err(|e| kerr("chdir /", e))?;
    } else {
        chdir(rootfs).map_err(|e| kerr("chdir rootfs", e))?;
        pivot_root(".", ".").map_err(|e| kerr("pivot_root", e))?;
        umount2(".", MntFlags::MNT_DETACH).map_err(|e| kerr("umount old root", e))?;
        chdir("/").map_err(|e| kerr("chdir /", e))?;
    }

    fs::create_dir_all("/proc")?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| kerr("mount proc", e))?;

    // sysfs is informative only; a failure (e.g. joined netns) is fine.
    let _ = fs::create_dir_all("/sys");
    let _ = mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::empty(),
        None::<&str>,
    );
    Ok(())
}

/// Best effort SELinux/AppArmor process label.
fn apply_process_label(label: &str) {
    if label.is_empty() {
        return;
    }
    if let Err(e) = fs::write("/proc/self/attr/exec", label) {
        debug!("unable to apply process label {}: {}", label, e);
    }
}

fn drop_bounding_capabilities(cap_add: &[String], cap_drop: &[String]) -> Result<()> {
    let keep = tweak_capabilities(cap_add, cap_drop);
    for (name, number) in ALL_CAPS {
        if keep.contains(number) {
            continue;
        }
        let rc = unsafe {
            libc::prctl(libc::PR_CAPBSET_DROP, *number as libc::c_ulong, 0, 0, 0)
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Unknown caps on older kernels come back EINVAL; that only
            // means the kernel cannot grant them either.
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(DaemonError::Kernel(format!(
                    "failed to drop capability {}: {}",
                    name, err
                )));
            }
        }
    }
    Ok(())
}

fn parse_user(user: &str) -> (Option<u32>, Option<u32>) {
    if user.is_empty() {
        return (None, None);
    }
    let (u, g) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };
    (u.parse().ok(), g.and_then(|g| g.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;

    #[test]
    fn test_clone_flags_bridged() {
        let cmd = ExecCommand::default();
        let flags = NativeDriver::clone_flags(&cmd);
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_clone_flags_host_networking() {
        let cmd = ExecCommand {
            network: crate::execdriver::ExecNetwork {
                host_networking: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!NativeDriver::clone_flags(&cmd).contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_clone_flags_joined_netns() {
        let cmd = ExecCommand {
            network: crate::execdriver::ExecNetwork {
                container_id: Some("other".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!NativeDriver::clone_flags(&cmd).contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_join_unknown_container_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = NativeDriver::new(tmp.path()).unwrap();
        let cmd = ExecCommand {
            network: crate::execdriver::ExecNetwork {
                container_id: Some("ghost".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            driver.netns_path(&cmd),
            Err(DaemonError::InvalidState(_))
        ));
    }

    #[test]
    fn test_default_capabilities() {
        let keep = tweak_capabilities(&[], &[]);
        assert_eq!(keep.len(), DEFAULT_CAPS.len());
        // NET_RAW stays, SYS_ADMIN does not.
        assert!(keep.contains(&13));
        assert!(!keep.contains(&21));
    }

    #[test]
    fn test_cap_add_and_drop() {
        let keep = tweak_capabilities(
            &["SYS_ADMIN".to_string()],
            &["NET_RAW".to_string(), "chown".to_string()],
        );
        assert!(keep.contains(&21));
        assert!(!keep.contains(&13));
        assert!(!keep.contains(&0));
    }

    #[test]
    fn test_cap_drop_all_then_add() {
        let keep = tweak_capabilities(&["NET_BIND_SERVICE".to_string()], &["all".to_string()]);
        assert_eq!(keep, vec![10]);
    }

    #[test]
    fn test_parse_user() {
        assert_eq!(parse_user(""), (None, None));
        assert_eq!(parse_user("1000"), (Some(1000), None));
        assert_eq!(parse_user("1000:100"), (Some(1000), Some(100)));
        assert_eq!(parse_user("games"), (None, None));
    }

    #[test]
    fn test_kill_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = NativeDriver::new(tmp.path()).unwrap();
        assert!(matches!(
            driver.kill("nope", 15),
            Err(DaemonError::InvalidState(_))
        ));
    }

    #[test]
    fn test_info_not_running() {
        let _guard = serial_guard();
        let tmp = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("SANDBOXD_CGROUP_ROOT", tmp.path()) };
        let driver = NativeDriver::new(tmp.path()).unwrap();
        let info = driver.info("nope");
        unsafe { std::env::remove_var("SANDBOXD_CGROUP_ROOT") };
        assert!(!info.is_running());
    }

    #[test]
    fn test_info_reads_cgroup_procs() {
        let _guard = serial_guard();
        let tmp = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("SANDBOXD_CGROUP_ROOT", tmp.path()) };
        let cg_dir = tmp.path().join("sandboxd-abc");
        fs::create_dir_all(&cg_dir).unwrap();
        fs::write(cg_dir.join("cgroup.procs"), "4242\n").unwrap();

        let driver = NativeDriver::new(tmp.path()).unwrap();
        let info = driver.info("abc");
        unsafe { std::env::remove_var("SANDBOXD_CGROUP_ROOT") };
        assert!(info.is_running());
        assert_eq!(info.pid, 4242);
    }

    #[test]
    fn test_terminate_stale_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = NativeDriver::new(tmp.path()).unwrap();
        driver
            .active
            .lock()
            .unwrap()
            .insert("stale".to_string(), Pid::from_raw(4194304));
        // Pid does not exist; terminate only clears bookkeeping.
        driver.terminate("stale", 4194304).unwrap();
        assert!(driver.active_pid("stale").is_none());
    }

    #[test]
    fn test_cgroup_weight_conversion() {
        let _guard = serial_guard();
        let tmp = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("SANDBOXD_CGROUP_ROOT", tmp.path()) };
        let cg = Cgroup::create("weights").unwrap();
        cg.apply(&Resources {
            cpu_shares: 1024,
            ..Default::default()
        })
        .unwrap();
        let weight: u64 = fs::read_to_string(cg.path.join("cpu.weight"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        unsafe { std::env::remove_var("SANDBOXD_CGROUP_ROOT") };
        // 1024 shares is the v1 default and must land near the v2 default
        // of 100.
        assert!((30..=110).contains(&weight), "weight {}", weight);
    }

    #[test]
    #[ignore]
    fn test_run_echo_as_root() {
        let _guard = serial_guard();
        let tmp = tempfile::tempdir().unwrap();
        // A rootfs with a static shell must be prepared at this path.
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();

        let driver = NativeDriver::new(tmp.path()).unwrap();
        let cmd = ExecCommand {
            id: "itest".to_string(),
            rootfs,
            entrypoint: "/bin/echo".to_string(),
            arguments: vec!["hello".to_string()],
            hostname: "itest".to_string(),
            network: crate::execdriver::ExecNetwork {
                host_networking: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let code = driver
            .run(&cmd, Pipes::discard(), &|pid| assert!(pid > 0))
            .unwrap();
        assert_eq!(code, 0);
    }
}
