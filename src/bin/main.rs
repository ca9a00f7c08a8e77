//! sandboxd daemon entrypoint
//!
//! Parses the daemon flags, wires the job bus, installs the signal trap and
//! boots the daemon. The process then idles; all work happens on job and
//! monitor threads.

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter, info};

use sandboxd::daemon::{Daemon, DaemonConfig};
use sandboxd::engine::Engine;
use sandboxd::network::{PortAllocator, bridge};
use sandboxd::signal;

#[derive(Parser, Debug)]
#[command(name = "sandboxd", version, about = "Linux container management daemon")]
struct Cli {
    /// Path to use for the daemon PID file
    #[arg(short = 'p', long = "pidfile", default_value = "/var/run/docker.pid")]
    pidfile: PathBuf,

    /// Path to use as the root of the runtime
    #[arg(short = 'g', long = "graph", default_value = "/var/lib/docker")]
    graph: PathBuf,

    /// Apply restart policies to containers on boot
    #[arg(long = "restart", default_value_t = true, action = ArgAction::Set)]
    restart: bool,

    /// Enable the daemon's addition of iptables rules
    #[arg(long = "iptables", default_value_t = true, action = ArgAction::Set)]
    iptables: bool,

    /// Enable net.ipv4.ip_forward
    #[arg(long = "ip-forward", default_value_t = true, action = ArgAction::Set)]
    ip_forward: bool,

    /// Enable inter-container communication
    #[arg(long = "icc", default_value_t = true, action = ArgAction::Set)]
    icc: bool,

    /// Attach containers to a pre-existing bridge; use 'none' to disable
    /// container networking
    #[arg(short = 'b', long = "bridge", default_value = "")]
    bridge: String,

    /// CIDR address for the network bridge's IP, not compatible with -b
    #[arg(long = "bip", default_value = "")]
    bip: String,

    /// Default IP address to use when binding container ports
    #[arg(long = "ip", default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Force the runtime to use a specific storage driver
    #[arg(short = 's', long = "storage-driver", default_value = "")]
    storage_driver: String,

    /// Force the runtime to use a specific exec driver
    #[arg(short = 'e', long = "exec-driver", default_value = "native")]
    exec_driver: String,

    /// DNS server for containers to use
    #[arg(long = "dns")]
    dns: Vec<IpAddr>,

    /// DNS search domain for containers to use
    #[arg(long = "dns-search")]
    dns_search: Vec<String>,

    /// Set the containers' network MTU
    #[arg(long = "mtu", default_value_t = 0)]
    mtu: i32,

    /// Enable SELinux support
    #[arg(long = "selinux-enabled")]
    selinux_enabled: bool,

    /// Enable debug output (and SIGQUIT fast exit)
    #[arg(short = 'D', long = "debug")]
    debug: bool,
}

fn init_logger(debug: bool) {
    let env = Env::default().filter_or("RUST_LOG", if debug { "debug" } else { "info" });
    Builder::from_env(env)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => format!("{}", style("ERROR").red().bold()),
                Level::Warn => format!("{}", style("WARN ").yellow().bold()),
                Level::Info => format!("{}", style("INFO ").green()),
                Level::Debug => format!("{}", style("DEBUG").cyan()),
                Level::Trace => format!("{}", style("TRACE").dim()),
            };
            writeln!(buf, "{} {}", level, record.args())
        })
        .filter_level(if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.debug);
    if cli.debug {
        unsafe { std::env::set_var("DEBUG", "1") };
    }

    let config = DaemonConfig {
        pidfile: cli.pidfile,
        root: cli.graph,
        auto_restart: cli.restart,
        dns: cli.dns,
        dns_search: cli.dns_search,
        enable_iptables: cli.iptables,
        enable_ip_forward: cli.ip_forward,
        default_ip: cli.ip,
        bridge_iface: cli.bridge,
        bridge_ip: cli.bip,
        inter_container_communication: cli.icc,
        graph_driver: cli.storage_driver,
        exec_driver: cli.exec_driver,
        mtu: cli.mtu,
        enable_selinux_support: cli.selinux_enabled,
    };

    let eng = Engine::new();
    let port_allocator = Arc::new(PortAllocator::new());
    if let Err(e) = bridge::register(&eng, Arc::clone(&port_allocator)) {
        eprintln!("Error registering network driver: {}", e);
        std::process::exit(1);
    }

    {
        let eng = Arc::clone(&eng);
        if let Err(e) = signal::trap(move || eng.shutdown()) {
            eprintln!("Error installing signal handlers: {}", e);
            std::process::exit(1);
        }
    }

    let _daemon = match Daemon::new(config, Arc::clone(&eng), port_allocator) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("Error starting daemon: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "daemon ready, version {}; handlers: {}",
        sandboxd::VERSION,
        eng.commands().join(", ")
    );

    // The API transport plugs into the same engine; nothing to do here but
    // wait for the signal trap to fire.
    loop {
        std::thread::park();
    }
}
