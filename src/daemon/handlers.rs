//! Job-bus surface of the daemon
//!
//! Each handler is a thin parse/format shim over the lifecycle operations:
//! arguments come in as argv + string env, results leave as text or JSON on
//! the job's stdout, failures as text on stderr plus a non-zero status.

use std::io::Write;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::debug;
use serde::Serialize;

use crate::container::Container;
use crate::daemon::{Daemon, lifecycle::DEFAULT_STOP_TIMEOUT};
use crate::engine::{Job, Status};
use crate::errors::{DaemonError, Result};
use crate::utils::KernelVersion;
use crate::VERSION;

pub(super) fn install(daemon: &Arc<Daemon>) -> Result<()> {
    let eng = Arc::clone(daemon.engine());
    let handlers: &[(&str, fn(&Arc<Daemon>, &mut Job) -> Status)] = &[
        ("create", create),
        ("start", start),
        ("stop", stop),
        ("restart", restart),
        ("kill", kill),
        ("pause", pause),
        ("unpause", unpause),
        ("wait", wait),
        ("delete", delete),
        ("containers", containers),
        ("container_inspect", container_inspect),
        ("logs", logs),
        ("top", top),
        ("info", info),
        ("version", version),
    ];
    for (name, handler) in handlers {
        let weak: Weak<Daemon> = Arc::downgrade(daemon);
        let handler = *handler;
        eng.register(
            name,
            Arc::new(move |job: &mut Job| match weak.upgrade() {
                Some(daemon) => handler(&daemon, job),
                None => job.errorf("daemon is shutting down"),
            }),
        )?;
    }
    Ok(())
}

fn resolve(daemon: &Daemon, job: &Job) -> Result<Arc<Container>> {
    let name = job.arg(0).ok_or_else(|| {
        DaemonError::Validation(format!("usage: {} CONTAINER", job.name))
    })?;
    daemon
        .get(name)
        .ok_or_else(|| DaemonError::NotFound(format!("no such container: {}", name)))
}

fn create(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let name = job.arg(0).filter(|n| !n.is_empty()).map(str::to_string);
    let raw_config = job.env.get("Config").map(str::to_string);
    let config = match raw_config {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => return job.errorf(format_args!("invalid container config: {}", e)),
        },
        None => Default::default(),
    };
    let raw_host_config = job.env.get("HostConfig").map(str::to_string);
    let host_config = match raw_host_config {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(hc) => hc,
            Err(e) => return job.errorf(format_args!("invalid host config: {}", e)),
        },
        None => Default::default(),
    };
    match daemon.create(name.as_deref(), config, host_config) {
        Ok((container, warnings)) => {
            for warning in warnings {
                job.logf(warning);
            }
            let _ = writeln!(job.stdout, "{}", container.id);
            Status::Ok
        }
        Err(e) => job.error(&e),
    }
}

fn start(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    if let Some(raw) = job.env.get("HostConfig").map(str::to_string) {
        match serde_json::from_str(&raw) {
            Ok(hc) => {
                container.update_host_config(|current| *current = hc);
                if let Err(e) = container.write_host_config() {
                    debug!("error persisting host config: {}", e);
                }
            }
            Err(e) => return job.errorf(format_args!("invalid host config: {}", e)),
        }
    }
    match daemon.start(&container) {
        Ok(()) => Status::Ok,
        Err(e) => job.error(&e),
    }
}

fn stop_timeout(job: &Job) -> Duration {
    job.env
        .get_int("t")
        .map(|t| Duration::from_secs(t.max(0) as u64))
        .unwrap_or(DEFAULT_STOP_TIMEOUT)
}

fn stop(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    let timeout = stop_timeout(job);
    match daemon.stop(&container, timeout) {
        Ok(()) => Status::Ok,
        Err(e) => job.error(&e),
    }
}

fn restart(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    let timeout = stop_timeout(job);
    match daemon.restart(&container, timeout) {
        Ok(()) => Status::Ok,
        Err(e) => job.error(&e),
    }
}

/// Parse a signal argument: a number, or a name with or without `SIG`.
fn parse_signal(raw: &str) -> Result<i32> {
    if let Ok(n) = raw.parse::<i32>() {
        return Ok(n);
    }
    let name = raw.trim_start_matches("SIG");
    let sig = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "STOP" => libc::SIGSTOP,
        "CONT" => libc::SIGCONT,
        _ => {
            return Err(DaemonError::Validation(format!(
                "invalid signal: {}",
                raw
            )));
        }
    };
    Ok(sig)
}

fn kill(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    let signal = match job.arg(1) {
        None => libc::SIGKILL,
        Some(raw) => match parse_signal(raw) {
            Ok(sig) => sig,
            Err(e) => return job.error(&e),
        },
    };
    match daemon.kill(&container, signal) {
        Ok(()) => Status::Ok,
        Err(e) => job.error(&e),
    }
}

fn pause(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    match daemon.pause(&container) {
        Ok(()) => Status::Ok,
        Err(e) => job.error(&e),
    }
}

fn unpause(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    match daemon.unpause(&container) {
        Ok(()) => Status::Ok,
        Err(e) => job.error(&e),
    }
}

fn wait(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    let timeout = job
        .env
        .get_int("t")
        .map(|t| Duration::from_secs(t.max(0) as u64));
    match daemon.wait(&container, timeout) {
        Ok(code) => {
            let _ = writeln!(job.stdout, "{}", code);
            Status::Ok
        }
        Err(e) => job.error(&e),
    }
}

fn delete(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    let force = job.env.get_bool("forceRemove");
    match daemon.delete(&container, force) {
        Ok(()) => Status::Ok,
        Err(e) => job.error(&e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    names: Vec<String>,
    image: String,
    command: String,
    created: i64,
    status: String,
    ports: String,
}

fn ports_string(container: &Container) -> String {
    let Some(net) = container.network_settings() else {
        return String::new();
    };
    net.port_mappings
        .iter()
        .map(|m| {
            format!(
                "{}:{}->{}/{}",
                m.host_ip, m.host_port, m.container_port, m.proto
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn containers(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let all = job.env.get_bool("all");
    let summaries: Vec<ContainerSummary> = daemon
        .containers()
        .list()
        .into_iter()
        .filter(|c| all || c.state.is_running())
        .map(|c| ContainerSummary {
            id: c.id.clone(),
            names: vec![c.name()],
            image: c.image.clone(),
            command: format!("{} {}", c.path, c.args.join(" ")).trim_end().to_string(),
            created: c.created.timestamp(),
            status: c.state.status_string(),
            ports: ports_string(&c),
        })
        .collect();
    match serde_json::to_string_pretty(&summaries) {
        Ok(json) => {
            let _ = writeln!(job.stdout, "{}", json);
            Status::Ok
        }
        Err(e) => job.errorf(format_args!("serialize failed: {}", e)),
    }
}

fn container_inspect(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    let inspect = serde_json::json!({
        "Id": container.id,
        "Created": container.created,
        "Path": container.path,
        "Args": container.args,
        "Config": container.config,
        "HostConfig": container.host_config(),
        "State": container.state.snapshot(),
        "Image": container.image,
        "NetworkSettings": container.network_settings(),
        "Name": container.name(),
        "Driver": container.driver,
        "ExecDriver": container.exec_driver,
        "LogPath": container.log_path(),
    });
    match serde_json::to_string_pretty(&inspect) {
        Ok(json) => {
            let _ = writeln!(job.stdout, "{}", json);
            Status::Ok
        }
        Err(e) => job.errorf(format_args!("serialize failed: {}", e)),
    }
}

fn logs(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    let contents = match std::fs::read_to_string(container.log_path()) {
        Ok(contents) => contents,
        // No output yet is not an error.
        Err(_) => return Status::Ok,
    };
    for line in contents.lines() {
        match serde_json::from_str::<crate::container::LogLine>(line) {
            Ok(entry) if entry.stream == "stderr" => {
                let _ = writeln!(job.stderr, "{}", entry.log);
            }
            Ok(entry) => {
                let _ = writeln!(job.stdout, "{}", entry.log);
            }
            Err(e) => debug!("skipping malformed log line: {}", e),
        }
    }
    Status::Ok
}

fn top(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let container = match resolve(daemon, job) {
        Ok(c) => c,
        Err(e) => return job.error(&e),
    };
    let info = daemon.execution_driver().info(&container.id);
    if !info.is_running() {
        return job.errorf(format_args!(
            "container {} is not running",
            container.id
        ));
    }
    let output = std::process::Command::new("ps")
        .args(["-o", "pid,user,args", "-p", &info.pid.to_string()])
        .output();
    match output {
        Ok(output) if output.status.success() => {
            let _ = job.stdout.write_all(&output.stdout);
            Status::Ok
        }
        Ok(output) => job.errorf(format_args!(
            "ps failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(e) => job.errorf(format_args!("ps failed: {}", e)),
    }
}

fn info(daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let all = daemon.containers().list();
    let running = all.iter().filter(|c| c.state.is_running()).count();
    let mut out = crate::engine::Env::new();
    out.set_int("Containers", all.len() as i64);
    out.set_int("ContainersRunning", running as i64);
    out.set("Driver", daemon.graph_driver().name());
    out.set("ExecutionDriver", daemon.execution_driver().name());
    out.set("Root", &daemon.config().root.display().to_string());
    if out.write_to(&mut job.stdout).is_err() {
        return job.errorf("failed writing info");
    }
    Status::Ok
}

fn version(_daemon: &Arc<Daemon>, job: &mut Job) -> Status {
    let mut out = crate::engine::Env::new();
    out.set("Version", VERSION);
    out.set("Os", std::env::consts::OS);
    out.set("Arch", std::env::consts::ARCH);
    if let Ok(kernel) = KernelVersion::current() {
        out.set("KernelVersion", &kernel.to_string());
    }
    if out.write_to(&mut job.stdout).is_err() {
        return job.errorf("failed writing version");
    }
    Status::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_numeric() {
        assert_eq!(parse_signal("9").unwrap(), 9);
        assert_eq!(parse_signal("15").unwrap(), 15);
    }

    #[test]
    fn test_parse_signal_names() {
        assert_eq!(parse_signal("KILL").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal("SIGTERM").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal("HUP").unwrap(), libc::SIGHUP);
        assert!(parse_signal("NOTASIGNAL").is_err());
    }

    #[test]
    fn test_short_id_helper_is_stable() {
        // Handlers print full ids; clients truncate with the shared helper.
        assert_eq!(crate::utils::truncate_id(&"a".repeat(64)).len(), 12);
    }
}
