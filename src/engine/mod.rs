//! Job bus: the dispatch fabric between the daemon's public surface and its
//! subsystems
//!
//! Every request becomes a [`Job`]: a named handler invocation carrying
//! argv-style arguments, an ordered string environment, and byte sinks for
//! stdout/stderr. Handlers run synchronously on the caller's thread and
//! report an exit [`Status`]. Handlers may submit further jobs re-entrantly.
//!
//! The engine also owns the shutdown hooks: callbacks registered during boot
//! and run exactly once, last-registered first, when the daemon stops.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::errors::{DaemonError, Result};

/// Exit status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err,
    NotFound,
}

impl Status {
    /// Numeric code reported to clients.
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Err => 1,
            Status::NotFound => 127,
        }
    }
}

/// A handler serving one job name.
pub type Handler = Arc<dyn Fn(&mut Job) -> Status + Send + Sync>;

/// Shared byte sink for job stdout/stderr.
#[derive(Clone, Default)]
pub struct Output {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Last non-empty line, used as the error message of a failed job.
    pub fn last_line(&self) -> String {
        let text = self.to_string_lossy();
        text.lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string()
    }
}

impl Write for Output {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Ordered key -> string environment attached to a job.
///
/// Values are plain strings; booleans, integers and lists are encoded on
/// top (lists as JSON arrays). Serialized form is `KEY=VALUE` lines.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: Vec<(String, String)>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.vars.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.vars.push((key.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, if value { "1" } else { "0" });
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("1") | Some("true")
        )
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, &value.to_string());
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn set_list(&mut self, key: &str, values: &[String]) {
        let json = serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string());
        self.set(key, &json);
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Write `KEY=VALUE` lines into `w`.
    pub fn write_to(&self, w: &mut dyn Write) -> std::io::Result<()> {
        for (k, v) in &self.vars {
            writeln!(w, "{}={}", k, v)?;
        }
        Ok(())
    }

    /// Parse `KEY=VALUE` lines, the inverse of [`Env::write_to`].
    pub fn from_lines(text: &str) -> Self {
        let mut env = Env::new();
        for line in text.lines() {
            if let Some((k, v)) = line.split_once('=') {
                env.set(k, v);
            }
        }
        env
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.vars {
            writeln!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// One request travelling through the bus.
pub struct Job {
    eng: Arc<Engine>,
    pub name: String,
    pub args: Vec<String>,
    pub env: Env,
    pub stdout: Output,
    pub stderr: Output,
    status: Status,
    ran: bool,
}

impl Job {
    /// First positional argument, if any.
    pub fn arg(&self, i: usize) -> Option<&str> {
        self.args.get(i).map(|s| s.as_str())
    }

    /// The engine this job was created on, for re-entrant submissions.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.eng
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Dispatch the job to its handler and block until it returns.
    pub fn run(&mut self) -> Result<()> {
        if self.ran {
            return Err(DaemonError::InvalidState(format!(
                "job {} has already run",
                self.name
            )));
        }
        self.ran = true;

        let handler = self.eng.handler(&self.name);
        let Some(handler) = handler else {
            self.status = Status::NotFound;
            return Err(DaemonError::NoSuchHandler(self.name.clone()));
        };

        debug!("job {} ({:?})", self.name, self.args);
        self.status = handler(self);

        match self.status {
            Status::Ok => Ok(()),
            _ => Err(DaemonError::JobFailed {
                name: self.name.clone(),
                message: self.stderr.last_line(),
            }),
        }
    }

    /// Record `err` on stderr and return the matching failure status.
    pub fn error(&mut self, err: &DaemonError) -> Status {
        let _ = writeln!(self.stderr, "{}", err);
        match err {
            DaemonError::NotFound(_) | DaemonError::NoSuchHandler(_) => Status::NotFound,
            _ => Status::Err,
        }
    }

    /// Record a formatted message on stderr and return `Status::Err`.
    pub fn errorf(&mut self, msg: impl fmt::Display) -> Status {
        let _ = writeln!(self.stderr, "{}", msg);
        Status::Err
    }

    /// Informational line on stderr; does not affect the status.
    pub fn logf(&mut self, msg: impl fmt::Display) {
        let _ = writeln!(self.stderr, "[{}] {}", self.name, msg);
    }
}

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Process-wide directory of named job handlers.
pub struct Engine {
    handlers: RwLock<HashMap<String, Handler>>,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
    shutting_down: AtomicBool,
}

impl Engine {
    pub fn new() -> Arc<Engine> {
        Arc::new(Engine {
            handlers: RwLock::new(HashMap::new()),
            shutdown_hooks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Register `handler` under `name`. Re-registration is a conflict.
    pub fn register(&self, name: &str, handler: Handler) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.contains_key(name) {
            return Err(DaemonError::Conflict(format!(
                "can't overwrite handler for command {}",
                name
            )));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Names of all registered handlers, sorted.
    pub fn commands(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn handler(&self, name: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Build a job bound to this engine.
    pub fn job(self: &Arc<Self>, name: &str, args: &[&str]) -> Job {
        Job {
            eng: Arc::clone(self),
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: Env::new(),
            stdout: Output::new(),
            stderr: Output::new(),
            status: Status::Ok,
            ran: false,
        }
    }

    /// Register a callback to run on daemon stop. Hooks run in reverse
    /// registration order.
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        self.shutdown_hooks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(hook));
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Run the shutdown hooks exactly once, LIFO.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(
            &mut *self
                .shutdown_hooks
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        );
        for hook in hooks.into_iter().rev() {
            hook();
        }
    }
}
