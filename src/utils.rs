//! Utility functions shared across the daemon

use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::errors::{DaemonError, Result};

#[cfg(test)]
use std::cell::Cell;

#[cfg(test)]
thread_local! {
    static ROOT_OVERRIDE: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Length of a full container id in hex characters.
pub const FULL_ID_LEN: usize = 64;

/// Length of a truncated container id.
pub const SHORT_ID_LEN: usize = 12;

/// Generate a fresh 64-hex-character container id.
pub fn generate_random_id() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Truncate an id to its short display form.
pub fn truncate_id(id: &str) -> &str {
    if id.len() > SHORT_ID_LEN {
        &id[..SHORT_ID_LEN]
    } else {
        id
    }
}

/// Check if running as root
pub fn is_root() -> bool {
    #[cfg(test)]
    {
        if let Some(value) = ROOT_OVERRIDE.with(|cell| cell.get()) {
            return value;
        }
    }

    unsafe { libc::geteuid() == 0 }
}

/// Fail unless the effective uid is 0.
pub fn require_root() -> Result<()> {
    if !is_root() {
        return Err(DaemonError::Fatal(
            "The daemon needs to be run as root".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub fn set_root_override(value: Option<bool>) {
    ROOT_OVERRIDE.with(|cell| cell.set(value));
}

/// Kernel version triple parsed from `uname -r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub kernel: u32,
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    /// Read the running kernel version.
    pub fn current() -> Result<Self> {
        let uts = nix::sys::utsname::uname()
            .map_err(|e| DaemonError::Kernel(format!("uname failed: {}", e)))?;
        let release = uts.release().to_string_lossy().into_owned();
        Self::parse(&release)
    }

    /// Parse a release string such as `3.8.0-35-generic`.
    pub fn parse(release: &str) -> Result<Self> {
        let core = release
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or(release);
        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u32> {
            parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| DaemonError::Kernel(format!("bad kernel {} in {:?}", name, release)))
        };
        Ok(Self {
            kernel: next("version")?,
            major: next("major")?,
            minor: next("minor")?,
        })
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.kernel, self.major, self.minor)
    }
}

/// Write the current PID to `path`, failing if another live daemon holds it.
pub fn create_pid_file(path: &Path) -> Result<()> {
    if let Ok(contents) = fs::read_to_string(path) {
        let pid = contents.trim();
        if !pid.is_empty() && Path::new(&format!("/proc/{}", pid)).exists() {
            return Err(DaemonError::Fatal(format!(
                "pid file found, ensure the daemon is not running or delete {}",
                path.display()
            )));
        }
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, format!("{}", std::process::id()))?;
    Ok(())
}

/// Remove the pid file, logging on failure.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        log::debug!("error removing pid file {}: {}", path.display(), e);
    }
}

/// Resolve a directory through any symlinks to its canonical path.
///
/// A path that does not exist yet resolves to itself.
pub fn read_symlinked_directory(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }
    let real = fs::canonicalize(path)?;
    if !real.is_dir() {
        return Err(DaemonError::Validation(format!(
            "canonical path points to a file: {}",
            real.display()
        )));
    }
    Ok(real)
}

/// Write `contents` to `path` atomically via a temporary file and rename.
pub fn atomic_write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Copy a file preserving nothing but its bytes; returns the byte count.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(dir) = dst.parent() {
        fs::create_dir_all(dir)?;
    }
    Ok(fs::copy(src, dst)?)
}
