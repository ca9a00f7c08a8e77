//! Storage driver contract and the plain-directory driver
//!
//! The daemon core only depends on this narrow contract: layers are created
//! by id with an optional parent, and a mounted layer maps an id to a
//! rootfs path. The `vfs` driver implements layers as deep directory
//! copies, which needs no kernel support and backs the tests; richer
//! snapshotting drivers plug in behind the same trait.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{DaemonError, Result};

/// Capability set of a storage driver.
pub trait GraphDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Create layer `id`, optionally derived from `parent`.
    fn create(&self, id: &str, parent: Option<&str>) -> Result<()>;

    /// Remove layer `id` and its content.
    fn remove(&self, id: &str) -> Result<()>;

    /// Mount layer `id` and return its rootfs path.
    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf>;

    /// Release a mount obtained from [`GraphDriver::get`].
    fn put(&self, id: &str);

    fn exists(&self, id: &str) -> bool;

    /// Unmount everything; called once during shutdown.
    fn cleanup(&self) -> Result<()>;
}

/// Instantiate a driver by name. An empty name selects the default.
pub fn new_driver(name: &str, root: &Path) -> Result<Box<dyn GraphDriver>> {
    match name {
        "" | "vfs" => Ok(Box::new(VfsDriver::new(root)?)),
        other => Err(DaemonError::Storage(format!(
            "no such storage driver: {}",
            other
        ))),
    }
}

/// Directory-copy driver: every layer is a full directory under
/// `<root>/vfs/dir/<id>`.
pub struct VfsDriver {
    home: PathBuf,
}

impl VfsDriver {
    pub fn new(root: &Path) -> Result<Self> {
        let home = root.join("vfs");
        fs::create_dir_all(home.join("dir"))?;
        Ok(Self { home })
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.home.join("dir").join(id)
    }
}

impl GraphDriver for VfsDriver {
    fn name(&self) -> &str {
        "vfs"
    }

    fn create(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let dir = self.dir(id);
        if dir.exists() {
            return Err(DaemonError::Conflict(format!("layer already exists: {}", id)));
        }
        match parent {
            None => fs::create_dir_all(&dir)?,
            Some(parent) => {
                let src = self.dir(parent);
                if !src.exists() {
                    return Err(DaemonError::Storage(format!(
                        "unknown parent layer {}",
                        parent
                    )));
                }
                copy_dir(&src, &dir)?;
            }
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let dir = self.dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn get(&self, id: &str, _mount_label: &str) -> Result<PathBuf> {
        let dir = self.dir(id);
        if !dir.exists() {
            return Err(DaemonError::Storage(format!("no such layer: {}", id)));
        }
        Ok(dir)
    }

    fn put(&self, _id: &str) {
        // Directories are always "mounted"; nothing to release.
    }

    fn exists(&self, id: &str) -> bool {
        self.dir(id).exists()
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Files seeded into an init layer: the mutable per-container files that
/// must exist above the immutable image but below the container's own
/// writable layer.
const INIT_LAYER_FILES: &[&str] = &[
    "etc/resolv.conf",
    "etc/hosts",
    "etc/hostname",
    ".dockerenv",
];

/// Prepare a freshly created `<id>-init` layer.
pub fn setup_init_layer(path: &Path) -> Result<()> {
    for dir in ["dev", "proc", "sys", "etc"] {
        fs::create_dir_all(path.join(dir))?;
    }
    for file in INIT_LAYER_FILES {
        let target = path.join(file);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if !target.exists() {
            fs::write(&target, b"")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_driver_default_is_vfs() {
        let tmp = tempdir().unwrap();
        let driver = new_driver("", tmp.path()).unwrap();
        assert_eq!(driver.name(), "vfs");
    }

    #[test]
    fn test_new_driver_unknown() {
        let tmp = tempdir().unwrap();
        assert!(new_driver("aufs2", tmp.path()).is_err());
    }

    #[test]
    fn test_create_base_layer() {
        let tmp = tempdir().unwrap();
        let driver = VfsDriver::new(tmp.path()).unwrap();
        driver.create("base", None).unwrap();
        assert!(driver.exists("base"));
        let path = driver.get("base", "").unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn test_create_copies_parent() {
        let tmp = tempdir().unwrap();
        let driver = VfsDriver::new(tmp.path()).unwrap();
        driver.create("base", None).unwrap();
        let base = driver.get("base", "").unwrap();
        fs::create_dir(base.join("bin")).unwrap();
        fs::write(base.join("bin/sh"), b"#!").unwrap();

        driver.create("child", Some("base")).unwrap();
        let child = driver.get("child", "").unwrap();
        assert!(child.join("bin/sh").exists());

        // The copy is independent of its parent.
        fs::write(child.join("bin/extra"), b"x").unwrap();
        assert!(!base.join("bin/extra").exists());
    }

    #[test]
    fn test_create_duplicate_conflicts() {
        let tmp = tempdir().unwrap();
        let driver = VfsDriver::new(tmp.path()).unwrap();
        driver.create("base", None).unwrap();
        assert!(matches!(
            driver.create("base", None),
            Err(DaemonError::Conflict(_))
        ));
    }

    #[test]
    fn test_create_missing_parent() {
        let tmp = tempdir().unwrap();
        let driver = VfsDriver::new(tmp.path()).unwrap();
        assert!(driver.create("child", Some("ghost")).is_err());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tmp = tempdir().unwrap();
        let driver = VfsDriver::new(tmp.path()).unwrap();
        driver.create("base", None).unwrap();
        driver.remove("base").unwrap();
        assert!(!driver.exists("base"));
        driver.remove("base").unwrap();
    }

    #[test]
    fn test_get_missing_layer() {
        let tmp = tempdir().unwrap();
        let driver = VfsDriver::new(tmp.path()).unwrap();
        assert!(driver.get("ghost", "").is_err());
    }

    #[test]
    fn test_setup_init_layer() {
        let tmp = tempdir().unwrap();
        setup_init_layer(tmp.path()).unwrap();
        assert!(tmp.path().join("etc/resolv.conf").exists());
        assert!(tmp.path().join("etc/hosts").exists());
        assert!(tmp.path().join("etc/hostname").exists());
        assert!(tmp.path().join("proc").is_dir());
        // Idempotent over an already-seeded layer.
        setup_init_layer(tmp.path()).unwrap();
    }
}
