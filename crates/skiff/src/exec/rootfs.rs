//! Root filesystem preparation.
//!
//! Images are plain directory trees. Before a process pivots into one, the
//! mount points it needs are created on disk: `/proc` gets a fresh procfs
//! and the basic device nodes are bind-mounted from the host.

use std::path::{Path, PathBuf};

use skiff_common::{SkiffError, SkiffResult};

/// Directories every rootfs needs.
const DEFAULT_DIRS: &[&str] = &["dev", "proc", "sys", "tmp", "etc"];

/// Host device nodes bind-mounted into every container.
pub const DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// Mount points of a prepared rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsLayout {
    /// The rootfs directory.
    pub root: PathBuf,
    /// Where procfs is mounted.
    pub proc: PathBuf,
    /// `(host device, mount point)` pairs.
    pub devices: Vec<(PathBuf, PathBuf)>,
}

/// Create the mount points a container process needs inside `rootfs`.
///
/// # Errors
///
/// Returns an error if `rootfs` is missing or the mount points cannot be
/// created.
pub fn prepare(rootfs: &Path) -> SkiffResult<RootfsLayout> {
    if !rootfs.is_dir() {
        return Err(SkiffError::config(format!(
            "rootfs {} does not exist",
            rootfs.display()
        )));
    }

    tracing::debug!(rootfs = %rootfs.display(), "Preparing root filesystem");

    for dir in DEFAULT_DIRS {
        std::fs::create_dir_all(rootfs.join(dir))?;
    }

    let dev = rootfs.join("dev");
    let mut devices = Vec::with_capacity(DEVICES.len());
    for name in DEVICES {
        let target = dev.join(name);
        if std::fs::symlink_metadata(&target).is_err() {
            std::fs::File::create(&target)?;
        }
        devices.push((Path::new("/dev").join(name), target));
    }

    let links = [
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ];
    for (name, target) in links {
        let path = dev.join(name);
        if std::fs::symlink_metadata(&path).is_err() {
            std::os::unix::fs::symlink(target, &path)?;
        }
    }

    Ok(RootfsLayout {
        root: rootfs.to_path_buf(),
        proc: rootfs.join("proc"),
        devices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prepare_creates_mount_points() {
        let temp = tempdir().unwrap();
        let layout = prepare(temp.path()).unwrap();

        assert!(temp.path().join("proc").is_dir());
        assert!(temp.path().join("tmp").is_dir());
        assert!(temp.path().join("dev/null").exists());
        assert!(std::fs::symlink_metadata(temp.path().join("dev/fd")).is_ok());
        assert_eq!(layout.devices.len(), DEVICES.len());
        assert_eq!(layout.devices[0].0, PathBuf::from("/dev/null"));
    }

    #[test]
    fn prepare_is_repeatable() {
        let temp = tempdir().unwrap();
        prepare(temp.path()).unwrap();
        prepare(temp.path()).unwrap();
    }

    #[test]
    fn missing_rootfs() {
        let temp = tempdir().unwrap();
        assert!(prepare(&temp.path().join("absent")).is_err());
    }
}
