//! Standard filesystem paths for Skiff.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Skiff data.
pub static SKIFF_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SKIFF_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/skiff"))
});

/// Standard paths used by the Skiff runtime.
#[derive(Debug, Clone)]
pub struct SkiffPaths {
    /// Root data directory (default: /var/lib/skiff).
    pub root: PathBuf,
}

impl SkiffPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for container data.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Container state file.
    #[must_use]
    pub fn container_state(&self, id: &str) -> PathBuf {
        self.container(id).join("state.json")
    }

    /// Log file for one of a detached container's output streams.
    #[must_use]
    pub fn container_log(&self, id: &str, stream: &str) -> PathBuf {
        self.container(id).join(format!("{stream}.log"))
    }

    /// Directory holding container name reservations.
    #[must_use]
    pub fn names(&self) -> PathBuf {
        self.root.join("names")
    }

    /// Reservation file for a container name.
    #[must_use]
    pub fn name_reservation(&self, name: &str) -> PathBuf {
        self.names().join(name)
    }

    /// Directory for images.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Directory for named seccomp profiles.
    #[must_use]
    pub fn seccomp_profiles(&self) -> PathBuf {
        self.root.join("seccomp")
    }

    /// Seccomp profile file for a profile name.
    ///
    /// Absolute names are used as-is.
    #[must_use]
    pub fn seccomp_profile(&self, name: &str) -> PathBuf {
        if name.starts_with('/') {
            PathBuf::from(name)
        } else {
            self.seccomp_profiles().join(format!("{name}.json"))
        }
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.containers())?;
        std::fs::create_dir_all(self.names())?;
        std::fs::create_dir_all(self.images())?;
        std::fs::create_dir_all(self.seccomp_profiles())?;
        Ok(())
    }
}

impl Default for SkiffPaths {
    fn default() -> Self {
        Self {
            root: SKIFF_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = SkiffPaths::with_root("/tmp/skiff-test");
        assert_eq!(
            paths.containers(),
            PathBuf::from("/tmp/skiff-test/containers")
        );
        assert_eq!(
            paths.container_state("abc123"),
            PathBuf::from("/tmp/skiff-test/containers/abc123/state.json")
        );
        assert_eq!(
            paths.container_log("abc123", "stderr"),
            PathBuf::from("/tmp/skiff-test/containers/abc123/stderr.log")
        );
        assert_eq!(
            paths.name_reservation("web"),
            PathBuf::from("/tmp/skiff-test/names/web")
        );
    }

    #[test]
    fn seccomp_profile_path() {
        let paths = SkiffPaths::with_root("/tmp/skiff-test");
        assert_eq!(
            paths.seccomp_profile("strict"),
            PathBuf::from("/tmp/skiff-test/seccomp/strict.json")
        );
        assert_eq!(
            paths.seccomp_profile("/etc/profiles/custom.json"),
            PathBuf::from("/etc/profiles/custom.json")
        );
    }
}
