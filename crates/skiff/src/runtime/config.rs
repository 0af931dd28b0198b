//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use skiff_common::SkiffPaths;

use crate::restart::BackoffPolicy;

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: SkiffPaths,
    /// Signal delivered by `stop` unless the caller picks one.
    pub stop_signal: i32,
    /// Grace period before `stop` escalates to `SIGKILL`.
    pub stop_timeout: Duration,
    /// How long to wait for a process to die after `SIGKILL`.
    pub kill_grace: Duration,
    /// Delay between policy restarts.
    pub backoff: BackoffPolicy,
    /// Mirror container state to disk.
    pub persist_state: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: SkiffPaths::new(),
            stop_signal: libc::SIGTERM,
            stop_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            persist_state: true,
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted in the user's data directory.
    #[must_use]
    pub fn user_local() -> Self {
        let root = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("skiff");

        Self::default().with_root(root)
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = SkiffPaths::with_root(root);
        self
    }

    /// Set the default stop signal.
    #[must_use]
    pub const fn with_stop_signal(mut self, signal: i32) -> Self {
        self.stop_signal = signal;
        self
    }

    /// Set the default stop timeout.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set how long to wait after `SIGKILL`.
    #[must_use]
    pub const fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Set the restart backoff.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Keep all state in memory.
    #[must_use]
    pub const fn in_memory(mut self) -> Self {
        self.persist_state = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stop_signal, libc::SIGTERM);
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert!(config.persist_state);
    }

    #[test]
    fn user_local_config() {
        let config = RuntimeConfig::user_local();
        assert!(config.paths.root.ends_with("skiff"));
    }

    #[test]
    fn builder_pattern() {
        let config = RuntimeConfig::default()
            .with_root("/custom/root")
            .with_stop_signal(libc::SIGINT)
            .with_stop_timeout(Duration::from_secs(2))
            .with_backoff(BackoffPolicy::immediate())
            .in_memory();

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.stop_signal, libc::SIGINT);
        assert_eq!(config.stop_timeout, Duration::from_secs(2));
        assert_eq!(config.backoff, BackoffPolicy::immediate());
        assert!(!config.persist_state);
    }
}
