//! Namespace modes and the namespace layout of a container.
//!
//! Every container gets its own mount and network namespaces. IPC and UTS
//! are private by default and can be shared with the host or joined from
//! another running container.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use skiff_common::SkiffError;

/// How a container obtains one of its namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum NamespaceMode {
    /// A fresh namespace owned by the container.
    #[default]
    Private,
    /// The host's namespace.
    Host,
    /// The namespace of another container, by ID or name.
    Container(String),
}

impl NamespaceMode {
    /// Returns true if the container gets a fresh namespace.
    #[must_use]
    pub const fn is_private(&self) -> bool {
        matches!(self, Self::Private)
    }

    /// Returns true if the host namespace is used.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }

    /// The referenced container, for `container:<ref>` modes.
    #[must_use]
    pub fn container(&self) -> Option<&str> {
        match self {
            Self::Container(reference) => Some(reference),
            _ => None,
        }
    }
}

impl fmt::Display for NamespaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => f.write_str("private"),
            Self::Host => f.write_str("host"),
            Self::Container(reference) => write!(f, "container:{reference}"),
        }
    }
}

impl FromStr for NamespaceMode {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "private" => Ok(Self::Private),
            "host" => Ok(Self::Host),
            other => match other.strip_prefix("container:") {
                Some(reference) if !reference.is_empty() => {
                    Ok(Self::Container(reference.to_string()))
                }
                _ => Err(SkiffError::validation(format!(
                    "invalid namespace mode: {other} (expected private, host or container:<name|id>)"
                ))),
            },
        }
    }
}

/// Namespaces a container can join from another container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Hostname and domain name.
    Uts,
}

impl NamespaceKind {
    /// Entry name under `/proc/<pid>/ns`.
    #[must_use]
    pub const fn proc_name(&self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Uts => "uts",
        }
    }

    /// `CLONE_NEW*` flag expected by `setns`.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub const fn clone_flag(&self) -> libc::c_int {
        match self {
            Self::Ipc => libc::CLONE_NEWIPC,
            Self::Uts => libc::CLONE_NEWUTS,
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// A namespace of a running process the new process must enter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceJoin {
    /// Which namespace.
    pub kind: NamespaceKind,
    /// The `/proc/<pid>/ns/<kind>` file to enter.
    pub path: PathBuf,
}

impl NamespaceJoin {
    /// Join `kind` of the process `pid`.
    #[must_use]
    pub fn of_process(kind: NamespaceKind, pid: u32) -> Self {
        Self {
            kind,
            path: PathBuf::from(format!("/proc/{pid}/ns/{}", kind.proc_name())),
        }
    }
}

/// Namespace layout of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Private mount namespace.
    pub mount: bool,
    /// Private network namespace (loopback only).
    pub net: bool,
    /// IPC namespace mode.
    pub ipc: NamespaceMode,
    /// UTS namespace mode.
    pub uts: NamespaceMode,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            mount: true,
            net: true,
            ipc: NamespaceMode::Private,
            uts: NamespaceMode::Private,
        }
    }
}

impl NamespaceConfig {
    /// Build a layout with the given IPC and UTS modes.
    #[must_use]
    pub fn new(ipc: NamespaceMode, uts: NamespaceMode) -> Self {
        Self {
            ipc,
            uts,
            ..Self::default()
        }
    }

    /// Namespaces that must be joined from other containers.
    pub fn shared(&self) -> impl Iterator<Item = (NamespaceKind, &str)> {
        [
            (NamespaceKind::Ipc, &self.ipc),
            (NamespaceKind::Uts, &self.uts),
        ]
        .into_iter()
        .filter_map(|(kind, mode)| mode.container().map(|reference| (kind, reference)))
    }

    /// Convert to rustix unshare flags.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn to_unshare_flags(&self) -> rustix::thread::UnshareFlags {
        use rustix::thread::UnshareFlags;

        let mut flags = UnshareFlags::empty();

        if self.mount {
            flags |= UnshareFlags::NEWNS;
        }
        if self.net {
            flags |= UnshareFlags::NEWNET;
        }
        if self.ipc.is_private() {
            flags |= UnshareFlags::NEWIPC;
        }
        if self.uts.is_private() {
            flags |= UnshareFlags::NEWUTS;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!("".parse::<NamespaceMode>().unwrap(), NamespaceMode::Private);
        assert_eq!("host".parse::<NamespaceMode>().unwrap(), NamespaceMode::Host);
        assert_eq!(
            "container:web".parse::<NamespaceMode>().unwrap(),
            NamespaceMode::Container("web".to_string())
        );
        assert!("container:".parse::<NamespaceMode>().is_err());
        assert!("bridge".parse::<NamespaceMode>().is_err());
    }

    #[test]
    fn modes_display_as_parsed() {
        for text in ["private", "host", "container:abc"] {
            assert_eq!(text.parse::<NamespaceMode>().unwrap().to_string(), text);
        }
    }

    #[test]
    fn shared_namespaces() {
        let config = NamespaceConfig::new(
            NamespaceMode::Container("db".to_string()),
            NamespaceMode::Host,
        );
        let shared: Vec<_> = config.shared().collect();
        assert_eq!(shared, vec![(NamespaceKind::Ipc, "db")]);
    }

    #[test]
    fn join_path() {
        let join = NamespaceJoin::of_process(NamespaceKind::Uts, 42);
        assert_eq!(join.path, PathBuf::from("/proc/42/ns/uts"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unshare_flags_follow_modes() {
        use rustix::thread::UnshareFlags;

        let private = NamespaceConfig::default().to_unshare_flags();
        assert!(private.contains(UnshareFlags::NEWIPC | UnshareFlags::NEWUTS));
        assert!(private.contains(UnshareFlags::NEWNS | UnshareFlags::NEWNET));

        let host = NamespaceConfig::new(NamespaceMode::Host, NamespaceMode::Host).to_unshare_flags();
        assert!(!host.contains(UnshareFlags::NEWIPC));
        assert!(!host.contains(UnshareFlags::NEWUTS));
        assert!(host.contains(UnshareFlags::NEWNS));
    }
}
