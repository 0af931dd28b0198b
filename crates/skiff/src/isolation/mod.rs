//! Isolation configuration.
//!
//! [`configure`] turns the namespace modes and security options of a
//! [`RunSpec`] into the concrete [`IsolationConfig`] a process is spawned
//! with. Everything that can be checked without touching the kernel is
//! checked here; profile availability is only known at start.

pub mod apparmor;
pub mod capabilities;
pub mod namespace;
pub mod seccomp;

use std::collections::BTreeMap;

use skiff_common::{ContainerId, SkiffError, SkiffResult};

pub use apparmor::AppArmorProfile;
pub use capabilities::{CapabilityPlan, CapabilitySet};
pub use namespace::{NamespaceConfig, NamespaceJoin, NamespaceKind, NamespaceMode};
pub use seccomp::SeccompProfile;

use crate::runspec::{Confinement, RunSpec};

/// Sysctl prefixes that live in the IPC namespace.
const IPC_SYSCTL_PREFIXES: &[&str] = &["kernel.shm", "kernel.msg", "kernel.sem", "fs.mqueue."];

/// Sysctls that live in the UTS namespace.
const UTS_SYSCTLS: &[&str] = &["kernel.hostname", "kernel.domainname"];

/// Concrete isolation settings for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationConfig {
    /// Namespace layout.
    pub namespaces: NamespaceConfig,
    /// Hostname set inside a private UTS namespace.
    pub hostname: Option<String>,
    /// Sysctls written at process start.
    pub sysctls: BTreeMap<String, String>,
    /// Capabilities the process keeps.
    pub capabilities: CapabilitySet,
    /// Seccomp profile.
    pub seccomp: SeccompProfile,
    /// AppArmor profile to switch to; `None` keeps the caller's.
    pub apparmor: Option<AppArmorProfile>,
    /// Set `no_new_privs`.
    pub no_new_privileges: bool,
    /// Confinement disabled.
    pub privileged: bool,
}

/// Build the isolation configuration for a container.
///
/// # Errors
///
/// Returns [`SkiffError::Config`] for unknown capabilities and for sysctls
/// that would modify a namespace shared with the host.
pub fn configure(spec: &RunSpec, id: &ContainerId) -> SkiffResult<IsolationConfig> {
    let namespaces = NamespaceConfig::new(spec.ipc_mode().clone(), spec.uts_mode().clone());

    for key in spec.sysctls().keys() {
        check_sysctl(key, &namespaces)?;
    }

    let security = spec.security();
    let privileged = security.privileged;

    let capabilities = if privileged {
        CapabilitySet::all()
    } else {
        CapabilitySet::resolve(&security.cap_add, &security.cap_drop)?
    };

    let seccomp = match (&security.seccomp, privileged) {
        (_, true) | (Confinement::Unconfined, _) => SeccompProfile::Unconfined,
        (Confinement::Default, false) => SeccompProfile::Default,
        (Confinement::Profile(name), false) => SeccompProfile::Named(name.clone()),
    };

    let apparmor = match &security.apparmor {
        Confinement::Default => None,
        Confinement::Unconfined => Some(AppArmorProfile::unconfined()),
        Confinement::Profile(name) if !privileged => Some(AppArmorProfile::new(name.clone())),
        Confinement::Profile(_) => None,
    };

    let hostname = namespaces.uts.is_private().then(|| {
        spec.hostname()
            .map_or_else(|| id.short().to_string(), ToString::to_string)
    });

    let config = IsolationConfig {
        namespaces,
        hostname,
        sysctls: spec.sysctls().clone(),
        capabilities,
        seccomp,
        apparmor,
        no_new_privileges: security.no_new_privileges,
        privileged,
    };

    tracing::debug!(
        container_id = %id,
        ipc = %config.namespaces.ipc,
        uts = %config.namespaces.uts,
        privileged,
        seccomp = ?config.seccomp,
        "Isolation configured"
    );

    Ok(config)
}

fn check_sysctl(key: &str, namespaces: &NamespaceConfig) -> SkiffResult<()> {
    let ipc = IPC_SYSCTL_PREFIXES.iter().any(|prefix| key.starts_with(prefix));
    if ipc && namespaces.ipc.is_host() {
        return Err(SkiffError::config(format!(
            "sysctl {key} is not allowed when sharing the host's IPC namespace"
        )));
    }

    let uts = UTS_SYSCTLS.contains(&key);
    if uts && namespaces.uts.is_host() {
        return Err(SkiffError::config(format!(
            "sysctl {key} is not allowed when sharing the host's UTS namespace"
        )));
    }

    Ok(())
}
