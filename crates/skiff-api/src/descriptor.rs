//! Container descriptors returned by `inspect` and `list`.
//!
//! Field names follow the Docker-style `ContainerJSON` layout callers already
//! parse (`Config.SpecAnnotation`, `State.ExitCode`, ...).

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::LifecycleState;

/// Point-in-time view of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDescriptor {
    /// Full container ID.
    pub id: String,
    /// User-supplied name, if any.
    #[serde(default)]
    pub name: Option<String>,
    /// Image reference the container was created from.
    pub image: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Number of policy-driven restarts so far.
    pub restart_count: u32,
    /// Process configuration.
    pub config: ConfigDescriptor,
    /// Isolation and policy configuration.
    pub host_config: HostConfigDescriptor,
    /// Lifecycle state.
    pub state: StateDescriptor,
}

impl ContainerDescriptor {
    /// Name if set, short ID otherwise.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| &self.id[..12.min(self.id.len())])
    }

    /// Returns true if `key` is this container's ID, name, or an ID prefix.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        !key.is_empty()
            && (self.id.starts_with(key) || self.name.as_deref() == Some(key))
    }
}

/// Process configuration of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigDescriptor {
    /// Image reference.
    pub image: String,
    /// Command and arguments.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Environment (`KEY=VALUE`).
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Annotations supplied at run time, verbatim.
    #[serde(default)]
    pub spec_annotation: HashMap<String, String>,
}

/// Isolation and policy configuration of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfigDescriptor {
    /// IPC namespace mode (`private`, `host`, `container:<ref>`).
    pub ipc_mode: String,
    /// UTS namespace mode.
    pub uts_mode: String,
    /// Whether confinement is disabled.
    pub privileged: bool,
    /// Capabilities added to the default set.
    #[serde(default)]
    pub cap_add: Vec<String>,
    /// Capabilities removed from the default set.
    #[serde(default)]
    pub cap_drop: Vec<String>,
    /// Security options as given (`apparmor=...`, `seccomp=...`).
    #[serde(default)]
    pub security_opt: Vec<String>,
    /// Sysctls applied at process start.
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,
    /// Restart policy.
    pub restart_policy: RestartPolicyDescriptor,
    /// Remove the container once it settles.
    pub auto_remove: bool,
}

/// Restart policy as reported to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicyDescriptor {
    /// Policy name (`no`, `always`, `on-failure`, `unless-stopped`).
    pub name: String,
    /// Retry bound for `on-failure` (0 means unbounded).
    pub maximum_retry_count: u32,
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateDescriptor {
    /// Current lifecycle state.
    pub status: LifecycleState,
    /// Whether a process is running.
    pub running: bool,
    /// Whether a policy restart is pending.
    pub restarting: bool,
    /// Whether the container is dead.
    pub dead: bool,
    /// Pid of the current process.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Exit code of the last process; absent until the first termination.
    #[serde(default)]
    pub exit_code: Option<i64>,
    /// Last start error.
    #[serde(default)]
    pub error: Option<String>,
    /// Last start time.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Last finish time.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StateDescriptor {
    /// State of a freshly created container.
    #[must_use]
    pub const fn created() -> Self {
        Self {
            status: LifecycleState::Created,
            running: false,
            restarting: false,
            dead: false,
            pid: None,
            exit_code: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContainerDescriptor {
        let mut annotations = HashMap::new();
        annotations.insert("a".to_string(), "b".to_string());
        annotations.insert("foo".to_string(), "bar".to_string());

        ContainerDescriptor {
            id: "0123456789abcdef".repeat(4),
            name: Some("TestRunWithAnnotation".to_string()),
            image: "busybox:latest".to_string(),
            created: Utc::now(),
            restart_count: 0,
            config: ConfigDescriptor {
                image: "busybox:latest".to_string(),
                cmd: vec!["sh".to_string()],
                spec_annotation: annotations,
                ..Default::default()
            },
            host_config: HostConfigDescriptor::default(),
            state: StateDescriptor {
                status: LifecycleState::Exited,
                exit_code: Some(101),
                ..StateDescriptor::created()
            },
        }
    }

    #[test]
    fn serializes_docker_style_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["State"]["ExitCode"], 101);
        assert_eq!(value["State"]["Status"], "exited");
        assert_eq!(value["Config"]["SpecAnnotation"]["foo"], "bar");
        assert_eq!(value["Config"]["SpecAnnotation"]["a"], "b");
    }

    #[test]
    fn lookup_matching() {
        let descriptor = sample();
        assert!(descriptor.matches("TestRunWithAnnotation"));
        assert!(descriptor.matches("0123456789ab"));
        assert!(!descriptor.matches("other"));
        assert_eq!(descriptor.display_name(), "TestRunWithAnnotation");
    }
}
