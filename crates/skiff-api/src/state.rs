//! Container lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a container.
///
/// `Created → Running → {Exited | Dead}`; `Exited` and `Dead` may loop back to
/// `Running` through a restart or advance to `Removed`. A stopped container is
/// reported as `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Container has been created but not started.
    Created,
    /// Container process is running.
    Running,
    /// Container process terminated and was reaped.
    Exited,
    /// Container failed to start or its process could not be reaped.
    Dead,
    /// Container has been removed; its registry entry is gone.
    Removed,
}

impl LifecycleState {
    /// Returns true if an explicit start is allowed from this state.
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(self, Self::Created | Self::Exited | Self::Dead)
    }

    /// Returns true if the container has a live process.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true once the process has finished (cleanly or not).
    #[must_use]
    pub const fn has_finished(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }

    /// Returns true for states no process can leave on its own.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead | Self::Removed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(LifecycleState::Created.can_start());
        assert!(LifecycleState::Exited.can_start());
        assert!(LifecycleState::Dead.can_start());
        assert!(!LifecycleState::Running.can_start());
        assert!(!LifecycleState::Removed.can_start());

        assert!(LifecycleState::Running.is_running());
        assert!(LifecycleState::Exited.has_finished());
        assert!(LifecycleState::Dead.has_finished());
        assert!(!LifecycleState::Removed.has_finished());
        assert!(LifecycleState::Removed.is_terminal());
        assert!(!LifecycleState::Created.is_terminal());
    }

    #[test]
    fn state_serialization() {
        let json = serde_json::to_string(&LifecycleState::Exited).unwrap();
        assert_eq!(json, "\"exited\"");
        let back: LifecycleState = serde_json::from_str("\"dead\"").unwrap();
        assert_eq!(back, LifecycleState::Dead);
    }

    #[test]
    fn status_display() {
        assert_eq!(LifecycleState::Created.to_string(), "created");
        assert_eq!(LifecycleState::Running.to_string(), "running");
        assert_eq!(LifecycleState::Removed.to_string(), "removed");
    }
}
