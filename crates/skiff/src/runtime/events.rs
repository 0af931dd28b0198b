//! Runtime event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Runtime event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    /// Container created.
    ContainerCreated {
        id: String,
        name: Option<String>,
        timestamp: i64,
    },
    /// Container process launched.
    ContainerStarted {
        id: String,
        pid: u32,
        generation: u64,
        timestamp: i64,
    },
    /// Container process could not be launched.
    ContainerStartFailed {
        id: String,
        reason: String,
        timestamp: i64,
    },
    /// Container process terminated.
    ContainerDied {
        id: String,
        exit_code: i64,
        timestamp: i64,
    },
    /// A policy restart was scheduled.
    ContainerRestarting {
        id: String,
        restart_count: u32,
        delay_ms: u64,
        timestamp: i64,
    },
    /// A stop was requested.
    ContainerStopped { id: String, timestamp: i64 },
    /// Container removed.
    ContainerRemoved { id: String, timestamp: i64 },
}

impl RuntimeEvent {
    /// ID of the container the event is about.
    #[must_use]
    pub fn container_id(&self) -> &str {
        match self {
            Self::ContainerCreated { id, .. }
            | Self::ContainerStarted { id, .. }
            | Self::ContainerStartFailed { id, .. }
            | Self::ContainerDied { id, .. }
            | Self::ContainerRestarting { id, .. }
            | Self::ContainerStopped { id, .. }
            | Self::ContainerRemoved { id, .. } => id,
        }
    }
}

/// Event bus for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}

/// Current time as a Unix timestamp.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();

        bus.publish(RuntimeEvent::ContainerRemoved {
            id: "abc".to_string(),
            timestamp: now(),
        });

        let event = events.recv().await.unwrap();
        assert_eq!(event.container_id(), "abc");
    }

    #[test]
    fn publish_without_subscribers() {
        EventBus::new().publish(RuntimeEvent::ContainerStopped {
            id: "abc".to_string(),
            timestamp: 0,
        });
    }
}
