//! One-to-many broadcast of state changes, log chunks, and orchestrator
//! messages to UI subscribers, re-expressed as a typed pub/sub with a
//! bounded buffer per subscriber; the engine never blocks on a slow
//! consumer because `tokio::sync::broadcast` drops the oldest unread
//! message for a lagging subscriber rather than back-pressuring the
//! publisher).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default per-subscriber buffer depth before the oldest unread event is dropped.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Mirrors the IPC broadcast `state:changed`: StateManager published a new snapshot.
    StateChanged,
    /// Mirrors `log:update`: a chunk of combined agent output.
    LogUpdate {
        project_id: Uuid,
        task_id: Uuid,
        chunk: String,
    },
    /// Mirrors `orchestrator:log`: a user-visible orchestrator message.
    OrchestratorLog {
        project_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Mirrors `workspace:logsChanged`: `.ralph/logs.json` was appended to.
    WorkspaceLogsChanged { project_id: Uuid },
}

/// Typed broadcast hub. Cloning an `EventBus` shares the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers. Returns the number of
    /// subscribers the event was delivered to (0 if there are none yet).
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn orchestrator_log(&self, project_id: Uuid, message: impl Into<String>) {
        self.publish(EngineEvent::OrchestratorLog {
            project_id,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let project_id = Uuid::new_v4();
        bus.orchestrator_log(project_id, "first");
        bus.orchestrator_log(project_id, "second");

        for rx in [&mut rx1, &mut rx2] {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            match (first, second) {
                (
                    EngineEvent::OrchestratorLog { message: m1, .. },
                    EngineEvent::OrchestratorLog { message: m2, .. },
                ) => {
                    assert_eq!(m1, "first");
                    assert_eq!(m2, "second");
                }
                other => panic!("unexpected events: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking_publisher() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        let project_id = Uuid::new_v4();
        for i in 0..5 {
            bus.orchestrator_log(project_id, format!("msg-{i}"));
        }

        // The slow subscriber missed messages, but the publish calls above
        // never blocked waiting for it to drain.
        let result = rx.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::new();
        let delivered = bus.publish(EngineEvent::StateChanged);
        assert_eq!(delivered, 0);
    }
}
