//! Domain event system — decoupled communication between the engine and
//! external consumers (memory compaction, dashboards, telemetry).
//!
//! At-most-once delivery: publishing never blocks and lagging subscribers
//! lose events rather than applying back-pressure to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::message::TokenUsage;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A conversation's accumulated token usage changed
    TokenUsageUpdated {
        conversation_id: String,
        usage: TokenUsage,
        timestamp: DateTime<Utc>,
    },

    /// One engine turn (user message → terminal decision) finished
    TurnCompleted {
        conversation_id: String,
        iterations: u32,
        truncated: bool,
        timestamp: DateTime<Utc>,
    },

    /// A sub-agent was started as part of a wave
    AgentSpawned {
        conversation_id: String,
        agent_id: String,
        wave: usize,
        timestamp: DateTime<Utc>,
    },

    /// A sub-agent reached a terminal state
    AgentFinished {
        conversation_id: String,
        agent_id: String,
        outcome: String, // "completed", "crashed", "skipped", "gate_rejected"
        timestamp: DateTime<Utc>,
    },

    /// A skill was executed
    SkillExecuted {
        skill: String,
        agent_id: Option<String>,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A circuit breaker opened at some level
    CircuitOpened {
        level: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A circuit breaker closed again
    CircuitClosed {
        level: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A sub-agent asked its parent for help
    HelpRequested {
        conversation_id: String,
        agent_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Components
/// subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::TurnCompleted {
            conversation_id: "conv_1".into(),
            iterations: 3,
            truncated: false,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::TurnCompleted {
                conversation_id,
                iterations,
                ..
            } => {
                assert_eq!(conversation_id, "conv_1");
                assert_eq!(*iterations, 3);
            }
            _ => panic!("Expected TurnCompleted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::CircuitOpened {
            level: "skill".into(),
            key: "email.send".into(),
            timestamp: Utc::now(),
        });
    }
}
