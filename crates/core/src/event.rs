//! Domain event system — decoupled observation of the turn pipeline.
//!
//! Events are published when something interesting happens to the
//! conversation. Observers (the gateway's event stream, logs) subscribe
//! without the orchestrator knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::affinity::AffinityState;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A user turn was accepted and persisted
    TurnReceived {
        turn_id: i64,
        content_preview: String,
        attachments: usize,
        timestamp: DateTime<Utc>,
    },

    /// The companion's reply was fully streamed and persisted
    ReplyCompleted {
        turn_id: i64,
        provider: String,
        chars: usize,
        partial: bool,
        timestamp: DateTime<Utc>,
    },

    /// Generation failed; nothing was committed for the reply
    TurnFailed {
        user_turn_id: i64,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// The affinity singleton moved
    AffinityChanged {
        previous: AffinityState,
        current: AffinityState,
        leveled_up: bool,
        penalized: bool,
        timestamp: DateTime<Utc>,
    },

    /// A reply was streamed but persisting it or its affinity update failed
    CommitFailed {
        stage: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Event name for SSE framing.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnReceived { .. } => "turn_received",
            Self::ReplyCompleted { .. } => "reply_completed",
            Self::TurnFailed { .. } => "turn_failed",
            Self::AffinityChanged { .. } => "affinity_changed",
            Self::CommitFailed { .. } => "commit_failed",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
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
        // No subscribers is fine
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
