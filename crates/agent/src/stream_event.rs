//! Caller-facing streaming events for one chat turn.
//!
//! `ChatEvent` is what the gateway forwards over SSE and the CLI prints:
//! - `message` — `{"content": "...", "done": false}` per reply fragment,
//!   then `{"content": "", "done": true}` once the reply is complete
//! - `error`   — `{"error": "..."}`, at most once, and nothing follows it

use serde::{Deserialize, Serialize};

/// Prefix of every caller-visible generation error.
pub const ERROR_PREFIX: &str = "Something went wrong…";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatEvent {
    /// A reply fragment, or the terminal marker when `done` is set.
    Delta { content: String, done: bool },

    /// The turn failed.
    Error { error: String },
}

impl ChatEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Delta {
            content: content.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self::Delta {
            content: String::new(),
            done: true,
        }
    }

    /// Error event with the standard human-readable prefix.
    pub fn error(reason: impl std::fmt::Display) -> Self {
        Self::Error {
            error: format!("{ERROR_PREFIX} {reason}"),
        }
    }

    /// SSE event name for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "message",
            Self::Error { .. } => "error",
        }
    }

    /// True for the last event a turn will ever send.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Delta { done, .. } => *done,
            Self::Error { .. } => true,
        }
    }
}
