//! Provider trait — the abstraction over the generation capability.
//!
//! A Provider takes a system instruction, the prior dialogue and the new
//! multimodal input, and produces the companion's reply as a finite stream
//! of text fragments.
//!
//! Implementations: Google Gemini, OpenAI-compatible endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{Role, Turn, UserInput};

/// One prior turn as the generation capability sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Turn> for HistoryMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// Everything a provider needs to produce one reply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The model to use (e.g., "gemini-flash-latest", "gpt-4o-mini")
    pub model: String,

    /// Persona plus time/affinity directives
    pub system_instruction: String,

    /// Prior turns, oldest first, excluding the new input
    pub history: Vec<HistoryMessage>,

    /// The new user turn
    pub input: UserInput,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    pub temperature: f32,

    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            done: false,
            usage: None,
        }
    }

    pub fn finished(usage: Option<Usage>) -> Self {
        Self {
            content: None,
            done: true,
            usage,
        }
    }
}

/// Receiving half of a reply stream.
pub type ChunkReceiver =
    tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>;

/// The core Provider trait.
///
/// The orchestrator calls `stream()` without knowing which backend answers.
/// A well-formed stream ends with exactly one `done` chunk or one error; a
/// channel that closes before either means the reply was cut off.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "gemini", "openai").
    fn name(&self) -> &str;

    /// Send a request and get a stream of reply chunks.
    async fn stream(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError>;
}
