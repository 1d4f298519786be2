//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! `/chat/completions`.
//!
//! Supports:
//! - Streaming chat completions over SSE
//! - Image attachments as `image_url` parts carrying base64 data URLs

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use lunavilla_core::error::ProviderError;
use lunavilla_core::message::{Role, UserInput};
use lunavilla_core::provider::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::sse::{SseLineBuffer, http_client, status_error};

/// An OpenAI-compatible provider.
///
/// Most hosted and local model servers expose this API, so it is the
/// fallback for every provider name other than `gemini`.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// `read_timeout` bounds each wait for more response bytes.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http_client(read_timeout),
        }
    }

    /// Convert a generation request to the OpenAI message list.
    fn to_api_messages(request: &GenerationRequest) -> Vec<ApiMessage> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);

        if !request.system_instruction.is_empty() {
            messages.push(ApiMessage {
                role: "system".into(),
                content: ApiContent::Text(request.system_instruction.clone()),
            });
        }

        messages.extend(
            request
                .history
                .iter()
                .filter(|m| !m.content.trim().is_empty())
                .map(|m| ApiMessage {
                    role: match m.role {
                        Role::User => "user".into(),
                        Role::Companion => "assistant".into(),
                    },
                    content: ApiContent::Text(m.content.clone()),
                }),
        );

        messages.push(ApiMessage {
            role: "user".into(),
            content: Self::to_api_content(&request.input),
        });

        messages
    }

    /// Plain text when there are no attachments, a part list otherwise.
    fn to_api_content(input: &UserInput) -> ApiContent {
        if input.attachments.is_empty() {
            return ApiContent::Text(input.text.clone());
        }

        let mut parts = Vec::with_capacity(input.attachments.len() + 1);
        if !input.text.trim().is_empty() {
            parts.push(ApiContentPart::Text {
                text: input.text.clone(),
            });
        }
        for attachment in &input.attachments {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&attachment.data);
            parts.push(ApiContentPart::ImageUrl {
                image_url: ApiImageUrl {
                    url: format!("data:{};base64,{}", attachment.mime_type, encoded),
                },
            });
        }
        ApiContent::Parts(parts)
    }

    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request),
            "temperature": request.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        body
    }
}

#[async_trait]
impl lunavilla_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and parse chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();
            let mut usage = None;

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for data in lines.push(&bytes) {
                    // "[DONE]" signals end of stream
                    if data == "[DONE]" {
                        let _ = tx.send(Ok(StreamChunk::finished(usage))).await;
                        return;
                    }

                    let stream_resp = match serde_json::from_str::<StreamResponse>(&data) {
                        Ok(r) => r,
                        Err(e) => {
                            trace!(provider = %provider_name, error = %e, "Skipping unparseable chunk");
                            continue;
                        }
                    };

                    if let Some(err) = stream_resp.error {
                        let _ = tx
                            .send(Err(ProviderError::ApiError {
                                status_code: err.status_code(),
                                message: err.message,
                            }))
                            .await;
                        return;
                    }

                    if let Some(u) = stream_resp.usage {
                        usage = Some(Usage::from(u));
                    }

                    let Some(choice) = stream_resp.choices.into_iter().next() else {
                        continue;
                    };

                    if choice.finish_reason.as_deref() == Some("content_filter") {
                        let _ = tx
                            .send(Err(ProviderError::Blocked("content_filter".into())))
                            .await;
                        return;
                    }

                    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                        if tx.send(Ok(StreamChunk::text(content))).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
            }

            warn!(provider = %provider_name, "Stream ended without [DONE]");
            let _ = tx
                .send(Err(ProviderError::StreamInterrupted(
                    "the reply ended before the provider finished it".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ApiContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentPart {
    Text { text: String },
    ImageUrl { image_url: ApiImageUrl },
}

#[derive(Debug, Serialize)]
struct ApiImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

/// Error object some servers emit mid-stream instead of a choice.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    /// Numeric on some servers, a string like `"rate_limit_exceeded"` on others
    #[serde(default)]
    code: Option<serde_json::Value>,
    message: String,
}

impl ApiErrorBody {
    fn status_code(&self) -> u16 {
        self.code
            .as_ref()
            .and_then(|c| c.as_u64())
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(500)
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
