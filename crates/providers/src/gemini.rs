//! Google Gemini provider implementation.
//!
//! Talks to the Generative Language REST API through
//! `models/{model}:streamGenerateContent?alt=sse`.
//!
//! The persona goes in `system_instruction`, prior turns become `contents`
//! with the roles `user` / `model`, and image attachments travel inline as
//! base64 `inline_data` parts next to the new message text.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use lunavilla_core::error::ProviderError;
use lunavilla_core::message::Role;
use lunavilla_core::provider::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::sse::{SseLineBuffer, http_client, status_error};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Finish reasons that mean the reply was withheld by safety filtering.
const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

/// A Google Gemini provider.
pub struct GeminiProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    /// Create a provider against `base_url` (usually [`DEFAULT_BASE_URL`]).
    ///
    /// `read_timeout` bounds each wait for more response bytes.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            name: "gemini".into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http_client(read_timeout),
        }
    }

    /// Convert a generation request into the Gemini wire format.
    fn to_api_request(request: &GenerationRequest) -> ApiRequest {
        let mut contents: Vec<ApiContent> = request
            .history
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| ApiContent {
                role: Some(Self::api_role(m.role).into()),
                parts: vec![ApiPart::Text {
                    text: m.content.clone(),
                }],
            })
            .collect();

        // Gemini rejects empty text parts; image-only turns carry none
        let mut parts = Vec::with_capacity(request.input.attachments.len() + 1);
        if !request.input.text.trim().is_empty() {
            parts.push(ApiPart::Text {
                text: request.input.text.clone(),
            });
        }
        for attachment in &request.input.attachments {
            parts.push(ApiPart::InlineData {
                inline_data: ApiInlineData {
                    mime_type: attachment.mime_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(&attachment.data),
                },
            });
        }
        contents.push(ApiContent {
            role: Some("user".into()),
            parts,
        });

        let system_instruction = if request.system_instruction.is_empty() {
            None
        } else {
            Some(ApiContent {
                role: None,
                parts: vec![ApiPart::Text {
                    text: request.system_instruction.clone(),
                }],
            })
        };

        ApiRequest {
            system_instruction,
            contents,
            generation_config: ApiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }

    fn api_role(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Companion => "model",
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }
}

#[async_trait]
impl lunavilla_core::Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let url = format!(
            "{}?alt=sse",
            self.model_url(&request.model, "streamGenerateContent")
        );
        let body = Self::to_api_request(&request);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
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
                    let parsed = match parse_stream_payload(&data) {
                        Ok(p) => p,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };

                    if let Some(reason) = parsed.blocked {
                        let _ = tx.send(Err(ProviderError::Blocked(reason))).await;
                        return;
                    }

                    if parsed.usage.is_some() {
                        usage = parsed.usage;
                    }

                    if let Some(text) = parsed.text.filter(|t| !t.is_empty()) {
                        if tx.send(Ok(StreamChunk::text(text))).await.is_err() {
                            return; // receiver dropped
                        }
                    }

                    if parsed.finished {
                        trace!(provider = %provider_name, "Stream finished");
                        let _ = tx.send(Ok(StreamChunk::finished(usage))).await;
                        return;
                    }
                }
            }

            warn!(provider = %provider_name, "Stream ended without finish reason");
            let _ = tx
                .send(Err(ProviderError::StreamInterrupted(
                    "the reply ended before the provider finished it".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}

/// What a single stream event carried.
#[derive(Debug, Default, PartialEq)]
struct ParsedResponse {
    text: Option<String>,
    finished: bool,
    blocked: Option<String>,
    usage: Option<Usage>,
}

fn parse_stream_payload(data: &str) -> std::result::Result<ParsedResponse, ProviderError> {
    let api_resp: ApiResponse =
        serde_json::from_str(data).map_err(|e| ProviderError::StreamInterrupted(format!(
            "Malformed stream event: {e}"
        )))?;
    parse_response(api_resp)
}

fn parse_response(api_resp: ApiResponse) -> std::result::Result<ParsedResponse, ProviderError> {
    if let Some(err) = api_resp.error {
        return Err(ProviderError::ApiError {
            status_code: err.code.unwrap_or(500),
            message: err.message,
        });
    }

    let mut parsed = ParsedResponse {
        usage: api_resp.usage_metadata.map(Usage::from),
        ..Default::default()
    };

    if let Some(reason) = api_resp.prompt_feedback.and_then(|f| f.block_reason) {
        parsed.blocked = Some(reason);
        return Ok(parsed);
    }

    if let Some(candidate) = api_resp.candidates.into_iter().next() {
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        parsed.text = Some(text);

        if let Some(reason) = candidate.finish_reason {
            if BLOCKING_FINISH_REASONS.contains(&reason.as_str()) {
                parsed.blocked = Some(reason);
            } else {
                parsed.finished = true;
            }
        }
    }

    Ok(parsed)
}

// --- Gemini API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    contents: Vec<ApiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: ApiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct ApiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiPart {
    Text { text: String },
    InlineData { inline_data: ApiInlineData },
}

#[derive(Debug, Serialize)]
struct ApiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct ApiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    prompt_feedback: Option<ApiPromptFeedback>,
    usage_metadata: Option<ApiUsage>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCandidate {
    content: Option<ApiResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseContent {
    #[serde(default)]
    parts: Vec<ApiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ApiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<u16>,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::test_server::{after, now, serve_once};
    use lunavilla_core::Provider;
    use lunavilla_core::message::{Attachment, UserInput};

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "gemini-flash-latest".into(),
            system_instruction: "You are Luna.".into(),
            history: vec![
                HistoryMessage {
                    role: Role::User,
                    content: "hello".into(),
                },
                HistoryMessage {
                    role: Role::Companion,
                    content: "hi!".into(),
                },
            ],
            input: UserInput::text("what is this?")
                .with_attachment(Attachment::new("image/png", vec![1, 2, 3])),
            temperature: 0.9,
            max_tokens: Some(2048),
        }
    }

    #[test]
    fn constructor_trims_base_url() {
        let p = GeminiProvider::new("http://localhost:9000/v1beta/", "k", Duration::from_secs(5));
        assert_eq!(
            p.model_url("gemini-flash-latest", "streamGenerateContent"),
            "http://localhost:9000/v1beta/models/gemini-flash-latest:streamGenerateContent"
        );
    }

    #[test]
    fn request_maps_roles_and_inline_images() {
        let body = serde_json::to_value(GeminiProvider::to_api_request(&request())).unwrap();

        assert_eq!(
            body["system_instruction"]["parts"][0]["text"],
            "You are Luna."
        );
        assert!(body["system_instruction"].get("role").is_none());

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(contents[2]["parts"][0]["text"], "what is this?");
        assert_eq!(contents[2]["parts"][1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(contents[2]["parts"][1]["inline_data"]["data"], "AQID");

        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn image_only_turns_send_no_empty_text() {
        let mut req = request();
        req.history.insert(
            0,
            HistoryMessage {
                role: Role::User,
                content: String::new(),
            },
        );
        req.input = UserInput::default().with_attachment(Attachment::new("image/jpeg", vec![0xff]));

        let body = serde_json::to_value(GeminiProvider::to_api_request(&req)).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["parts"][0]["text"], "hello");

        let parts = contents[2]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/jpeg");
    }

    #[test]
    fn empty_system_instruction_is_omitted() {
        let mut req = request();
        req.system_instruction.clear();
        req.max_tokens = None;
        let body = serde_json::to_value(GeminiProvider::to_api_request(&req)).unwrap();
        assert!(body.get("system_instruction").is_none());
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
    }

    #[test]
    fn parse_text_delta() {
        let data = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        let parsed = parse_stream_payload(data).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("Hello"));
        assert!(!parsed.finished);
        assert!(parsed.blocked.is_none());
    }

    #[test]
    fn parse_final_event_with_usage() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"!"}]},"finishReason":"STOP"}],
            "usageMetadata":{"promptTokenCount":12,"candidatesTokenCount":3,"totalTokenCount":15},
            "modelVersion":"gemini-2.5-flash"}"#;
        let parsed = parse_stream_payload(data).unwrap();
        assert!(parsed.finished);
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn parse_prompt_block() {
        let data = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        let parsed = parse_stream_payload(data).unwrap();
        assert_eq!(parsed.blocked.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn parse_safety_finish_is_blocked() {
        let data = r#"{"candidates":[{"finishReason":"SAFETY"}]}"#;
        let parsed = parse_stream_payload(data).unwrap();
        assert_eq!(parsed.blocked.as_deref(), Some("SAFETY"));
        assert!(!parsed.finished);
    }

    #[test]
    fn parse_error_payload() {
        let data = r#"{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#;
        match parse_stream_payload(data) {
            Err(ProviderError::ApiError {
                status_code,
                message,
            }) => {
                assert_eq!(status_code, 400);
                assert!(message.contains("API key"));
            }
            other => panic!("Expected ApiError, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_interrupts_stream() {
        assert!(matches!(
            parse_stream_payload("{not json"),
            Err(ProviderError::StreamInterrupted(_))
        ));
    }

    // --- Streaming over HTTP ---

    fn event(json: &str) -> String {
        format!("data: {json}\r\n\r\n")
    }

    fn text_event(text: &str) -> String {
        event(&format!(
            r#"{{"candidates":[{{"content":{{"role":"model","parts":[{{"text":"{text}"}}]}}}}]}}"#
        ))
    }

    fn stop_event(text: &str) -> String {
        event(&format!(
            r#"{{"candidates":[{{"content":{{"parts":[{{"text":"{text}"}}]}},"finishReason":"STOP"}}],"usageMetadata":{{"totalTokenCount":6}}}}"#
        ))
    }

    /// Drain a reply stream into (text, finished, error).
    async fn drain(mut rx: ChunkReceiver) -> (String, bool, Option<ProviderError>) {
        let mut text = String::new();
        let mut finished = false;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    if let Some(c) = chunk.content {
                        text.push_str(&c);
                    }
                    finished |= chunk.done;
                }
                Err(e) => return (text, finished, Some(e)),
            }
        }
        (text, finished, None)
    }

    fn provider(base_url: &str) -> GeminiProvider {
        GeminiProvider::new(base_url, "test-key", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn streams_until_finish_reason() {
        let (url, server) =
            serve_once(200, vec![now(&text_event("Hel")), now(&stop_event("lo"))]).await;

        let rx = provider(&url).stream(request()).await.unwrap();
        let (text, finished, error) = drain(rx).await;
        assert_eq!(text, "Hello");
        assert!(finished);
        assert!(error.is_none());

        let raw_request = server.await.unwrap();
        assert!(raw_request.contains(
            "/models/gemini-flash-latest:streamGenerateContent?alt=sse"
        ));
        assert!(raw_request.to_lowercase().contains("x-goog-api-key: test-key"));
        assert!(raw_request.contains("\"inline_data\""));
    }

    #[tokio::test]
    async fn body_closing_without_finish_reason_is_an_error() {
        let (url, _server) = serve_once(200, vec![now(&text_event("Hel"))]).await;

        let rx = provider(&url).stream(request()).await.unwrap();
        let (text, finished, error) = drain(rx).await;
        assert_eq!(text, "Hel");
        assert!(!finished);
        assert!(matches!(error, Some(ProviderError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn error_event_mid_stream() {
        let (url, _server) = serve_once(
            200,
            vec![
                now(&text_event("Hel")),
                now(&event(r#"{"error":{"code":503,"message":"The model is overloaded"}}"#)),
            ],
        )
        .await;

        let rx = provider(&url).stream(request()).await.unwrap();
        let (_, finished, error) = drain(rx).await;
        assert!(!finished);
        match error {
            Some(ProviderError::ApiError {
                status_code,
                message,
            }) => {
                assert_eq!(status_code, 503);
                assert!(message.contains("overloaded"));
            }
            other => panic!("Expected ApiError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_key_fails_before_streaming() {
        let (url, _server) =
            serve_once(403, vec![now(r#"{"error":{"message":"denied"}}"#)]).await;

        let err = provider(&url).stream(request()).await.err().unwrap();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn slow_reply_outlives_the_read_timeout() {
        // Each gap is under the read timeout; the whole reply is not
        let (url, _server) = serve_once(
            200,
            vec![
                now(&text_event("a")),
                after(300, &text_event("b")),
                after(300, &stop_event("c")),
            ],
        )
        .await;

        let provider = GeminiProvider::new(&url, "k", Duration::from_millis(500));
        let rx = provider.stream(request()).await.unwrap();
        let (text, finished, error) = drain(rx).await;
        assert!(error.is_none(), "unexpected error: {error:?}");
        assert_eq!(text, "abc");
        assert!(finished);
    }
}
