//! Helpers shared by the streaming providers: the HTTP client, SSE line
//! framing and HTTP status mapping.

use std::time::Duration;

use lunavilla_core::error::ProviderError;
use tracing::warn;

/// Longest wait for the TCP/TLS handshake with a provider.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the HTTP client used for streamed replies.
///
/// There is no whole-request timeout: a long reply may stream for minutes.
/// `read_timeout` bounds each wait for more bytes instead.
pub(crate) fn http_client(read_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(read_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Accumulates raw bytes from a `text/event-stream` body and yields the
/// payload of each complete `data:` line.
/// Lines are split on raw bytes so a multi-byte character straddling two
/// network chunks is decoded only once it is complete.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    /// Feed a chunk of bytes; returns every `data:` payload completed by it.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Skip blank separators and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim().to_string());
            }
        }
        payloads
    }
}

/// Map a non-success HTTP status to a `ProviderError`, consuming the body.
pub(crate) async fn status_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();

    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        _ => {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider returned error");
            ProviderError::ApiError {
                status_code: status,
                message: error_body,
            }
        }
    }
}
