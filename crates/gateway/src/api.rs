//! HTTP API — chat streaming, stats and the event log.
//!
//! Endpoints:
//!
//! - `POST /api/chat`    — Send a message (and images), get an SSE reply stream
//! - `GET  /api/stats`   — Message counts and affinity
//! - `GET  /api/events`  — SSE stream of domain events

use axum::{
    Router,
    extract::State,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::Json,
    response::sse::{Event as SseEvent, Sse},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::{debug, info, warn};

use lunavilla_agent::{ChatEvent, ChatStats, TurnRequest, stats};
use lunavilla_core::error::Error;

use crate::SharedState;

/// Buffered reply fragments per chat stream.
const CHAT_EVENT_BUFFER: usize = 64;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the API router. Nest this under "/api" in the main router.
pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/stats", get(stats_handler))
        .route("/events", get(events_handler))
        .with_state(state)
}

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,

    /// Base64 images, each optionally carrying a `data:` URL header
    #[serde(default)]
    pub image_data: Vec<String>,

    /// Hour to compose the context for; -1 or absent means the wall clock
    #[serde(default, alias = "hour_override")]
    pub current_hour: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

// ── Chat ──────────────────────────────────────────────────────────────────

/// `POST /api/chat` — persist the message, then stream the reply as SSE.
///
/// Invalid input is a 400 and a failure to store the message is a 500,
/// both before any event is sent. Once streaming starts, every outcome is
/// reported in-band as `message` / `error` events.
async fn chat_handler(
    State(state): State<SharedState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let Json(payload) =
        payload.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    let request = TurnRequest::parse(&payload.message, &payload.image_data, payload.current_hour)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    info!(
        chars = request.input.text.chars().count(),
        images = request.input.attachments.len(),
        hour_override = ?request.hour_override,
        "Chat request"
    );

    let pending = state.orchestrator.begin(request).await.map_err(|e| match e {
        Error::InvalidInput(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        other => {
            warn!(error = %other, "Chat request rejected");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to save message: {other}"),
            )
        }
    })?;

    let (tx, rx) = mpsc::channel(CHAT_EVENT_BUFFER);
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        let outcome = pending.stream(tx, cancel).await;
        debug!(state = ?outcome.state(), "Chat stream finished");
    });

    let stream = ReceiverStream::new(rx).map(|event: ChatEvent| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    });

    Ok(Sse::new(stream))
}

// ── Stats ─────────────────────────────────────────────────────────────────

/// `GET /api/stats` — message counts and the affinity summary.
async fn stats_handler(State(state): State<SharedState>) -> Result<Json<ChatStats>, ApiError> {
    let orch = &state.orchestrator;
    stats::collect(orch.history().as_ref(), orch.tracker())
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// ── SSE Event Log ─────────────────────────────────────────────────────────

/// `GET /api/events` — SSE stream of domain events (turns, affinity, failures).
async fn events_handler(
    State(state): State<SharedState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.orchestrator.event_bus().subscribe();
    let stream = BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .map(|event| {
            let data = serde_json::to_string(event.as_ref()).unwrap_or_default();
            Ok(SseEvent::default().event(event.event_type()).data(data))
        });

    Sse::new(stream)
}
