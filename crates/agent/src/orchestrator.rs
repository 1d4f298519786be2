//! The turn pipeline.
//!
//! One turn moves through
//! `Received → PersistedInput → ContextBuilt → Generating → Streaming →
//! Completed | Failed`:
//!
//! 1. **Persist** the user turn ([`TurnOrchestrator::begin`]). Failure here is
//!    a request-level error and no stream events are produced.
//! 2. **Build context**: history window before the new turn, affinity
//!    snapshot, sentiment, persona.
//! 3. **Generate** and relay every fragment to the caller as it arrives.
//! 4. **Commit**: the `done` event, the companion turn, the affinity update.
//!
//! A generation failure sends one error event and commits nothing for the
//! reply; the user turn stays. A reply that stops before the provider marks
//! it finished is a generation failure too. A cancelled or disconnected turn
//! stops relaying and commits whatever text was already received, or fails
//! if nothing was; a cancelled caller that is still listening gets `done`.
//!
//! Every send to the caller is bounded by the idle timeout, so a caller that
//! stops reading cannot hold the turn lock.
//!
//! Turns are serialized: the orchestrator's lock is held from persisting the
//! user turn until the affinity update is written.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lunavilla_config::AppConfig;
use lunavilla_core::affinity::{AffinityState, AffinityUpdate, Sentiment};
use lunavilla_core::error::{Error, ProviderError, Result};
use lunavilla_core::event::{DomainEvent, EventBus};
use lunavilla_core::message::{Role, TurnId};
use lunavilla_core::provider::{GenerationRequest, HistoryMessage, Provider};
use lunavilla_core::store::{AffinityStore, HistoryStore};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{compose, current_hour, load_persona};
use crate::request::TurnRequest;
use crate::stream_event::ChatEvent;
use crate::tracker::AffinityTracker;

/// Where a turn is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    PersistedInput,
    ContextBuilt,
    Generating,
    Streaming,
    Completed,
    Failed,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed {
        /// Id of the stored companion turn, if storing it succeeded.
        reply_turn_id: Option<TurnId>,
        reply: String,
        /// The reply was cut short by cancellation or disconnect.
        partial: bool,
        /// The affinity transition, if it was written.
        affinity: Option<AffinityUpdate>,
    },
    Failed {
        reason: String,
    },
}

impl TurnOutcome {
    pub fn state(&self) -> TurnState {
        match self {
            TurnOutcome::Completed { .. } => TurnState::Completed,
            TurnOutcome::Failed { .. } => TurnState::Failed,
        }
    }
}

/// Tunables the orchestrator needs from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub history_window: usize,
    pub idle_timeout: Duration,
    pub hostile_terms: Vec<String>,
    pub persona_path: PathBuf,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            temperature: config.default_temperature,
            max_tokens: Some(config.default_max_tokens),
            history_window: config.chat.history_window,
            idle_timeout: Duration::from_secs(config.chat.stream_idle_timeout_secs),
            hostile_terms: config.chat.hostile_terms.clone(),
            persona_path: config.persona_path(),
        }
    }
}

/// Runs chat turns end to end.
///
/// Cloning is cheap; clones share the provider, the stores and the turn lock.
#[derive(Clone)]
pub struct TurnOrchestrator {
    provider: Arc<dyn Provider>,
    history: Arc<dyn HistoryStore>,
    tracker: AffinityTracker,
    event_bus: Arc<EventBus>,
    settings: Arc<OrchestratorSettings>,
    turn_lock: Arc<Mutex<()>>,
}

impl TurnOrchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        history: Arc<dyn HistoryStore>,
        affinity: Arc<dyn AffinityStore>,
        event_bus: Arc<EventBus>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            provider,
            history,
            tracker: AffinityTracker::new(affinity),
            event_bus,
            settings: Arc::new(settings),
            turn_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn tracker(&self) -> &AffinityTracker {
        &self.tracker
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Wait for the turn lock and persist the user turn.
    ///
    /// Returns the pending turn, which keeps the lock until it finishes
    /// streaming (or is dropped).
    pub async fn begin(&self, request: TurnRequest) -> Result<PendingTurn> {
        debug!(state = ?TurnState::Received, "Turn received");
        let guard = self.turn_lock.clone().lock_owned().await;

        let user_turn_id = self
            .history
            .append(Role::User, &request.input.text)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to persist user turn");
                Error::Store(e)
            })?;

        info!(
            turn_id = %user_turn_id,
            chars = request.input.text.chars().count(),
            attachments = request.input.attachments.len(),
            "User turn persisted"
        );

        self.event_bus.publish(DomainEvent::TurnReceived {
            turn_id: user_turn_id.0,
            content_preview: preview(&request.input.text),
            attachments: request.input.attachments.len(),
            timestamp: Utc::now(),
        });

        Ok(PendingTurn {
            orchestrator: self.clone(),
            request,
            user_turn_id,
            state: TurnState::PersistedInput,
            _guard: guard,
        })
    }

    /// `begin` followed by `stream`.
    pub async fn run(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let pending = self.begin(request).await?;
        Ok(pending.stream(events, cancel).await)
    }
}

/// A turn whose user input is stored and which holds the turn lock.
pub struct PendingTurn {
    orchestrator: TurnOrchestrator,
    request: TurnRequest,
    user_turn_id: TurnId,
    state: TurnState,
    _guard: OwnedMutexGuard<()>,
}

impl PendingTurn {
    pub fn user_turn_id(&self) -> TurnId {
        self.user_turn_id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    fn transition(&mut self, next: TurnState) {
        debug!(turn_id = %self.user_turn_id, from = ?self.state, to = ?next, "Turn state");
        self.state = next;
    }

    /// Generate the reply, relaying fragments into `events`, then commit.
    ///
    /// Never returns an error: failures are reported to the caller as a
    /// single [`ChatEvent::Error`] and in the returned outcome.
    pub async fn stream(
        mut self,
        events: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let orch = self.orchestrator.clone();
        let settings = orch.settings.clone();

        // --- Build context ---
        let window = match orch
            .history
            .recent(self.user_turn_id, settings.history_window)
            .await
        {
            Ok(w) => w,
            Err(e) => return self.fail(&events, e.to_string()).await,
        };
        let affinity = match orch.tracker.read().await {
            Ok(a) => a,
            Err(e) => return self.fail(&events, e.to_string()).await,
        };

        let sentiment = Sentiment::classify(&self.request.input.text, &settings.hostile_terms);
        let hour = self.request.hour_override.unwrap_or_else(current_hour);
        let persona = load_persona(&settings.persona_path).await;
        let system_instruction = compose(&persona, hour, affinity, sentiment);
        self.transition(TurnState::ContextBuilt);

        debug!(
            turn_id = %self.user_turn_id,
            history = window.len(),
            hour,
            level = affinity.level,
            hostile = sentiment.is_hostile(),
            "Context built"
        );

        let request = GenerationRequest {
            model: settings.model.clone(),
            system_instruction,
            history: window.iter().map(HistoryMessage::from).collect(),
            input: self.request.input.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        };

        // --- Generate ---
        self.transition(TurnState::Generating);
        let mut chunks = match orch.provider.stream(request).await {
            Ok(rx) => rx,
            Err(e) => return self.fail(&events, e.to_string()).await,
        };
        self.transition(TurnState::Streaming);

        let mut reply = String::new();
        let mut interrupted = false;
        // The caller cannot take a terminal event (closed or not reading)
        let mut caller_gone = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(turn_id = %self.user_turn_id, "Turn cancelled");
                    interrupted = true;
                    break;
                }
                _ = events.closed() => {
                    info!(turn_id = %self.user_turn_id, "Caller disconnected");
                    interrupted = true;
                    caller_gone = true;
                    break;
                }
                next = tokio::time::timeout(settings.idle_timeout, chunks.recv()) => next,
            };

            match next {
                Err(_) => {
                    let err = ProviderError::Timeout(format!(
                        "no reply fragment within {}s",
                        settings.idle_timeout.as_secs()
                    ));
                    return self.fail(&events, err.to_string()).await;
                }
                Ok(None) => {
                    let err = ProviderError::StreamInterrupted(
                        "the reply ended before the provider finished it".into(),
                    );
                    return self.fail(&events, err.to_string()).await;
                }
                Ok(Some(Err(e))) => return self.fail(&events, e.to_string()).await,
                Ok(Some(Ok(chunk))) => {
                    if let Some(text) = chunk.content.filter(|c| !c.is_empty()) {
                        reply.push_str(&text);
                        match relay(&events, ChatEvent::chunk(text), &cancel, settings.idle_timeout)
                            .await
                        {
                            Relay::Sent => {}
                            Relay::Cancelled => {
                                info!(turn_id = %self.user_turn_id, "Turn cancelled");
                                interrupted = true;
                                break;
                            }
                            Relay::Closed => {
                                info!(turn_id = %self.user_turn_id, "Caller disconnected");
                                interrupted = true;
                                caller_gone = true;
                                break;
                            }
                            Relay::Stalled => {
                                warn!(turn_id = %self.user_turn_id, "Caller stopped reading");
                                interrupted = true;
                                caller_gone = true;
                                break;
                            }
                        }
                    }
                    if chunk.done {
                        break;
                    }
                }
            }
        }

        // Stop the producer before committing
        drop(chunks);

        if reply.is_empty() {
            let reason = if interrupted {
                "the reply was cancelled before any text arrived"
            } else {
                "the reply was empty"
            };
            return self.fail(&events, reason.to_string()).await;
        }

        if !caller_gone && !events.is_closed() {
            send_terminal(&events, ChatEvent::done(), settings.idle_timeout).await;
        }

        self.commit(reply, interrupted, affinity, sentiment).await
    }

    /// Store the companion turn and advance affinity.
    async fn commit(
        mut self,
        reply: String,
        partial: bool,
        affinity: AffinityState,
        sentiment: Sentiment,
    ) -> TurnOutcome {
        let orch = self.orchestrator.clone();

        let reply_turn_id = match orch.history.append(Role::Companion, &reply).await {
            Ok(id) => id,
            Err(e) => {
                error!(turn_id = %self.user_turn_id, error = %e, "Failed to persist reply");
                orch.event_bus.publish(DomainEvent::CommitFailed {
                    stage: "history".into(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                self.transition(TurnState::Completed);
                return TurnOutcome::Completed {
                    reply_turn_id: None,
                    reply,
                    partial,
                    affinity: None,
                };
            }
        };

        orch.event_bus.publish(DomainEvent::ReplyCompleted {
            turn_id: reply_turn_id.0,
            provider: orch.provider.name().to_string(),
            chars: reply.chars().count(),
            partial,
            timestamp: Utc::now(),
        });

        let affinity = match orch.tracker.apply(affinity, sentiment).await {
            Ok(update) => {
                orch.event_bus.publish(DomainEvent::AffinityChanged {
                    previous: update.previous,
                    current: update.state,
                    leveled_up: update.leveled_up,
                    penalized: update.penalized,
                    timestamp: Utc::now(),
                });
                Some(update)
            }
            Err(e) => {
                error!(turn_id = %self.user_turn_id, error = %e, "Failed to update affinity");
                orch.event_bus.publish(DomainEvent::CommitFailed {
                    stage: "affinity".into(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                None
            }
        };

        self.transition(TurnState::Completed);
        info!(
            turn_id = %self.user_turn_id,
            reply_turn_id = %reply_turn_id,
            chars = reply.chars().count(),
            partial,
            "Turn completed"
        );

        TurnOutcome::Completed {
            reply_turn_id: Some(reply_turn_id),
            reply,
            partial,
            affinity,
        }
    }

    /// Report a generation failure; nothing is committed for the reply.
    async fn fail(mut self, events: &mpsc::Sender<ChatEvent>, reason: String) -> TurnOutcome {
        warn!(turn_id = %self.user_turn_id, state = ?self.state, reason = %reason, "Turn failed");
        self.transition(TurnState::Failed);

        let idle = self.orchestrator.settings.idle_timeout;
        send_terminal(events, ChatEvent::error(&reason), idle).await;
        self.orchestrator.event_bus.publish(DomainEvent::TurnFailed {
            user_turn_id: self.user_turn_id.0,
            error_message: reason.clone(),
            timestamp: Utc::now(),
        });

        TurnOutcome::Failed { reason }
    }
}

/// How relaying one event to the caller ended.
enum Relay {
    Sent,
    Cancelled,
    Closed,
    /// The caller left the buffer full for a whole idle period.
    Stalled,
}

/// Send one event, giving up on cancellation or after `idle`.
async fn relay(
    events: &mpsc::Sender<ChatEvent>,
    event: ChatEvent,
    cancel: &CancellationToken,
    idle: Duration,
) -> Relay {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Relay::Cancelled,
        sent = tokio::time::timeout(idle, events.send(event)) => match sent {
            Ok(Ok(())) => Relay::Sent,
            Ok(Err(_)) => Relay::Closed,
            Err(_) => Relay::Stalled,
        },
    }
}

/// Send the final `done` or `error` event; dropped if the caller cannot
/// take it within `idle`.
async fn send_terminal(events: &mpsc::Sender<ChatEvent>, event: ChatEvent, idle: Duration) {
    if tokio::time::timeout(idle, events.send(event)).await.is_err() {
        debug!("Caller did not take the final event");
    }
}

/// First 80 characters of a message, for event payloads.
fn preview(text: &str) -> String {
    const MAX: usize = 80;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let mut p: String = text.chars().take(MAX).collect();
        p.push('…');
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lunavilla_core::message::UserInput;
    use lunavilla_core::provider::{ChunkReceiver, StreamChunk};
    use lunavilla_store::InMemoryStore;
    use std::sync::Mutex as StdMutex;

    /// What a scripted stream does after its fragments are sent.
    #[derive(Clone)]
    enum Ending {
        Done,
        Fail(ProviderError),
        /// Drop the sender without a final chunk
        Close,
        Hang,
    }

    /// A provider that streams scripted fragments and records its requests.
    struct ScriptedProvider {
        fragments: Vec<String>,
        ending: Ending,
        refuse: Option<ProviderError>,
        requests: StdMutex<Vec<GenerationRequest>>,
        // keeps hanging streams open
        parked: StdMutex<Vec<mpsc::Sender<std::result::Result<StreamChunk, ProviderError>>>>,
    }

    impl ScriptedProvider {
        fn new(fragments: &[&str], ending: Ending) -> Self {
            Self {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                ending,
                refuse: None,
                requests: StdMutex::new(Vec::new()),
                parked: StdMutex::new(Vec::new()),
            }
        }

        fn refusing(err: ProviderError) -> Self {
            Self {
                refuse: Some(err),
                ..Self::new(&[], Ending::Done)
            }
        }

        fn last_request(&self) -> GenerationRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream(
            &self,
            request: GenerationRequest,
        ) -> std::result::Result<ChunkReceiver, ProviderError> {
            self.requests.lock().unwrap().push(request);
            if let Some(err) = &self.refuse {
                return Err(err.clone());
            }

            let (tx, rx) = mpsc::channel(64);
            for fragment in &self.fragments {
                tx.send(Ok(StreamChunk::text(fragment.clone()))).await.unwrap();
            }
            match &self.ending {
                Ending::Done => {
                    tx.send(Ok(StreamChunk::finished(None))).await.unwrap();
                }
                Ending::Fail(err) => {
                    tx.send(Err(err.clone())).await.unwrap();
                }
                Ending::Close => drop(tx),
                Ending::Hang => self.parked.lock().unwrap().push(tx),
            }
            Ok(rx)
        }
    }

    struct Harness {
        orchestrator: TurnOrchestrator,
        store: Arc<InMemoryStore>,
        provider: Arc<ScriptedProvider>,
        bus: Arc<EventBus>,
        _dir: tempfile::TempDir,
    }

    fn harness(provider: ScriptedProvider, affinity: AffinityState) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let persona_path = dir.path().join("persona.md");
        std::fs::write(&persona_path, "You are Luna.").unwrap();

        let store = Arc::new(InMemoryStore::with_affinity(affinity));
        let provider = Arc::new(provider);
        let bus = Arc::new(EventBus::new(64));
        let settings = OrchestratorSettings {
            model: "test-model".into(),
            temperature: 0.9,
            max_tokens: Some(256),
            history_window: 20,
            idle_timeout: Duration::from_secs(5),
            hostile_terms: vec!["baka".into(), "嫌い".into()],
            persona_path,
        };
        let orchestrator = TurnOrchestrator::new(
            provider.clone(),
            store.clone(),
            store.clone(),
            bus.clone(),
            settings,
        );
        Harness {
            orchestrator,
            store,
            provider,
            bus,
            _dir: dir,
        }
    }

    fn text_request(text: &str) -> TurnRequest {
        TurnRequest::new(UserInput::text(text)).with_hour(3)
    }

    async fn run_collect(h: &Harness, request: TurnRequest) -> (TurnOutcome, Vec<ChatEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = h
            .orchestrator
            .run(request, tx, CancellationToken::new())
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn completed_turn_streams_and_commits() {
        let h = harness(
            ScriptedProvider::new(&["Hel", "lo", "!"], Ending::Done),
            AffinityState::new(1, 0),
        );

        let (outcome, events) = run_collect(&h, text_request("good evening")).await;

        assert_eq!(
            events,
            vec![
                ChatEvent::chunk("Hel"),
                ChatEvent::chunk("lo"),
                ChatEvent::chunk("!"),
                ChatEvent::done(),
            ]
        );
        match outcome {
            TurnOutcome::Completed {
                reply,
                partial,
                affinity,
                reply_turn_id,
            } => {
                assert_eq!(reply, "Hello!");
                assert!(!partial);
                assert!(reply_turn_id.is_some());
                assert_eq!(affinity.unwrap().state, AffinityState::new(1, 10));
            }
            other => panic!("Expected Completed, got {other:?}"),
        }

        let turns = h.store.turns().await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Companion);
        assert_eq!(turns[1].content, "Hello!");
        assert_eq!(h.store.load().await.unwrap(), AffinityState::new(1, 10));
    }

    #[tokio::test]
    async fn history_window_excludes_current_turn() {
        let h = harness(
            ScriptedProvider::new(&["ok"], Ending::Done),
            AffinityState::default(),
        );
        h.store.append(Role::User, "earlier").await.unwrap();
        h.store.append(Role::Companion, "earlier reply").await.unwrap();

        run_collect(&h, text_request("now")).await;

        let request = h.provider.last_request();
        let contents: Vec<&str> = request.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["earlier", "earlier reply"]);
        assert_eq!(request.input.text, "now");
        assert_eq!(request.model, "test-model");
    }

    #[tokio::test]
    async fn context_carries_persona_time_and_affinity() {
        let h = harness(
            ScriptedProvider::new(&["ok"], Ending::Done),
            AffinityState::new(4, 90),
        );

        run_collect(&h, text_request("hi")).await;

        let system = h.provider.last_request().system_instruction;
        assert!(system.starts_with("You are Luna."));
        assert!(system.contains("Current time: around 3:00"));
        assert!(system.contains("Current affinity level: 4"));
        assert!(system.contains("went up"));
    }

    #[tokio::test]
    async fn level_up_and_penalty() {
        let h = harness(
            ScriptedProvider::new(&["yay"], Ending::Done),
            AffinityState::new(4, 95),
        );
        let (outcome, _) = run_collect(&h, text_request("thanks")).await;
        let TurnOutcome::Completed { affinity, .. } = outcome else {
            panic!("Expected Completed");
        };
        let update = affinity.unwrap();
        assert!(update.leveled_up);
        assert_eq!(update.state, AffinityState::new(5, 0));

        let h = harness(
            ScriptedProvider::new(&["hmph"], Ending::Done),
            AffinityState::new(10, 50),
        );
        let (outcome, _) = run_collect(&h, text_request("you BAKA")).await;
        let TurnOutcome::Completed { affinity, .. } = outcome else {
            panic!("Expected Completed");
        };
        let update = affinity.unwrap();
        assert!(update.penalized);
        assert_eq!(update.state, AffinityState::new(9, 0));
    }

    #[tokio::test]
    async fn generation_error_mid_stream_commits_nothing() {
        let h = harness(
            ScriptedProvider::new(
                &["partial "],
                Ending::Fail(ProviderError::StreamInterrupted("connection reset".into())),
            ),
            AffinityState::new(3, 40),
        );
        let mut bus_rx = h.bus.subscribe();

        let (outcome, events) = run_collect(&h, text_request("hello")).await;

        assert_eq!(outcome.state(), TurnState::Failed);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ChatEvent::chunk("partial "));
        match &events[1] {
            ChatEvent::Error { error } => {
                assert!(error.starts_with("Something went wrong…"));
                assert!(error.contains("connection reset"));
            }
            other => panic!("Expected error event, got {other:?}"),
        }

        let turns = h.store.turns().await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(h.store.load().await.unwrap(), AffinityState::new(3, 40));

        let first = bus_rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "turn_received");
        let second = bus_rx.recv().await.unwrap();
        assert_eq!(second.event_type(), "turn_failed");
    }

    #[tokio::test]
    async fn provider_refusal_is_a_single_error_event() {
        let h = harness(
            ScriptedProvider::refusing(ProviderError::AuthenticationFailed("bad key".into())),
            AffinityState::default(),
        );

        let (outcome, events) = run_collect(&h, text_request("hello")).await;

        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChatEvent::Error { .. }));
        assert_eq!(h.store.turns().await.len(), 1);
        assert_eq!(h.store.load().await.unwrap(), AffinityState::default());
    }

    #[tokio::test]
    async fn user_turn_persist_failure_is_request_error() {
        let h = harness(
            ScriptedProvider::new(&["never"], Ending::Done),
            AffinityState::default(),
        );
        h.store.set_fail_writes(true);

        let (tx, mut rx) = mpsc::channel(8);
        let result = h
            .orchestrator
            .run(text_request("hello"), tx, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Store(_))));
        assert!(rx.recv().await.is_none());
        assert!(h.provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out() {
        let h = harness(
            ScriptedProvider::new(&["slow"], Ending::Hang),
            AffinityState::new(2, 0),
        );

        let (outcome, events) = run_collect(&h, text_request("hello")).await;

        assert!(matches!(outcome, TurnOutcome::Failed { ref reason } if reason.contains("timed out")));
        assert!(matches!(events.last(), Some(ChatEvent::Error { .. })));
        assert_eq!(h.store.turns().await.len(), 1);
        assert_eq!(h.store.load().await.unwrap(), AffinityState::new(2, 0));
    }

    #[tokio::test]
    async fn cancellation_commits_partial_reply() {
        let h = harness(
            ScriptedProvider::new(&["Hel"], Ending::Hang),
            AffinityState::new(1, 0),
        );
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);

        let orchestrator = h.orchestrator.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run(text_request("hello"), tx, token)
                .await
                .unwrap()
        });

        assert_eq!(rx.recv().await.unwrap(), ChatEvent::chunk("Hel"));
        cancel.cancel();
        let outcome = task.await.unwrap();

        match outcome {
            TurnOutcome::Completed { reply, partial, .. } => {
                assert_eq!(reply, "Hel");
                assert!(partial);
            }
            other => panic!("Expected Completed, got {other:?}"),
        }
        // the caller is still listening, so the stream is closed off
        assert_eq!(rx.recv().await.unwrap(), ChatEvent::done());
        assert!(rx.recv().await.is_none());

        let turns = h.store.turns().await;
        assert_eq!(turns.last().unwrap().content, "Hel");
        assert_eq!(h.store.load().await.unwrap(), AffinityState::new(1, 10));
    }

    #[tokio::test]
    async fn stream_closing_without_done_fails() {
        let h = harness(
            ScriptedProvider::new(&["Hel"], Ending::Close),
            AffinityState::new(2, 30),
        );

        let (outcome, events) = run_collect(&h, text_request("hello")).await;

        assert!(
            matches!(outcome, TurnOutcome::Failed { ref reason } if reason.contains("interrupted"))
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ChatEvent::chunk("Hel"));
        assert!(matches!(events[1], ChatEvent::Error { .. }));
        assert!(!events.contains(&ChatEvent::done()));

        let turns = h.store.turns().await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(h.store.load().await.unwrap(), AffinityState::new(2, 30));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_not_reading_does_not_hold_the_lock() {
        let h = harness(
            ScriptedProvider::new(&["a", "b", "c"], Ending::Hang),
            AffinityState::new(1, 0),
        );
        let cancel = CancellationToken::new();
        // Room for one event; nobody reads
        let (tx, _rx) = mpsc::channel(1);

        let orchestrator = h.orchestrator.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run(text_request("hello"), tx, token)
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(8), task)
            .await
            .expect("turn did not finish after cancel")
            .unwrap();
        match outcome {
            TurnOutcome::Completed { reply, partial, .. } => {
                assert_eq!(reply, "ab");
                assert!(partial);
            }
            other => panic!("Expected Completed, got {other:?}"),
        }

        // The next turn can start
        let next = tokio::time::timeout(
            Duration::from_secs(1),
            h.orchestrator.begin(text_request("again")),
        )
        .await;
        assert!(next.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn caller_not_reading_is_given_up_after_idle_timeout() {
        let h = harness(
            ScriptedProvider::new(&["a", "b"], Ending::Hang),
            AffinityState::new(1, 0),
        );
        let (tx, _rx) = mpsc::channel(1);

        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            h.orchestrator
                .run(text_request("hello"), tx, CancellationToken::new()),
        )
        .await
        .expect("stalled caller held the turn")
        .unwrap();

        assert!(matches!(outcome, TurnOutcome::Completed { partial: true, .. }));
        assert_eq!(h.store.turns().await.last().unwrap().content, "ab");
    }

    #[tokio::test]
    async fn disconnect_before_any_text_fails() {
        let h = harness(ScriptedProvider::new(&[], Ending::Hang), AffinityState::new(1, 0));
        let (tx, rx) = mpsc::channel(64);
        drop(rx);

        let outcome = h
            .orchestrator
            .run(text_request("hello"), tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        assert_eq!(h.store.turns().await.len(), 1);
        assert_eq!(h.store.load().await.unwrap(), AffinityState::new(1, 0));
    }

    #[tokio::test]
    async fn turns_are_serialized() {
        let h = harness(
            ScriptedProvider::new(&["ok"], Ending::Done),
            AffinityState::new(1, 0),
        );

        let pending = h.orchestrator.begin(text_request("first")).await.unwrap();

        let orchestrator = h.orchestrator.clone();
        let second = tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel(64);
            orchestrator
                .run(text_request("second"), tx, CancellationToken::new())
                .await
                .unwrap()
        });

        // the second turn cannot persist while the first holds the lock
        tokio::task::yield_now().await;
        assert_eq!(h.store.turns().await.len(), 1);

        let (tx, _rx) = mpsc::channel(64);
        pending.stream(tx, CancellationToken::new()).await;
        second.await.unwrap();

        let roles: Vec<Role> = h.store.turns().await.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Companion, Role::User, Role::Companion]
        );
        assert_eq!(h.store.load().await.unwrap(), AffinityState::new(1, 20));
    }

    #[tokio::test]
    async fn reply_persist_failure_is_reported_not_fatal() {
        let h = harness(
            ScriptedProvider::new(&["hi"], Ending::Done),
            AffinityState::new(1, 0),
        );
        let mut bus_rx = h.bus.subscribe();

        let pending = h.orchestrator.begin(text_request("hello")).await.unwrap();
        h.store.set_fail_writes(true);

        let (tx, mut rx) = mpsc::channel(64);
        let outcome = pending.stream(tx, CancellationToken::new()).await;

        assert_eq!(rx.recv().await.unwrap(), ChatEvent::chunk("hi"));
        assert_eq!(rx.recv().await.unwrap(), ChatEvent::done());
        assert!(matches!(
            outcome,
            TurnOutcome::Completed {
                reply_turn_id: None,
                affinity: None,
                ..
            }
        ));

        let _received = bus_rx.recv().await.unwrap();
        let failed = bus_rx.recv().await.unwrap();
        assert_eq!(failed.event_type(), "commit_failed");
    }

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("short"), "short");
        let long = "あ".repeat(100);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 81);
        assert!(p.ends_with('…'));
    }
}
