//! The chat turn pipeline — the heart of Luna Villa.
//!
//! Every turn follows the same sequence:
//!
//! 1. **Persist** the user's message
//! 2. **Build context** (persona + time of day + affinity + sentiment)
//! 3. **Generate** the reply via the configured provider, relaying fragments
//!    to the caller as they arrive
//! 4. **Commit** the companion's reply and advance affinity
//!
//! Only one turn runs at a time; later turns queue behind it.

pub mod context;
pub mod orchestrator;
pub mod request;
pub mod stats;
pub mod stream_event;
pub mod tracker;

pub use context::{compose, load_persona, Bond, TimeOfDay};
pub use orchestrator::{OrchestratorSettings, PendingTurn, TurnOrchestrator, TurnOutcome, TurnState};
pub use request::{decode_image, TurnRequest};
pub use stats::{ChatStats, AffinitySummary};
pub use stream_event::ChatEvent;
pub use tracker::AffinityTracker;
