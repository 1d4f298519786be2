//! # Luna Villa Core
//!
//! Domain types, traits, and error definitions for the Luna Villa companion
//! backend. This crate has **zero framework dependencies**: it defines the
//! domain model that every other crate implements against.
//!
//! ## Layout
//!
//! - [`message`] — turns in the dialogue log and the multimodal user input
//! - [`affinity`] — the level/experience progression and sentiment tagging
//! - [`provider`] — the generation capability, consumed as a chunk stream
//! - [`store`] — persistence traits for the history log and affinity singleton
//! - [`event`] — broadcast domain events for observers

pub mod affinity;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use affinity::{AffinityState, AffinityUpdate, Rank, Sentiment};
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use message::{Attachment, Role, Turn, TurnId, UserInput};
pub use provider::{GenerationRequest, HistoryMessage, Provider, StreamChunk};
pub use store::{AffinityStore, HistoryStore};
