//! Persistence traits — the dialogue log and the affinity singleton.
//!
//! Both must survive process restarts. Implementations: SQLite (production)
//! and in-memory (tests, ephemeral sessions).

use async_trait::async_trait;

use crate::affinity::AffinityState;
use crate::error::StoreError;
use crate::message::{Role, Turn, TurnId};

/// Append-only ordered log of turns.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Append a turn and return its freshly assigned id.
    async fn append(&self, role: Role, content: &str) -> Result<TurnId, StoreError>;

    /// Up to `limit` turns with an id strictly below `before`, oldest first.
    async fn recent(&self, before: TurnId, limit: usize) -> Result<Vec<Turn>, StoreError>;

    /// Number of turns authored by `role`.
    async fn count(&self, role: Role) -> Result<usize, StoreError>;

    /// Bulk-delete every turn not flagged as a memo. Returns the number removed.
    async fn clear(&self) -> Result<u64, StoreError>;
}

/// The persisted affinity singleton.
#[async_trait]
pub trait AffinityStore: Send + Sync {
    /// Current state; the initial state when nothing was written yet.
    async fn load(&self) -> Result<AffinityState, StoreError>;

    /// Overwrite both fields atomically.
    async fn save(&self, state: AffinityState) -> Result<(), StoreError>;
}
