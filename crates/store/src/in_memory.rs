//! In-memory store — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chrono::Utc;
use lunavilla_core::affinity::AffinityState;
use lunavilla_core::error::StoreError;
use lunavilla_core::message::{Role, Turn, TurnId};
use lunavilla_core::store::{AffinityStore, HistoryStore};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::RwLock;

/// Keeps the turn log in a Vec and the affinity singleton in a cell.
///
/// `fail_writes` makes every write return `StoreError::Unavailable`, which
/// lets tests drive the store-failure paths.
pub struct InMemoryStore {
    turns: RwLock<Vec<Turn>>,
    affinity: RwLock<AffinityState>,
    /// Next turn id; never rewound, so ids stay unique across `clear`.
    next_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            turns: RwLock::new(Vec::new()),
            affinity: RwLock::new(AffinityState::default()),
            next_id: AtomicI64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Start from a given affinity state.
    pub fn with_affinity(state: AffinityState) -> Self {
        Self {
            affinity: RwLock::new(state),
            ..Self::new()
        }
    }

    /// Toggle simulated write failures.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of every stored turn, oldest first.
    pub async fn turns(&self) -> Vec<Turn> {
        self.turns.read().await.clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store set to fail".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(&self, role: Role, content: &str) -> Result<TurnId, StoreError> {
        self.check_writable()?;
        let mut turns = self.turns.write().await;
        let id = TurnId(self.next_id.fetch_add(1, Ordering::SeqCst));
        turns.push(Turn {
            id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            is_memo: false,
        });
        Ok(id)
    }

    async fn recent(&self, before: TurnId, limit: usize) -> Result<Vec<Turn>, StoreError> {
        let turns = self.turns.read().await;
        let older: Vec<&Turn> = turns.iter().filter(|t| t.id < before).collect();
        let skip = older.len().saturating_sub(limit);
        Ok(older.into_iter().skip(skip).cloned().collect())
    }

    async fn count(&self, role: Role) -> Result<usize, StoreError> {
        Ok(self.turns.read().await.iter().filter(|t| t.role == role).count())
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut turns = self.turns.write().await;
        let before = turns.len();
        turns.retain(|t| t.is_memo);
        Ok((before - turns.len()) as u64)
    }
}

#[async_trait]
impl AffinityStore for InMemoryStore {
    async fn load(&self) -> Result<AffinityState, StoreError> {
        Ok(*self.affinity.read().await)
    }

    async fn save(&self, state: AffinityState) -> Result<(), StoreError> {
        self.check_writable()?;
        *self.affinity.write().await = state;
        Ok(())
    }
}
