//! Affinity tracker — the single writer of the affinity singleton.

use std::sync::Arc;

use lunavilla_core::affinity::{AffinityState, AffinityUpdate, Sentiment};
use lunavilla_core::error::StoreError;
use lunavilla_core::store::AffinityStore;
use tracing::info;

/// Reads and advances the persisted [`AffinityState`].
///
/// A turn reads the state once when it builds context and hands that same
/// snapshot to `apply`, which writes the successor once. Callers serialize
/// turns (the orchestrator holds its turn lock across the whole turn), so
/// the snapshot is still current when it is written back.
#[derive(Clone)]
pub struct AffinityTracker {
    store: Arc<dyn AffinityStore>,
}

impl AffinityTracker {
    pub fn new(store: Arc<dyn AffinityStore>) -> Self {
        Self { store }
    }

    pub async fn read(&self) -> Result<AffinityState, StoreError> {
        self.store.load().await
    }

    /// Advance `snapshot` by one completed turn's sentiment and persist it.
    pub async fn apply(
        &self,
        snapshot: AffinityState,
        sentiment: Sentiment,
    ) -> Result<AffinityUpdate, StoreError> {
        let update = snapshot.advance(sentiment);
        self.store.save(update.state).await?;

        info!(
            level = update.state.level,
            exp = update.state.experience,
            leveled_up = update.leveled_up,
            penalized = update.penalized,
            "Affinity updated"
        );

        Ok(update)
    }
}
