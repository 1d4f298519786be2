//! Relationship statistics for reporting.

use lunavilla_core::affinity::AffinityState;
use lunavilla_core::error::StoreError;
use lunavilla_core::message::Role;
use lunavilla_core::store::HistoryStore;
use serde::{Deserialize, Serialize};

use crate::tracker::AffinityTracker;

/// Heading shown next to the rank in clients.
pub const RANK_HEADING: &str = "Affinity rank";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub luna_messages: usize,
    pub affinity: AffinitySummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinitySummary {
    pub level: i64,
    pub exp: i64,
    /// Rank name for the current level
    pub rank: String,
    pub label: String,
}

impl From<AffinityState> for AffinitySummary {
    fn from(state: AffinityState) -> Self {
        Self {
            level: state.level,
            exp: state.experience,
            rank: state.rank().label().to_string(),
            label: RANK_HEADING.to_string(),
        }
    }
}

/// Gather message counts and the affinity summary.
pub async fn collect(
    history: &dyn HistoryStore,
    tracker: &AffinityTracker,
) -> Result<ChatStats, StoreError> {
    let user_messages = history.count(Role::User).await?;
    let luna_messages = history.count(Role::Companion).await?;
    let affinity = tracker.read().await?;

    Ok(ChatStats {
        total_messages: user_messages + luna_messages,
        user_messages,
        luna_messages,
        affinity: affinity.into(),
    })
}
