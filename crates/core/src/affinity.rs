//! Affinity progression — the level/experience state machine.
//!
//! Every completed turn moves the singleton [`AffinityState`] exactly once:
//! a friendly turn earns experience and may roll over into a new level, a
//! hostile turn costs a level and wipes experience. The transition is a pure
//! function so callers can project the outcome before anything is written.

use serde::{Deserialize, Serialize};

/// Experience granted by one non-hostile turn.
pub const EXPERIENCE_PER_TURN: i64 = 10;

/// Experience needed to roll over into the next level.
pub const EXPERIENCE_PER_LEVEL: i64 = 100;

/// Levels per rank bucket.
pub const LEVELS_PER_RANK: i64 = 10;

/// Terms that tag a message as hostile when contained anywhere in it.
pub const DEFAULT_HOSTILE_TERMS: &[&str] = &[
    "ばか", "バカ", "嫌い", "きらい", "死ね", "きえろ", "消えろ", "ブス", "デブ", "くず", "クズ",
    "idiot", "stupid", "i hate you", "shut up", "go away", "disappear", "ugly", "loser",
];

/// Binary sentiment tag for an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Friendly,
    Hostile,
}

impl Sentiment {
    /// Case-insensitive containment test against `hostile_terms`.
    pub fn classify<S: AsRef<str>>(message: &str, hostile_terms: &[S]) -> Self {
        let haystack = message.to_lowercase();
        let hostile = hostile_terms
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty())
            .any(|t| haystack.contains(&t.to_lowercase()));

        if hostile {
            Sentiment::Hostile
        } else {
            Sentiment::Friendly
        }
    }

    pub fn is_hostile(&self) -> bool {
        matches!(self, Sentiment::Hostile)
    }
}

/// The persisted affinity singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffinityState {
    pub level: i64,
    pub experience: i64,
}

impl Default for AffinityState {
    fn default() -> Self {
        Self {
            level: 1,
            experience: 0,
        }
    }
}

/// Outcome of applying one turn's sentiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityUpdate {
    pub previous: AffinityState,
    pub state: AffinityState,
    pub leveled_up: bool,
    pub penalized: bool,
}

impl AffinityState {
    pub fn new(level: i64, experience: i64) -> Self {
        Self { level, experience }
    }

    /// Apply one turn's sentiment. Does not touch storage.
    pub fn advance(self, sentiment: Sentiment) -> AffinityUpdate {
        match sentiment {
            Sentiment::Hostile => AffinityUpdate {
                previous: self,
                state: AffinityState {
                    level: (self.level - 1).max(1),
                    experience: 0,
                },
                leveled_up: false,
                penalized: true,
            },
            Sentiment::Friendly => {
                let experience = self.experience + EXPERIENCE_PER_TURN;
                let (state, leveled_up) = if experience >= EXPERIENCE_PER_LEVEL {
                    (
                        AffinityState {
                            level: self.level + 1,
                            experience: 0,
                        },
                        true,
                    )
                } else {
                    (
                        AffinityState {
                            level: self.level,
                            experience,
                        },
                        false,
                    )
                };
                AffinityUpdate {
                    previous: self,
                    state,
                    leveled_up,
                    penalized: false,
                }
            }
        }
    }

    /// Reporting label for the current level.
    pub fn rank(&self) -> Rank {
        Rank::for_level(self.level)
    }
}

/// Relationship rank, one per bucket of [`LEVELS_PER_RANK`] levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    Acquaintance,
    Friend,
    CloseFriend,
    BestFriend,
    Partner,
    DestinedPair,
    UltimateLove,
}

impl Rank {
    /// The ladder, lowest first.
    pub const LADDER: [Rank; 7] = [
        Rank::Acquaintance,
        Rank::Friend,
        Rank::CloseFriend,
        Rank::BestFriend,
        Rank::Partner,
        Rank::DestinedPair,
        Rank::UltimateLove,
    ];

    /// Bucket the level by [`LEVELS_PER_RANK`], clamped to the top rank.
    pub fn for_level(level: i64) -> Self {
        let idx = (level.max(0) / LEVELS_PER_RANK) as usize;
        Self::LADDER[idx.min(Self::LADDER.len() - 1)]
    }

    pub fn label(&self) -> &'static str {
        match self {
            Rank::Acquaintance => "Acquaintance",
            Rank::Friend => "Friend",
            Rank::CloseFriend => "Close Friend",
            Rank::BestFriend => "Best Friend♪",
            Rank::Partner => "Partner",
            Rank::DestinedPair => "Destined Pair♡",
            Rank::UltimateLove => "Ultimate Love♡",
        }
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
