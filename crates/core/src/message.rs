//! Turn and user-input domain types.
//!
//! A [`Turn`] is one persisted message in the single dialogue log. A
//! [`UserInput`] is what the caller hands over for a new turn: text plus
//! zero or more inline attachments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic identifier assigned by the history store on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub i64);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who authored a turn.
///
/// The companion is persisted as `"luna"`; providers map it to their own
/// assistant role name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "luna")]
    Companion,
}

impl Role {
    /// The name stored in the `role` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Companion => "luna",
        }
    }

    /// Parse a stored role name. Anything that is not `user` was written
    /// by the companion.
    pub fn from_stored(s: &str) -> Self {
        if s == "user" { Role::User } else { Role::Companion }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single persisted message in the dialogue log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Soft classification flag; memo turns survive a bulk clear.
    #[serde(default)]
    pub is_memo: bool,
}

/// An inline binary attachment (an image) sent with a user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// The new multimodal input for a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInput {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl UserInput {
    /// Text-only input.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}
