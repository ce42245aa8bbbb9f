//! Support-chat data model.
//!
//! DESIGN
//! ======
//! `Conversation` and `Message` mirror the `support_conversations` and
//! `support_messages` tables. Timestamps are milliseconds since the Unix
//! epoch on both sides of the store boundary.
//!
//! Message ids are generated here, client-side, at creation time. An
//! optimistic entry and its persisted copy therefore share one identity,
//! which is what lets the timeline reconcile them by id instead of content.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ConversationId = Uuid;
pub type MessageId = Uuid;
pub type UserId = Uuid;

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// ROLE
// =============================================================================

/// Which side of a support conversation a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Admin => "admin",
        }
    }

    /// Parse the stored `sender_role` / `profiles.role` text. Case-sensitive.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "student" => Some(Self::Student),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// The other party of a conversation.
    #[must_use]
    pub fn counterpart(self) -> Self {
        match self {
            Self::Student => Self::Admin,
            Self::Admin => Self::Student,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CONVERSATION
// =============================================================================

/// One support thread per student. Mirrors the `support_conversations` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Owning student.
    pub user_id: UserId,
    pub updated_at: i64,
    pub last_message_at: Option<i64>,
    pub last_message_body: Option<String>,
    /// Messages the admin side has not read yet.
    pub unread_admin: i32,
    /// Messages the student has not read yet.
    pub unread_user: i32,
    pub admin_last_read_at: Option<i64>,
    pub user_last_read_at: Option<i64>,
    /// Set by an admin to lock further student replies.
    pub is_closed: bool,
}

impl Conversation {
    /// A fresh, empty conversation owned by `user_id`.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            updated_at: now_ms(),
            last_message_at: None,
            last_message_body: None,
            unread_admin: 0,
            unread_user: 0,
            admin_last_read_at: None,
            user_last_read_at: None,
            is_closed: false,
        }
    }

    /// Unread counter as seen by `role`.
    #[must_use]
    pub fn unread_for(&self, role: Role) -> i32 {
        match role {
            Role::Admin => self.unread_admin,
            Role::Student => self.unread_user,
        }
    }

    /// Apply a typed field patch.
    pub fn apply(&mut self, update: &ConversationUpdate) {
        if let Some(n) = update.unread_admin {
            self.unread_admin = n;
        }
        if let Some(n) = update.unread_user {
            self.unread_user = n;
        }
        if let Some(ts) = update.admin_last_read_at {
            self.admin_last_read_at = Some(ts);
        }
        if let Some(ts) = update.user_last_read_at {
            self.user_last_read_at = Some(ts);
        }
        if let Some(closed) = update.is_closed {
            self.is_closed = closed;
        }
    }

    /// Store-side bookkeeping for a newly persisted message: refresh the
    /// preview and bump the counterpart's unread counter.
    pub fn record_message(&mut self, message: &Message) {
        self.updated_at = now_ms();
        self.last_message_at = Some(message.created_at);
        self.last_message_body = Some(message.body.clone());
        match message.sender_role {
            Role::Student => self.unread_admin = self.unread_admin.saturating_add(1),
            Role::Admin => self.unread_user = self.unread_user.saturating_add(1),
        }
    }

    /// Store-side bookkeeping after a bulk clear.
    pub fn reset_preview(&mut self) {
        self.updated_at = now_ms();
        self.last_message_at = None;
        self.last_message_body = None;
        self.unread_admin = 0;
        self.unread_user = 0;
    }
}

/// Typed patch for `ConversationStore::update`. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUpdate {
    pub unread_admin: Option<i32>,
    pub unread_user: Option<i32>,
    pub admin_last_read_at: Option<i64>,
    pub user_last_read_at: Option<i64>,
    pub is_closed: Option<bool>,
}

impl ConversationUpdate {
    /// Zero `role`'s unread counter and stamp its last-read time.
    #[must_use]
    pub fn mark_read(role: Role, at: i64) -> Self {
        match role {
            Role::Admin => Self { unread_admin: Some(0), admin_last_read_at: Some(at), ..Self::default() },
            Role::Student => Self { unread_user: Some(0), user_last_read_at: Some(at), ..Self::default() },
        }
    }

    #[must_use]
    pub fn closed(is_closed: bool) -> Self {
        Self { is_closed: Some(is_closed), ..Self::default() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A chat message. Append-only and immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_role: Role,
    pub body: String,
    pub created_at: i64,
}

impl Message {
    /// Build a new outgoing message with a client-generated id and timestamp.
    pub fn compose(conversation_id: ConversationId, sender_id: UserId, sender_role: Role, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            sender_role,
            body: body.into(),
            created_at: now_ms(),
        }
    }
}

/// A message as displayed. `optimistic` is true until persistence or
/// delivery is confirmed; it is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiMessage {
    #[serde(flatten)]
    pub message: Message,
    pub optimistic: bool,
}

impl UiMessage {
    #[must_use]
    pub fn optimistic(message: Message) -> Self {
        Self { message, optimistic: true }
    }

    #[must_use]
    pub fn confirmed(message: Message) -> Self {
        Self { message, optimistic: false }
    }

    #[must_use]
    pub fn id(&self) -> MessageId {
        self.message.id
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// A message with a fixed timestamp, for ordering tests.
    #[must_use]
    pub fn message_at(conversation_id: ConversationId, role: Role, body: &str, created_at: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            sender_role: role,
            body: body.to_owned(),
            created_at,
        }
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
