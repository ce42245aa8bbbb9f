//! Collaborator contracts consumed by the synchronizer.
//!
//! ARCHITECTURE
//! ============
//! The hosted backend (identity, conversation table, message table, realtime
//! channels) is an external collaborator. The synchronizer only sees these
//! traits, so it runs unchanged against the Postgres adapter in production
//! and the in-memory backend in tests.
//!
//! DESIGN
//! ======
//! Rows and realtime payloads are decoded into `Conversation` / `Message`
//! here, at the boundary. A subscription is one owned event stream; dropping
//! it unsubscribes.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::frame::{
    EVENT_CLEAR, EVENT_CONVERSATION_DELETE, EVENT_CONVERSATION_UPDATE, EVENT_MESSAGE, EVENT_MESSAGE_INSERT, ErrorCode,
    Frame, FrameError,
};
use crate::model::{Conversation, ConversationId, ConversationUpdate, Message, UserId};

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("realtime frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("realtime channel closed")]
    ChannelClosed,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::ConversationNotFound(_) => "E_CONVERSATION_NOT_FOUND",
            Self::InvalidRow(_) => "E_INVALID_ROW",
            Self::Frame(_) => "E_FRAME",
            Self::ChannelClosed => "E_CHANNEL_CLOSED",
            Self::Unavailable(_) => "E_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::ChannelClosed | Self::Unavailable(_))
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;
}

/// Identity fixed at construction (CLI flag, test fixture).
#[derive(Debug, Clone, Copy)]
pub struct StaticIdentity(pub Option<UserId>);

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        self.0
    }
}

// =============================================================================
// CONVERSATIONS
// =============================================================================

/// Admin list filter. Matching is case-insensitive over student name,
/// student code and the last-message preview.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub search: Option<String>,
}

impl ConversationFilter {
    #[must_use]
    pub fn search(query: impl Into<String>) -> Self {
        Self { search: Some(query.into()) }
    }

    /// Trimmed, lowercased query; `None` when the filter matches everything.
    #[must_use]
    pub fn needle(&self) -> Option<String> {
        let q = self.search.as_deref()?.trim().to_lowercase();
        if q.is_empty() { None } else { Some(q) }
    }

    #[must_use]
    pub fn matches(&self, summary: &ConversationSummary) -> bool {
        let Some(needle) = self.needle() else {
            return true;
        };
        let hit = |field: Option<&str>| field.is_some_and(|f| f.to_lowercase().contains(&needle));
        hit(summary.student_name.as_deref())
            || hit(summary.student_code.as_deref())
            || hit(summary.conversation.last_message_body.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    #[must_use]
    pub fn first(limit: i64) -> Self {
        Self { limit, offset: 0 }
    }
}

/// A conversation row joined with the owning student's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub student_name: Option<String>,
    pub student_code: Option<String>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The student's conversation, created on first use.
    async fn get_or_create(&self, user_id: UserId) -> Result<Conversation, StoreError>;

    async fn get(&self, conversation_id: ConversationId) -> Result<Conversation, StoreError>;

    /// The student's conversation if one exists. Never creates.
    async fn find_for_user(&self, user_id: UserId) -> Result<Option<Conversation>, StoreError>;

    async fn update(&self, conversation_id: ConversationId, update: &ConversationUpdate) -> Result<(), StoreError>;

    /// All conversations, most recently updated first.
    async fn list_for_admin(
        &self,
        filter: &ConversationFilter,
        page: Page,
    ) -> Result<Vec<ConversationSummary>, StoreError>;
}

// =============================================================================
// MESSAGES
// =============================================================================

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message under its client-generated id. The store also
    /// refreshes the conversation preview and bumps the counterpart's unread
    /// counter.
    async fn append(&self, message: &Message) -> Result<(), StoreError>;

    /// The most recent `limit` messages, returned oldest first.
    async fn list_recent(&self, conversation_id: ConversationId, limit: i64) -> Result<Vec<Message>, StoreError>;

    /// Remove every message of the conversation, and the row itself when
    /// `delete_conversation` is set.
    async fn delete_all(&self, conversation_id: ConversationId, delete_conversation: bool) -> Result<(), StoreError>;
}

// =============================================================================
// REALTIME
// =============================================================================

/// Ephemeral application-level event pushed to live viewers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    Message(Message),
    Clear { conversation_id: ConversationId },
}

impl Broadcast {
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Message(m) => m.conversation_id,
            Self::Clear { conversation_id } => *conversation_id,
        }
    }

    /// Wire envelope for this broadcast.
    ///
    /// # Errors
    ///
    /// Returns an error if the message fails to serialize.
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        match self {
            Self::Message(m) => {
                Ok(Frame::with_payload(m.conversation_id, EVENT_MESSAGE, m)?.with_from(m.sender_id.to_string()))
            }
            Self::Clear { conversation_id } => Ok(Frame::new(*conversation_id, EVENT_CLEAR, crate::frame::Data::new())),
        }
    }
}

/// Everything a subscription can deliver, in one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Handshake completed; broadcasts sent from now on reach peers.
    Subscribed,
    Broadcast(Broadcast),
    /// A message row was durably written.
    MessageInserted(Message),
    ConversationChanged(Conversation),
    /// The underlying connection dropped after the handshake.
    Disconnected(String),
}

impl ChannelEvent {
    /// Decode a wire frame into a typed event.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown events or payloads that fail validation.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        match frame.event.as_str() {
            EVENT_MESSAGE => Ok(Self::Broadcast(Broadcast::Message(frame.payload()?))),
            EVENT_CLEAR => Ok(Self::Broadcast(Broadcast::Clear { conversation_id: frame.conversation_id })),
            EVENT_MESSAGE_INSERT => Ok(Self::MessageInserted(frame.payload()?)),
            EVENT_CONVERSATION_UPDATE => Ok(Self::ConversationChanged(frame.payload()?)),
            other => Err(FrameError::UnknownEvent(other.to_owned())),
        }
    }
}

/// An owned realtime subscription for one conversation.
#[derive(Debug)]
pub struct Subscription {
    pub conversation_id: ConversationId,
    events: mpsc::Receiver<ChannelEvent>,
}

impl Subscription {
    #[must_use]
    pub fn new(conversation_id: ConversationId, events: mpsc::Receiver<ChannelEvent>) -> Self {
        Self { conversation_id, events }
    }

    /// Next event; `None` once the backend side has gone away.
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

/// Row-level events on the admin-wide conversation feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Subscribed,
    /// A conversation was created or changed.
    Changed(Conversation),
    Removed(ConversationId),
    Disconnected(String),
}

impl FeedEvent {
    /// Decode a conversation-row frame.
    ///
    /// # Errors
    ///
    /// Returns an error for events that are not conversation-row changes.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        match frame.event.as_str() {
            EVENT_CONVERSATION_UPDATE => Ok(Self::Changed(frame.payload()?)),
            EVENT_CONVERSATION_DELETE => Ok(Self::Removed(frame.conversation_id)),
            other => Err(FrameError::UnknownEvent(other.to_owned())),
        }
    }
}

/// An owned subscription to every conversation's row changes.
#[derive(Debug)]
pub struct ConversationFeed {
    events: mpsc::Receiver<FeedEvent>,
}

impl ConversationFeed {
    #[must_use]
    pub fn new(events: mpsc::Receiver<FeedEvent>) -> Self {
        Self { events }
    }

    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait Realtime: Send + Sync {
    /// Start a subscription. `ChannelEvent::Subscribed` arrives on the
    /// returned stream once the handshake completes.
    async fn subscribe(&self, conversation_id: ConversationId) -> Result<Subscription, StoreError>;

    /// Follow creates, updates and deletes of every conversation row.
    /// `FeedEvent::Subscribed` arrives once the handshake completes.
    async fn subscribe_conversations(&self) -> Result<ConversationFeed, StoreError>;

    async fn broadcast(&self, event: &Broadcast) -> Result<(), StoreError>;
}

// =============================================================================
// BACKEND BUNDLE
// =============================================================================

/// All collaborators the synchronizer needs, behind shared trait objects.
#[derive(Clone)]
pub struct Backend {
    pub identity: Arc<dyn IdentityProvider>,
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
    pub realtime: Arc<dyn Realtime>,
}

impl Backend {
    /// Bundle a single object that implements every store contract.
    pub fn from_shared<B>(identity: Arc<dyn IdentityProvider>, backend: Arc<B>) -> Self
    where
        B: ConversationStore + MessageStore + Realtime + 'static,
    {
        Self { identity, conversations: backend.clone(), messages: backend.clone(), realtime: backend }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
