//! Chat synchronizer: one consistent timeline per open conversation.
//!
//! SYSTEM CONTEXT
//! ==============
//! A student or admin view talks to a `ChatSync` handle. The handle forwards
//! intents to a background engine task (see `engine`) and exposes the
//! resulting state as a `watch` stream of `ChatView`s.
//!
//! Messages reach a viewer through three paths that overlap: the history
//! fetch on open, peer broadcasts, and persisted-row notifications. The
//! timeline de-duplicates by message id, so each message is shown once
//! whichever paths deliver it.

mod engine;
pub mod timeline;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

use crate::config::SyncConfig;
use crate::frame::ErrorCode;
use crate::model::{Conversation, ConversationId, Message, Role, UiMessage};
use crate::store::{Backend, StoreError};
use engine::{Command, Engine, Inbox};

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("not signed in")]
    Auth,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("no conversation is open")]
    NotOpen,
    #[error("conversation is closed to new replies")]
    ConversationClosed,
    #[error("synchronizer stopped")]
    Stopped,
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E_VALIDATION",
            Self::Auth => "E_AUTH",
            Self::Store(e) => e.error_code(),
            Self::Permission(_) => "E_PERMISSION",
            Self::NotOpen => "E_NOT_OPEN",
            Self::ConversationClosed => "E_CONVERSATION_CLOSED",
            Self::Stopped => "E_STOPPED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// VIEW
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadStatus {
    /// Nothing open.
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
}

/// Everything a chat screen renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatView {
    pub conversation_id: Option<ConversationId>,
    pub conversation: Option<Conversation>,
    /// De-duplicated, ordered by (timestamp, arrival).
    pub messages: Vec<UiMessage>,
    /// Unread count for the viewing role.
    pub unread: i32,
    pub status: LoadStatus,
    /// Dismissible user-facing error.
    pub error: Option<String>,
    pub channel_ready: bool,
}

/// Proof of an open conversation. `close` consumes it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an open conversation should be closed with ChatSync::close"]
pub struct ConversationHandle {
    pub(crate) conversation_id: ConversationId,
    pub(crate) token: u64,
}

impl ConversationHandle {
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable front end of one synchronizer. The engine task stops once the
/// last clone is dropped.
#[derive(Clone)]
pub struct ChatSync {
    inbox: mpsc::Sender<Inbox>,
    view: watch::Receiver<ChatView>,
    backend: Backend,
    role: Role,
}

impl ChatSync {
    /// Start a synchronizer for a viewer with the given role. Must be called
    /// inside a tokio runtime.
    #[must_use]
    pub fn spawn(backend: Backend, role: Role, config: SyncConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(ChatView::default());
        let engine = Engine::new(backend.clone(), role, config, tx.downgrade(), view_tx);
        tokio::spawn(engine.run(rx));
        Self { inbox: tx, view: view_rx, backend, role }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Live view state. Every handled event publishes a fresh `ChatView`.
    #[must_use]
    pub fn view(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    async fn command(&self, command: Command) -> Result<(), SyncError> {
        self.inbox.send(Inbox::Command(command)).await.map_err(|_| SyncError::Stopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command(make(reply)).await?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Open a conversation, replacing whatever was open. History, the
    /// realtime subscription and the read receipt load in the background;
    /// the view reports `Loading` until history arrives.
    ///
    /// Students may only open their own conversation; the row is checked
    /// before anything is fetched or subscribed.
    ///
    /// # Errors
    ///
    /// For students: `Auth` without a signed-in user, `Permission` for
    /// another student's conversation, or the store error from the lookup.
    /// `Stopped` if the engine task is gone.
    pub async fn open(&self, conversation_id: ConversationId) -> Result<ConversationHandle, SyncError> {
        if self.role == Role::Student {
            let user_id = self.backend.identity.current_user_id().ok_or(SyncError::Auth)?;
            let conversation = self.backend.conversations.get(conversation_id).await?;
            if conversation.user_id != user_id {
                warn!(%conversation_id, %user_id, "student tried to open another student's conversation");
                return Err(SyncError::Permission("students can only open their own conversation".into()));
            }
        }
        self.start(conversation_id).await
    }

    async fn start(&self, conversation_id: ConversationId) -> Result<ConversationHandle, SyncError> {
        self.request(|reply| Command::Open { conversation_id, reply }).await
    }

    /// Open the current student's own conversation, creating it on first use.
    ///
    /// # Errors
    ///
    /// `Auth` without a signed-in user, `Permission` for admins, or the
    /// store error from the lookup.
    pub async fn open_own(&self) -> Result<ConversationHandle, SyncError> {
        if self.role != Role::Student {
            return Err(SyncError::Permission("only students own a support conversation".into()));
        }
        let user_id = self.backend.identity.current_user_id().ok_or(SyncError::Auth)?;
        let conversation = self.backend.conversations.get_or_create(user_id).await?;
        self.start(conversation.id).await
    }

    /// Release the subscription and drop queued broadcasts. Closing a handle
    /// that was already replaced by a later `open` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the engine task is gone.
    pub async fn close(&self, handle: ConversationHandle) -> Result<(), SyncError> {
        self.request(|reply| Command::Close { handle, reply }).await
    }

    /// Send a message. The sender sees it immediately as optimistic; this
    /// resolves once the store has accepted or rejected it.
    ///
    /// # Errors
    ///
    /// `Validation`, `Auth`, `NotOpen`, `ConversationClosed`, or `Store`
    /// when persisting failed (the optimistic entry is rolled back).
    pub async fn send(&self, body: impl Into<String>) -> Result<Message, SyncError> {
        let body = body.into();
        self.request(|reply| Command::Send { body, reply }).await?
    }

    /// Best-effort read receipt for the viewing role.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the engine task is gone.
    pub async fn mark_read(&self) -> Result<(), SyncError> {
        self.command(Command::MarkRead).await
    }

    /// Delete every message of the open conversation. Irreversible: callers
    /// must confirm with the user first.
    ///
    /// # Errors
    ///
    /// `Permission` for students, `Auth`, `NotOpen`, or `Store`.
    pub async fn clear(&self, delete_conversation: bool) -> Result<(), SyncError> {
        self.request(|reply| Command::Clear { delete_conversation, reply }).await?
    }

    /// Lock or unlock student replies on the open conversation.
    ///
    /// # Errors
    ///
    /// `Permission` for students, `Auth`, `NotOpen`, or `Store`.
    pub async fn set_closed(&self, closed: bool) -> Result<(), SyncError> {
        self.request(|reply| Command::SetClosed { closed, reply }).await?
    }

    /// # Errors
    ///
    /// Returns `Stopped` if the engine task is gone.
    pub async fn dismiss_error(&self) -> Result<(), SyncError> {
        self.command(Command::DismissError).await
    }

    /// Resolves after every intent sent before it has been handled.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the engine task is gone.
    pub async fn barrier(&self) -> Result<(), SyncError> {
        self.request(Command::Barrier).await
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
