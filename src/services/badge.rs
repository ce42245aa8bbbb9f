//! Student unread badge, shown while the chat itself is closed.
//!
//! DESIGN
//! ======
//! The badge never creates a conversation: a student who has not written yet
//! simply has no badge source and stays at zero. Otherwise it follows the
//! conversation's change events and republishes `unread_user`.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::model::ConversationId;
use crate::store::{Backend, ChannelEvent};
use crate::sync::SyncError;

pub struct UnreadBadge {
    conversation_id: Option<ConversationId>,
    unread: watch::Receiver<i32>,
    task: Option<JoinHandle<()>>,
}

impl UnreadBadge {
    /// Start watching the signed-in student's conversation.
    ///
    /// # Errors
    ///
    /// `Auth` without a signed-in user, or the store error from the lookup
    /// or subscribe.
    pub async fn start(backend: &Backend) -> Result<Self, SyncError> {
        let user_id = backend.identity.current_user_id().ok_or(SyncError::Auth)?;
        let Some(conversation) = backend.conversations.find_for_user(user_id).await? else {
            debug!(%user_id, "no support conversation yet; badge stays empty");
            let (_tx, unread) = watch::channel(0);
            return Ok(Self { conversation_id: None, unread, task: None });
        };

        let conversation_id = conversation.id;
        let (tx, unread) = watch::channel(conversation.unread_user);
        let mut subscription = backend.realtime.subscribe(conversation_id).await?;
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                match event {
                    ChannelEvent::ConversationChanged(changed) if changed.id == conversation_id => {
                        tx.send_replace(changed.unread_user);
                    }
                    ChannelEvent::Disconnected(reason) => {
                        debug!(%conversation_id, %reason, "badge subscription ended");
                        break;
                    }
                    _ => {}
                }
            }
        });
        info!(%conversation_id, unread = conversation.unread_user, "unread badge started");
        Ok(Self { conversation_id: Some(conversation_id), unread, task: Some(task) })
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    #[must_use]
    pub fn current(&self) -> i32 {
        *self.unread.borrow()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<i32> {
        self.unread.clone()
    }
}

impl Drop for UnreadBadge {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "badge_test.rs"]
mod tests;
