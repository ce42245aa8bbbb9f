//! In-memory backend: conversation/message tables plus a realtime hub.
//!
//! DESIGN
//! ======
//! One `RwLock`-guarded state holds both tables and, per conversation, the
//! live subscriber senders. Writes publish the same notifications a hosted
//! backend would (`MessageInserted`, `ConversationChanged`, admin feed
//! events), so a synchronizer running against this backend sees dual
//! delivery exactly as in production.
//!
//! Fault switches (failing writes, held handshakes, forced disconnects) let
//! tests drive the failure paths without a network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use super::{
    Broadcast, ChannelEvent, ConversationFeed, ConversationFilter, ConversationStore, ConversationSummary, FeedEvent,
    MessageStore, Page, Realtime, StoreError, Subscription,
};
use crate::config::DEFAULT_CHANNEL_CAPACITY;
use crate::model::{Conversation, ConversationId, ConversationUpdate, Message, Role, UserId};

/// Student profile row, used for admin list joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub full_name: String,
    pub student_code: String,
    pub role: Role,
}

#[derive(Default)]
struct Faults {
    fail_appends: bool,
    fail_history: bool,
    fail_clears: bool,
    fail_updates: bool,
    hold_handshakes: bool,
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    profiles: HashMap<UserId, Profile>,
    /// Live subscribers per conversation.
    subscribers: HashMap<ConversationId, Vec<mpsc::Sender<ChannelEvent>>>,
    /// Subscribers whose handshake is being held back.
    held: HashMap<ConversationId, Vec<mpsc::Sender<ChannelEvent>>>,
    /// Admin-wide conversation feed subscribers.
    feeds: Vec<mpsc::Sender<FeedEvent>>,
    faults: Faults,
}

impl MemoryState {
    fn publish(&mut self, conversation_id: ConversationId, event: &ChannelEvent) {
        let Some(subs) = self.subscribers.get_mut(&conversation_id) else {
            return;
        };
        subs.retain(|tx| !tx.is_closed());
        for tx in subs.iter() {
            // Best-effort: a full subscriber queue drops the event.
            let _ = tx.try_send(event.clone());
        }
    }

    fn publish_feed(&mut self, event: &FeedEvent) {
        self.feeds.retain(|tx| !tx.is_closed());
        for tx in &self.feeds {
            let _ = tx.try_send(event.clone());
        }
    }

    /// Per-conversation change plus the admin feed copy.
    fn publish_changed(&mut self, conversation: &Conversation) {
        self.publish(conversation.id, &ChannelEvent::ConversationChanged(conversation.clone()));
        self.publish_feed(&FeedEvent::Changed(conversation.clone()));
    }
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    channel_capacity: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self { state: Arc::new(RwLock::new(MemoryState::default())), channel_capacity: channel_capacity.max(1) }
    }

    pub async fn seed_profile(&self, user_id: UserId, profile: Profile) {
        self.state.write().await.profiles.insert(user_id, profile);
    }

    pub async fn profile(&self, user_id: UserId) -> Option<Profile> {
        self.state.read().await.profiles.get(&user_id).cloned()
    }

    /// Snapshot of a conversation's stored messages, oldest first.
    pub async fn stored_messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.state
            .read()
            .await
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn stored_conversation(&self, conversation_id: ConversationId) -> Option<Conversation> {
        self.state.read().await.conversations.get(&conversation_id).cloned()
    }

    /// Number of subscribers still attached to a conversation channel.
    pub async fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        let state = self.state.read().await;
        let live = state
            .subscribers
            .get(&conversation_id)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count());
        let held = state
            .held
            .get(&conversation_id)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count());
        live + held
    }

    // -------------------------------------------------------------------------
    // Fault switches
    // -------------------------------------------------------------------------

    pub async fn set_fail_appends(&self, fail: bool) {
        self.state.write().await.faults.fail_appends = fail;
    }

    pub async fn set_fail_history(&self, fail: bool) {
        self.state.write().await.faults.fail_history = fail;
    }

    pub async fn set_fail_clears(&self, fail: bool) {
        self.state.write().await.faults.fail_clears = fail;
    }

    pub async fn set_fail_updates(&self, fail: bool) {
        self.state.write().await.faults.fail_updates = fail;
    }

    /// While set, new subscriptions wait for `release_handshakes`.
    pub async fn set_hold_handshakes(&self, hold: bool) {
        self.state.write().await.faults.hold_handshakes = hold;
    }

    /// Complete every held handshake for a conversation.
    pub async fn release_handshakes(&self, conversation_id: ConversationId) {
        let mut state = self.state.write().await;
        let Some(held) = state.held.remove(&conversation_id) else {
            return;
        };
        let subs = state.subscribers.entry(conversation_id).or_default();
        for tx in held {
            if tx.try_send(ChannelEvent::Subscribed).is_ok() {
                subs.push(tx);
            }
        }
    }

    /// Live admin feed subscribers.
    pub async fn feed_count(&self) -> usize {
        self.state.read().await.feeds.iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Drop every admin feed subscriber after telling it why.
    pub async fn disconnect_feeds(&self, reason: &str) {
        let mut state = self.state.write().await;
        for tx in std::mem::take(&mut state.feeds) {
            let _ = tx.try_send(FeedEvent::Disconnected(reason.to_owned()));
        }
    }

    /// Drop every subscriber of a conversation after telling it why.
    pub async fn disconnect(&self, conversation_id: ConversationId, reason: &str) {
        let mut state = self.state.write().await;
        let Some(subs) = state.subscribers.remove(&conversation_id) else {
            return;
        };
        for tx in subs {
            let _ = tx.try_send(ChannelEvent::Disconnected(reason.to_owned()));
        }
    }
}

// =============================================================================
// CONVERSATION STORE
// =============================================================================

#[async_trait]
impl ConversationStore for MemoryBackend {
    async fn get_or_create(&self, user_id: UserId) -> Result<Conversation, StoreError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.conversations.values().find(|c| c.user_id == user_id) {
            return Ok(existing.clone());
        }
        let created = Conversation::new(user_id);
        state.conversations.insert(created.id, created.clone());
        state.publish_feed(&FeedEvent::Changed(created.clone()));
        debug!(conversation_id = %created.id, %user_id, "memory: conversation created");
        Ok(created)
    }

    async fn get(&self, conversation_id: ConversationId) -> Result<Conversation, StoreError> {
        self.state
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(StoreError::ConversationNotFound(conversation_id))
    }

    async fn find_for_user(&self, user_id: UserId) -> Result<Option<Conversation>, StoreError> {
        let state = self.state.read().await;
        Ok(state.conversations.values().find(|c| c.user_id == user_id).cloned())
    }

    async fn update(&self, conversation_id: ConversationId, update: &ConversationUpdate) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.faults.fail_updates {
            return Err(StoreError::Unavailable("conversation update rejected".into()));
        }
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        conversation.apply(update);
        let changed = conversation.clone();
        state.publish_changed(&changed);
        Ok(())
    }

    async fn list_for_admin(
        &self,
        filter: &ConversationFilter,
        page: Page,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let state = self.state.read().await;
        let mut rows = state
            .conversations
            .values()
            .map(|c| {
                let profile = state.profiles.get(&c.user_id);
                ConversationSummary {
                    conversation: c.clone(),
                    student_name: profile.map(|p| p.full_name.clone()),
                    student_code: profile.map(|p| p.student_code.clone()),
                }
            })
            .filter(|s| filter.matches(s))
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.conversation.updated_at.cmp(&a.conversation.updated_at));

        let offset = usize::try_from(page.offset).unwrap_or(0);
        let limit = usize::try_from(page.limit).unwrap_or(0);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }
}

// =============================================================================
// MESSAGE STORE
// =============================================================================

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn append(&self, message: &Message) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.faults.fail_appends {
            return Err(StoreError::Unavailable("message insert rejected".into()));
        }
        if !state.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::ConversationNotFound(message.conversation_id));
        }

        let rows = state.messages.entry(message.conversation_id).or_default();
        if rows.iter().any(|m| m.id == message.id) {
            return Err(StoreError::InvalidRow(format!("duplicate message id {}", message.id)));
        }
        rows.push(message.clone());

        let Some(conversation) = state.conversations.get_mut(&message.conversation_id) else {
            return Err(StoreError::ConversationNotFound(message.conversation_id));
        };
        conversation.record_message(message);
        let changed = conversation.clone();

        state.publish(message.conversation_id, &ChannelEvent::MessageInserted(message.clone()));
        state.publish_changed(&changed);
        Ok(())
    }

    async fn list_recent(&self, conversation_id: ConversationId, limit: i64) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        if state.faults.fail_history {
            return Err(StoreError::Unavailable("message history unavailable".into()));
        }
        let mut rows = state.messages.get(&conversation_id).cloned().unwrap_or_default();
        // Stable sort keeps insertion order for equal timestamps.
        rows.sort_by_key(|m| m.created_at);
        let keep = usize::try_from(limit).unwrap_or(0);
        let skip = rows.len().saturating_sub(keep);
        Ok(rows.split_off(skip))
    }

    async fn delete_all(&self, conversation_id: ConversationId, delete_conversation: bool) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.faults.fail_clears {
            return Err(StoreError::Unavailable("clear rejected".into()));
        }
        state.messages.remove(&conversation_id);
        if delete_conversation {
            if state.conversations.remove(&conversation_id).is_some() {
                state.publish_feed(&FeedEvent::Removed(conversation_id));
            }
            return Ok(());
        }
        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.reset_preview();
            let changed = conversation.clone();
            state.publish_changed(&changed);
        }
        Ok(())
    }
}

// =============================================================================
// REALTIME
// =============================================================================

#[async_trait]
impl Realtime for MemoryBackend {
    async fn subscribe(&self, conversation_id: ConversationId) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let mut state = self.state.write().await;
        if state.faults.hold_handshakes {
            state.held.entry(conversation_id).or_default().push(tx);
        } else {
            tx.try_send(ChannelEvent::Subscribed)
                .map_err(|_| StoreError::ChannelClosed)?;
            state.subscribers.entry(conversation_id).or_default().push(tx);
        }
        Ok(Subscription::new(conversation_id, rx))
    }

    async fn subscribe_conversations(&self) -> Result<ConversationFeed, StoreError> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        tx.try_send(FeedEvent::Subscribed).map_err(|_| StoreError::ChannelClosed)?;
        self.state.write().await.feeds.push(tx);
        Ok(ConversationFeed::new(rx))
    }

    async fn broadcast(&self, event: &Broadcast) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.publish(event.conversation_id(), &ChannelEvent::Broadcast(event.clone()));
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
