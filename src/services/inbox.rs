//! Admin inbox: conversation list with student profile details.
//!
//! `follow` keeps a listing live: it re-lists on every conversation-row
//! change from the admin-wide feed and publishes the result through a
//! `watch` channel.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{ConversationFilter, ConversationStore, ConversationSummary, FeedEvent, Page, Realtime, StoreError};

#[derive(Clone)]
pub struct AdminInbox {
    conversations: Arc<dyn ConversationStore>,
    page_size: i64,
}

impl AdminInbox {
    #[must_use]
    pub fn new(conversations: Arc<dyn ConversationStore>, page_size: i64) -> Self {
        Self { conversations, page_size: page_size.max(1) }
    }

    /// First page of conversations, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns the store error if the listing fails.
    pub async fn list(&self, filter: &ConversationFilter) -> Result<Vec<ConversationSummary>, StoreError> {
        self.page(filter, 0).await
    }

    /// Page `index` (zero-based) of the filtered listing.
    ///
    /// # Errors
    ///
    /// Returns the store error if the listing fails.
    pub async fn page(&self, filter: &ConversationFilter, index: i64) -> Result<Vec<ConversationSummary>, StoreError> {
        let page = Page { limit: self.page_size, offset: index.max(0).saturating_mul(self.page_size) };
        let rows = self.conversations.list_for_admin(filter, page).await?;
        debug!(count = rows.len(), search = ?filter.needle(), "admin inbox listed");
        Ok(rows)
    }

    /// Follow the first page of `filter` live. The feed handshake completes
    /// before the initial listing, so no change in between is missed.
    ///
    /// # Errors
    ///
    /// Returns the store error if the subscribe, the handshake or the
    /// initial listing fails.
    pub async fn follow(&self, realtime: &dyn Realtime, filter: ConversationFilter) -> Result<LiveInbox, StoreError> {
        let mut feed = realtime.subscribe_conversations().await?;
        match feed.next().await {
            Some(FeedEvent::Disconnected(reason)) => return Err(StoreError::Unavailable(reason)),
            None => return Err(StoreError::ChannelClosed),
            Some(_) => {}
        }

        let initial = self.list(&filter).await?;
        info!(count = initial.len(), search = ?filter.needle(), "admin inbox following");
        let (tx, rows) = watch::channel(initial);

        let inbox = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                match event {
                    FeedEvent::Changed(_) | FeedEvent::Removed(_) => match inbox.list(&filter).await {
                        Ok(listed) => {
                            tx.send_replace(listed);
                        }
                        Err(e) => warn!(error = %e, "admin inbox refresh failed; keeping last listing"),
                    },
                    FeedEvent::Subscribed => {}
                    FeedEvent::Disconnected(reason) => {
                        warn!(%reason, "admin inbox feed lost");
                        break;
                    }
                }
            }
        });
        Ok(LiveInbox { rows, task })
    }
}

/// A listing kept current by `AdminInbox::follow`. Dropping it unsubscribes.
pub struct LiveInbox {
    rows: watch::Receiver<Vec<ConversationSummary>>,
    task: JoinHandle<()>,
}

impl LiveInbox {
    #[must_use]
    pub fn current(&self) -> Vec<ConversationSummary> {
        self.rows.borrow().clone()
    }

    /// Fires on every refresh; errors once the feed is gone.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.rows.clone()
    }
}

impl Drop for LiveInbox {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Total messages awaiting an admin across a listing.
#[must_use]
pub fn unread_total(rows: &[ConversationSummary]) -> i64 {
    rows.iter().map(|r| i64::from(r.conversation.unread_admin)).sum()
}

#[cfg(test)]
#[path = "inbox_test.rs"]
mod tests;
