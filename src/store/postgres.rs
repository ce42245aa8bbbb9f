//! Postgres adapter: hosted tables plus `LISTEN/NOTIFY` realtime.
//!
//! DESIGN
//! ======
//! Reads and writes go to the existing `support_conversations`,
//! `support_messages` and `profiles` tables with runtime-checked queries.
//! Timestamps are converted to epoch milliseconds in SQL so rows decode
//! straight into the model types.
//!
//! Realtime uses one Postgres notification channel per conversation
//! (`support_<uuid>`), plus `support_conversations`, which carries every
//! conversation-row change for the admin inbox. Store notifications are issued inside the same
//! transaction as the write, so they are delivered on commit or not at all.
//! Broadcasts are plain `pg_notify` calls with no durable side effect.
//!
//! TRADE-OFFS
//! ==========
//! Every subscription holds its own `PgListener` connection. That keeps
//! unsubscribe trivial (drop the listener) at the cost of one connection per
//! open chat view.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgConnection, PgPool, QueryBuilder, Row};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Broadcast, ChannelEvent, ConversationFeed, ConversationFilter, ConversationStore, ConversationSummary, FeedEvent,
    MessageStore, Page, Realtime, StoreError, Subscription,
};
use crate::config::DEFAULT_CHANNEL_CAPACITY;
use crate::frame::{Data, EVENT_CONVERSATION_DELETE, EVENT_CONVERSATION_UPDATE, EVENT_MESSAGE_INSERT, Frame};
use crate::model::{Conversation, ConversationId, ConversationUpdate, Message, Role, UserId};

const CONVERSATION_COLUMNS: &str = "id, user_id, \
     (extract(epoch FROM updated_at) * 1000)::bigint AS updated_at, \
     (extract(epoch FROM last_message_at) * 1000)::bigint AS last_message_at, \
     last_message_body, unread_admin, unread_user, \
     (extract(epoch FROM admin_last_read_at) * 1000)::bigint AS admin_last_read_at, \
     (extract(epoch FROM user_last_read_at) * 1000)::bigint AS user_last_read_at, \
     is_closed";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, sender_role, body, \
     (extract(epoch FROM created_at) * 1000)::bigint AS created_at";

/// Notification channel carrying every conversation-row change.
pub const CONVERSATIONS_CHANNEL: &str = "support_conversations";

/// Notification channel for one conversation. Lowercase, under the 63-byte
/// identifier limit.
#[must_use]
pub fn channel_name(conversation_id: ConversationId) -> String {
    format!("support_{}", conversation_id.simple())
}

#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    channel_capacity: usize,
}

impl PgBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool, channel_capacity: DEFAULT_CHANNEL_CAPACITY }
    }

    #[must_use]
    pub fn with_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity.max(1);
        self
    }

    /// Role recorded on the user's profile, if any.
    ///
    /// # Errors
    ///
    /// Returns a database error, or `InvalidRow` for an unknown role value.
    pub async fn profile_role(&self, user_id: UserId) -> Result<Option<Role>, StoreError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT role FROM profiles WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        raw.map(|r| Role::parse(&r).ok_or_else(|| StoreError::InvalidRow(format!("unknown profile role: {r}"))))
            .transpose()
    }
}

// =============================================================================
// ROW DECODING
// =============================================================================

fn conversation_from_row(row: &PgRow) -> Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        updated_at: row.try_get::<Option<i64>, _>("updated_at")?.unwrap_or(0),
        last_message_at: row.try_get("last_message_at")?,
        last_message_body: row.try_get("last_message_body")?,
        unread_admin: row.try_get::<Option<i32>, _>("unread_admin")?.unwrap_or(0),
        unread_user: row.try_get::<Option<i32>, _>("unread_user")?.unwrap_or(0),
        admin_last_read_at: row.try_get("admin_last_read_at")?,
        user_last_read_at: row.try_get("user_last_read_at")?,
        is_closed: row.try_get::<Option<bool>, _>("is_closed")?.unwrap_or(false),
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let raw_role: String = row.try_get("sender_role")?;
    let sender_role =
        Role::parse(&raw_role).ok_or_else(|| StoreError::InvalidRow(format!("unknown sender_role: {raw_role}")))?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        sender_role,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Escape LIKE wildcards in a user-supplied needle.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

async fn notify_on(conn: &mut PgConnection, channel: &str, frame: &Frame) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(frame.encode()?)
        .execute(conn)
        .await?;
    Ok(())
}

async fn notify(conn: &mut PgConnection, frame: &Frame) -> Result<(), StoreError> {
    notify_on(conn, &channel_name(frame.conversation_id), frame).await
}

/// Row change on the conversation's own channel and on the admin feed.
async fn notify_changed(conn: &mut PgConnection, conversation: &Conversation) -> Result<(), StoreError> {
    let frame = Frame::with_payload(conversation.id, EVENT_CONVERSATION_UPDATE, conversation)?;
    notify(&mut *conn, &frame).await?;
    notify_on(conn, CONVERSATIONS_CHANNEL, &frame).await
}

// =============================================================================
// CONVERSATION STORE
// =============================================================================

#[async_trait]
impl ConversationStore for PgBackend {
    async fn get_or_create(&self, user_id: UserId) -> Result<Conversation, StoreError> {
        if let Some(existing) = self.find_for_user(user_id).await? {
            return Ok(existing);
        }
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO support_conversations (id, user_id) VALUES ($1, $2) RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .fetch_one(tx.as_mut())
        .await?;
        let created = conversation_from_row(&row)?;
        let frame = Frame::with_payload(created.id, EVENT_CONVERSATION_UPDATE, &created)?;
        notify_on(tx.as_mut(), CONVERSATIONS_CHANNEL, &frame).await?;
        tx.commit().await?;
        info!(conversation_id = %created.id, %user_id, "support conversation created");
        Ok(created)
    }

    async fn get(&self, conversation_id: ConversationId) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!("SELECT {CONVERSATION_COLUMNS} FROM support_conversations WHERE id = $1"))
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        Ok(conversation_from_row(&row)?)
    }

    async fn find_for_user(&self, user_id: UserId) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM support_conversations WHERE user_id = $1 LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(conversation_from_row).transpose()?)
    }

    async fn update(&self, conversation_id: ConversationId, update: &ConversationUpdate) -> Result<(), StoreError> {
        if update.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::new("UPDATE support_conversations SET ");
        {
            let mut sets = builder.separated(", ");
            if let Some(n) = update.unread_admin {
                sets.push("unread_admin = ").push_bind_unseparated(n);
            }
            if let Some(n) = update.unread_user {
                sets.push("unread_user = ").push_bind_unseparated(n);
            }
            if let Some(ts) = update.admin_last_read_at {
                sets.push("admin_last_read_at = to_timestamp(")
                    .push_bind_unseparated(ts)
                    .push_unseparated("::bigint / 1000.0)");
            }
            if let Some(ts) = update.user_last_read_at {
                sets.push("user_last_read_at = to_timestamp(")
                    .push_bind_unseparated(ts)
                    .push_unseparated("::bigint / 1000.0)");
            }
            if let Some(closed) = update.is_closed {
                sets.push("is_closed = ").push_bind_unseparated(closed);
            }
        }
        builder.push(" WHERE id = ");
        builder.push_bind(conversation_id);
        builder.push(" RETURNING ");
        builder.push(CONVERSATION_COLUMNS);

        let mut tx = self.pool.begin().await?;
        let row = builder
            .build()
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        let conversation = conversation_from_row(&row)?;
        notify_changed(tx.as_mut(), &conversation).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_for_admin(
        &self,
        filter: &ConversationFilter,
        page: Page,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let pattern = filter.needle().map(|n| like_pattern(&n));
        let rows = sqlx::query(&format!(
            "SELECT conv.*, p.full_name, p.student_id::text AS student_code
             FROM (SELECT {CONVERSATION_COLUMNS} FROM support_conversations) conv
             LEFT JOIN profiles p ON p.id = conv.user_id
             WHERE $1::text IS NULL
                OR lower(p.full_name) LIKE $1
                OR lower(p.student_id::text) LIKE $1
                OR lower(conv.last_message_body) LIKE $1
             ORDER BY conv.updated_at DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(pattern)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ConversationSummary {
                    conversation: conversation_from_row(row)?,
                    student_name: row.try_get("full_name")?,
                    student_code: row.try_get("student_code")?,
                })
            })
            .collect()
    }
}

// =============================================================================
// MESSAGE STORE
// =============================================================================

#[async_trait]
impl MessageStore for PgBackend {
    async fn append(&self, message: &Message) -> Result<(), StoreError> {
        let (bump_admin, bump_user) = match message.sender_role {
            Role::Student => (1_i32, 0_i32),
            Role::Admin => (0, 1),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO support_messages (id, conversation_id, sender_id, sender_role, body, created_at)
             VALUES ($1, $2, $3, $4, $5, to_timestamp($6::bigint / 1000.0))",
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(message.sender_role.as_str())
        .bind(&message.body)
        .bind(message.created_at)
        .execute(tx.as_mut())
        .await?;

        let row = sqlx::query(&format!(
            "UPDATE support_conversations
             SET updated_at = now(),
                 last_message_at = to_timestamp($2::bigint / 1000.0),
                 last_message_body = $3,
                 unread_admin = COALESCE(unread_admin, 0) + $4,
                 unread_user = COALESCE(unread_user, 0) + $5
             WHERE id = $1
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(message.conversation_id)
        .bind(message.created_at)
        .bind(&message.body)
        .bind(bump_admin)
        .bind(bump_user)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(StoreError::ConversationNotFound(message.conversation_id))?;
        let conversation = conversation_from_row(&row)?;

        notify(tx.as_mut(), &Frame::with_payload(message.conversation_id, EVENT_MESSAGE_INSERT, message)?).await?;
        notify_changed(tx.as_mut(), &conversation).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_recent(&self, conversation_id: ConversationId, limit: i64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM (
                SELECT {MESSAGE_COLUMNS}
                FROM support_messages
                WHERE conversation_id = $1
                ORDER BY created_at DESC
                LIMIT $2
             ) recent
             ORDER BY created_at ASC"
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn delete_all(&self, conversation_id: ConversationId, delete_conversation: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM support_messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(tx.as_mut())
            .await?
            .rows_affected();

        if delete_conversation {
            let removed = sqlx::query("DELETE FROM support_conversations WHERE id = $1")
                .bind(conversation_id)
                .execute(tx.as_mut())
                .await?
                .rows_affected();
            if removed > 0 {
                let frame = Frame::new(conversation_id, EVENT_CONVERSATION_DELETE, Data::new());
                notify_on(tx.as_mut(), CONVERSATIONS_CHANNEL, &frame).await?;
            }
        } else {
            let row = sqlx::query(&format!(
                "UPDATE support_conversations
                 SET updated_at = now(), last_message_at = NULL, last_message_body = NULL,
                     unread_admin = 0, unread_user = 0
                 WHERE id = $1
                 RETURNING {CONVERSATION_COLUMNS}"
            ))
            .bind(conversation_id)
            .fetch_optional(tx.as_mut())
            .await?;
            if let Some(row) = row {
                notify_changed(tx.as_mut(), &conversation_from_row(&row)?).await?;
            }
        }
        tx.commit().await?;

        info!(%conversation_id, deleted, delete_conversation, "support conversation cleared");
        Ok(())
    }
}

// =============================================================================
// REALTIME
// =============================================================================

/// LISTEN on `channel`, then relay decoded notifications into `tx` until the
/// receiving side is dropped or the connection is lost. `decode` returning
/// `None` skips the notification.
async fn relay<E, F>(
    mut listener: PgListener,
    channel: String,
    tx: mpsc::Sender<E>,
    subscribed: E,
    disconnected: fn(String) -> E,
    decode: F,
) where
    E: Send + 'static,
    F: Fn(&Frame) -> Option<E> + Send + 'static,
{
    // PHASE: HANDSHAKE
    if let Err(e) = listener.listen(&channel).await {
        warn!(error = %e, %channel, "pg realtime: LISTEN failed");
        let _ = tx.send(disconnected(e.to_string())).await;
        return;
    }
    if tx.send(subscribed).await.is_err() {
        return;
    }
    debug!(%channel, "pg realtime: subscribed");

    // PHASE: RELAY UNTIL THE SUBSCRIPTION IS DROPPED
    loop {
        tokio::select! {
            () = tx.closed() => break,
            received = listener.try_recv() => {
                let notification = match received {
                    Ok(Some(n)) => n,
                    Ok(None) => {
                        let _ = tx.send(disconnected("listener connection lost".into())).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(disconnected(e.to_string())).await;
                        break;
                    }
                };
                let frame = match Frame::decode(notification.payload()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, %channel, "pg realtime: dropping undecodable notification");
                        continue;
                    }
                };
                debug!(%channel, event = %frame.event, broadcast = frame.is_broadcast(), "pg realtime: frame received");
                if let Some(event) = decode(&frame) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!(%channel, "pg realtime: listener released");
}

#[async_trait]
impl Realtime for PgBackend {
    async fn subscribe(&self, conversation_id: ConversationId) -> Result<Subscription, StoreError> {
        let listener = PgListener::connect_with(&self.pool).await?;
        let channel = channel_name(conversation_id);
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        let decode = move |frame: &Frame| {
            if frame.conversation_id != conversation_id {
                debug!(other = %frame.conversation_id, "pg realtime: frame for another conversation");
                return None;
            }
            ChannelEvent::from_frame(frame)
                .map_err(|e| warn!(error = %e, event = %frame.event, "pg realtime: dropping notification"))
                .ok()
        };
        tokio::spawn(relay(listener, channel, tx, ChannelEvent::Subscribed, ChannelEvent::Disconnected, decode));

        Ok(Subscription::new(conversation_id, rx))
    }

    async fn subscribe_conversations(&self) -> Result<ConversationFeed, StoreError> {
        let listener = PgListener::connect_with(&self.pool).await?;
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        let decode = |frame: &Frame| {
            FeedEvent::from_frame(frame)
                .map_err(|e| warn!(error = %e, event = %frame.event, "pg realtime: dropping feed notification"))
                .ok()
        };
        tokio::spawn(relay(
            listener,
            CONVERSATIONS_CHANNEL.to_owned(),
            tx,
            FeedEvent::Subscribed,
            FeedEvent::Disconnected,
            decode,
        ));

        Ok(ConversationFeed::new(rx))
    }

    async fn broadcast(&self, event: &Broadcast) -> Result<(), StoreError> {
        let frame = event.to_frame()?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel_name(frame.conversation_id))
            .bind(frame.encode()?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
