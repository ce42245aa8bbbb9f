//! Synchronizer event loop.
//!
//! ARCHITECTURE
//! ============
//! One `Engine` task owns the timeline and the open session. User intents
//! and I/O completions arrive as `Inbox` messages on one bounded channel and
//! are handled one at a time, so no state is ever mutated concurrently.
//! Handlers never await: every network call is a spawned task that posts its
//! result back into the inbox.
//!
//! DESIGN
//! ======
//! Each `open` bumps a session token. Every spawned task captures the token
//! it was issued under, and completions carrying an older token are dropped
//! on arrival. A late send completion still answers its caller but never
//! touches the current timeline.
//!
//! Broadcasts issued before the channel handshake wait in the session's
//! pending queue. On `Subscribed` they move, in order, into a per-session
//! outbox drained by a single broadcaster task, which keeps them FIFO with
//! later sends. Closing or switching drops the session along with its
//! pending queue; whatever already reached the outbox is still delivered.
//! A clear that also deletes the conversation row closes the session the
//! same way once its `clear` broadcast is handed off.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::timeline::{MergeOutcome, Source, Timeline};
use super::{ChatView, ConversationHandle, LoadStatus, SyncError};
use crate::config::SyncConfig;
use crate::frame::Frame;
use crate::model::{Conversation, ConversationId, ConversationUpdate, Message, Role, UserId, now_ms};
use crate::store::{Backend, Broadcast, ChannelEvent, StoreError};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// User intents, sent by `ChatSync`.
pub(crate) enum Command {
    Open { conversation_id: ConversationId, reply: oneshot::Sender<ConversationHandle> },
    Close { handle: ConversationHandle, reply: oneshot::Sender<()> },
    Send { body: String, reply: Reply<Message> },
    MarkRead,
    Clear { delete_conversation: bool, reply: Reply<()> },
    SetClosed { closed: bool, reply: Reply<()> },
    DismissError,
    /// Answered once every earlier inbox message has been handled.
    Barrier(oneshot::Sender<()>),
}

pub(crate) enum Inbox {
    Command(Command),
    HistoryLoaded { token: u64, result: Result<Vec<Message>, StoreError> },
    ConversationLoaded { token: u64, result: Result<Conversation, StoreError> },
    Channel { token: u64, event: ChannelEvent },
    SubscribeFailed { token: u64, error: StoreError },
    SendFinished { token: u64, message: Message, result: Result<(), StoreError>, reply: Reply<Message> },
    ClearFinished { token: u64, delete_conversation: bool, result: Result<(), StoreError>, reply: Reply<()> },
    ClosedUpdated { token: u64, closed: bool, result: Result<(), StoreError>, reply: Reply<()> },
}

/// Post into the engine inbox if the engine is still running.
async fn post(inbox: &mpsc::WeakSender<Inbox>, msg: Inbox) -> bool {
    let Some(tx) = inbox.upgrade() else {
        return false;
    };
    tx.send(msg).await.is_ok()
}

// =============================================================================
// SESSION
// =============================================================================

/// Everything scoped to one open conversation.
struct Session {
    conversation_id: ConversationId,
    token: u64,
    conversation: Option<Conversation>,
    /// Subscribes, then relays channel events into the inbox.
    forwarder: Option<JoinHandle<()>>,
    /// Feeds the broadcaster task once the channel is ready. Dropping it
    /// lets the task deliver what it already holds and exit.
    outbox: Option<mpsc::UnboundedSender<Broadcast>>,
    /// Broadcasts issued before the handshake completed.
    pending: VecDeque<Broadcast>,
    channel_ready: bool,
    /// Set between a disconnect and the replacement handshake.
    reconnecting: bool,
}

impl Session {
    fn new(conversation_id: ConversationId, token: u64) -> Self {
        Self {
            conversation_id,
            token,
            conversation: None,
            forwarder: None,
            outbox: None,
            pending: VecDeque::new(),
            channel_ready: false,
            reconnecting: false,
        }
    }

    fn detach_channel(&mut self) {
        self.channel_ready = false;
        self.outbox = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub(crate) struct Engine {
    backend: Backend,
    role: Role,
    config: SyncConfig,
    inbox: mpsc::WeakSender<Inbox>,
    view: watch::Sender<ChatView>,
    timeline: Timeline,
    session: Option<Session>,
    last_token: u64,
    status: LoadStatus,
    error: Option<String>,
    unread: i32,
}

impl Engine {
    pub(crate) fn new(
        backend: Backend,
        role: Role,
        config: SyncConfig,
        inbox: mpsc::WeakSender<Inbox>,
        view: watch::Sender<ChatView>,
    ) -> Self {
        Self {
            backend,
            role,
            config,
            inbox,
            view,
            timeline: Timeline::new(),
            session: None,
            last_token: 0,
            status: LoadStatus::Idle,
            error: None,
            unread: 0,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Inbox>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
            self.publish();
        }
        self.session = None;
        debug!(role = %self.role, "sync engine stopped");
    }

    pub(crate) fn handle(&mut self, msg: Inbox) {
        match msg {
            Inbox::Command(command) => self.handle_command(command),
            Inbox::HistoryLoaded { token, result } => self.on_history(token, result),
            Inbox::ConversationLoaded { token, result } => self.on_conversation(token, result),
            Inbox::Channel { token, event } => self.on_channel(token, event),
            Inbox::SubscribeFailed { token, error } => self.on_subscribe_failed(token, &error),
            Inbox::SendFinished { token, message, result, reply } => self.on_send_finished(token, message, result, reply),
            Inbox::ClearFinished { token, delete_conversation, result, reply } => {
                self.on_clear_finished(token, delete_conversation, result, reply);
            }
            Inbox::ClosedUpdated { token, closed, result, reply } => self.on_closed_updated(token, closed, result, reply),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { conversation_id, reply } => {
                let handle = self.open(conversation_id);
                let _ = reply.send(handle);
            }
            Command::Close { handle, reply } => {
                self.close(&handle);
                let _ = reply.send(());
            }
            Command::Send { body, reply } => self.send(&body, reply),
            Command::MarkRead => self.mark_read(),
            Command::Clear { delete_conversation, reply } => self.clear(delete_conversation, reply),
            Command::SetClosed { closed, reply } => self.set_closed(closed, reply),
            Command::DismissError => self.error = None,
            Command::Barrier(reply) => {
                let _ = reply.send(());
            }
        }
    }

    // -------------------------------------------------------------------------
    // View
    // -------------------------------------------------------------------------

    pub(crate) fn snapshot(&self) -> ChatView {
        let session = self.session.as_ref();
        ChatView {
            conversation_id: session.map(|s| s.conversation_id),
            conversation: session.and_then(|s| s.conversation.clone()),
            messages: self.timeline.snapshot(),
            unread: self.unread,
            status: self.status,
            error: self.error.clone(),
            channel_ready: session.is_some_and(|s| s.channel_ready),
        }
    }

    fn publish(&self) {
        self.view.send_replace(self.snapshot());
    }

    fn current(&mut self, token: u64) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.token == token)
    }

    fn is_current(&self, token: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.token == token)
    }

    // -------------------------------------------------------------------------
    // Open / close
    // -------------------------------------------------------------------------

    fn open(&mut self, conversation_id: ConversationId) -> ConversationHandle {
        if let Some(previous) = self.session.take() {
            info!(from = %previous.conversation_id, to = %conversation_id, dropped = previous.pending.len(), "switching conversation");
        }

        self.last_token += 1;
        let token = self.last_token;
        self.timeline.clear();
        self.status = LoadStatus::Loading;
        self.error = None;
        self.unread = 0;

        let mut session = Session::new(conversation_id, token);
        session.forwarder = Some(self.spawn_subscription(conversation_id, token));
        self.session = Some(session);

        self.spawn_conversation_fetch(conversation_id, token);
        self.spawn_history_fetch(conversation_id, token);
        self.spawn_mark_read(conversation_id);

        info!(%conversation_id, token, role = %self.role, "conversation opened");
        ConversationHandle { conversation_id, token }
    }

    fn close(&mut self, handle: &ConversationHandle) {
        if !self.is_current(handle.token) {
            debug!(conversation_id = %handle.conversation_id, token = handle.token, "close for a session that is already gone");
            return;
        }
        if let Some(session) = self.session.take() {
            info!(conversation_id = %session.conversation_id, dropped = session.pending.len(), "conversation closed");
        }
        self.timeline.clear();
        self.status = LoadStatus::Idle;
        self.error = None;
        self.unread = 0;
    }

    // -------------------------------------------------------------------------
    // Outgoing
    // -------------------------------------------------------------------------

    fn send(&mut self, body: &str, reply: Reply<Message>) {
        let body = body.trim();
        let (conversation_id, token, sender_id) = match self.check_send(body) {
            Ok(ids) => ids,
            Err(e) => {
                debug!(error = %e, "send rejected");
                let _ = reply.send(Err(e));
                return;
            }
        };

        let message = Message::compose(conversation_id, sender_id, self.role, body);
        self.timeline.merge(message.clone(), Source::Local);
        debug!(%conversation_id, message_id = %message.id, "optimistic message added");

        let messages = self.backend.messages.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = messages.append(&message).await;
            let finished = Inbox::SendFinished { token, message, result, reply };
            post(&inbox, finished).await;
        });
    }

    fn check_send(&self, body: &str) -> Result<(ConversationId, u64, UserId), SyncError> {
        if body.is_empty() {
            return Err(SyncError::Validation("message body is empty".into()));
        }
        if body.chars().count() > self.config.max_body_chars {
            return Err(SyncError::Validation(format!(
                "message body exceeds {} characters",
                self.config.max_body_chars
            )));
        }
        if Frame::encoded_len(body) > self.config.max_body_bytes {
            return Err(SyncError::Validation(format!(
                "message body exceeds {} bytes once encoded",
                self.config.max_body_bytes
            )));
        }
        let sender_id = self.backend.identity.current_user_id().ok_or(SyncError::Auth)?;
        let session = self.session.as_ref().ok_or(SyncError::NotOpen)?;
        if self.role == Role::Student && session.conversation.as_ref().is_some_and(|c| c.is_closed) {
            return Err(SyncError::ConversationClosed);
        }
        Ok((session.conversation_id, session.token, sender_id))
    }

    fn on_send_finished(&mut self, token: u64, message: Message, result: Result<(), StoreError>, reply: Reply<Message>) {
        let current = self.is_current(token);
        match result {
            Ok(()) => {
                if current {
                    self.timeline.confirm(message.id);
                    self.queue_broadcast(Broadcast::Message(message.clone()));
                    self.spawn_mark_read(message.conversation_id);
                    self.unread = 0;
                } else {
                    debug!(message_id = %message.id, "send finished for an abandoned session");
                }
                let _ = reply.send(Ok(message));
            }
            Err(e) => {
                if current {
                    self.timeline.remove(message.id);
                    self.error = Some(format!("message not sent: {e}"));
                }
                error!(error = %e, message_id = %message.id, "message persist failed; optimistic entry rolled back");
                let _ = reply.send(Err(SyncError::Store(e)));
            }
        }
    }

    /// Hand a broadcast to the live channel, or queue it until the handshake.
    fn queue_broadcast(&mut self, mut event: Broadcast) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.channel_ready {
            if let Some(outbox) = &session.outbox {
                match outbox.send(event) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(returned)) => {
                        warn!(conversation_id = %session.conversation_id, "broadcaster gone; queueing broadcast");
                        event = returned;
                    }
                }
            }
        }
        session.pending.push_back(event);
        debug!(conversation_id = %session.conversation_id, queued = session.pending.len(), "broadcast queued until handshake");
    }

    fn mark_read(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let conversation_id = session.conversation_id;
        if let Some(conversation) = session.conversation.as_mut() {
            conversation.apply(&ConversationUpdate::mark_read(self.role, now_ms()));
        }
        self.unread = 0;
        self.spawn_mark_read(conversation_id);
    }

    fn clear(&mut self, delete_conversation: bool, reply: Reply<()>) {
        let checked = self.check_admin_action("clear a conversation");
        let (conversation_id, token) = match checked {
            Ok(ids) => ids,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let messages = self.backend.messages.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = messages.delete_all(conversation_id, delete_conversation).await;
            post(&inbox, Inbox::ClearFinished { token, delete_conversation, result, reply }).await;
        });
    }

    fn on_clear_finished(&mut self, token: u64, delete_conversation: bool, result: Result<(), StoreError>, reply: Reply<()>) {
        if let Err(e) = result {
            error!(error = %e, "clear failed");
            if self.is_current(token) {
                self.error = Some(format!("clear failed: {e}"));
            }
            let _ = reply.send(Err(SyncError::Store(e)));
            return;
        }

        if let Some(session) = self.current(token) {
            let conversation_id = session.conversation_id;
            if let Some(conversation) = session.conversation.as_mut() {
                conversation.reset_preview();
            }
            self.timeline.clear();
            self.unread = 0;
            self.queue_broadcast(Broadcast::Clear { conversation_id });
            info!(%conversation_id, delete_conversation, "conversation cleared");

            // The row is gone: nothing is left to send into or watch.
            if delete_conversation {
                self.session = None;
                self.status = LoadStatus::Idle;
                info!(%conversation_id, "conversation deleted; session closed");
            }
        }
        let _ = reply.send(Ok(()));
    }

    fn set_closed(&mut self, closed: bool, reply: Reply<()>) {
        let checked = self.check_admin_action("lock or unlock a conversation");
        let (conversation_id, token) = match checked {
            Ok(ids) => ids,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let conversations = self.backend.conversations.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = conversations.update(conversation_id, &ConversationUpdate::closed(closed)).await;
            post(&inbox, Inbox::ClosedUpdated { token, closed, result, reply }).await;
        });
    }

    fn on_closed_updated(&mut self, token: u64, closed: bool, result: Result<(), StoreError>, reply: Reply<()>) {
        match result {
            Ok(()) => {
                if let Some(conversation) = self.current(token).and_then(|s| s.conversation.as_mut()) {
                    conversation.is_closed = closed;
                }
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, closed, "conversation lock update failed");
                if self.is_current(token) {
                    self.error = Some(format!("update failed: {e}"));
                }
                let _ = reply.send(Err(SyncError::Store(e)));
            }
        }
    }

    fn check_admin_action(&self, action: &str) -> Result<(ConversationId, u64), SyncError> {
        if self.role != Role::Admin {
            return Err(SyncError::Permission(format!("only admins can {action}")));
        }
        if self.backend.identity.current_user_id().is_none() {
            return Err(SyncError::Auth);
        }
        let session = self.session.as_ref().ok_or(SyncError::NotOpen)?;
        Ok((session.conversation_id, session.token))
    }

    // -------------------------------------------------------------------------
    // Incoming
    // -------------------------------------------------------------------------

    fn on_history(&mut self, token: u64, result: Result<Vec<Message>, StoreError>) {
        if !self.is_current(token) {
            debug!(token, "discarding history for an abandoned session");
            return;
        }
        match result {
            Ok(rows) => {
                let count = rows.len();
                let mut inserted = 0_usize;
                for message in rows {
                    if self.timeline.merge(message, Source::History) == MergeOutcome::Inserted {
                        inserted += 1;
                    }
                }
                self.status = LoadStatus::Ready;
                info!(count, inserted, "history loaded");
            }
            Err(e) => {
                error!(error = %e, "history fetch failed");
                if self.status == LoadStatus::Loading {
                    self.status = LoadStatus::Failed;
                }
                self.error = Some(format!("could not load messages: {e}"));
            }
        }
    }

    fn on_conversation(&mut self, token: u64, result: Result<Conversation, StoreError>) {
        let role = self.role;
        let Some(session) = self.current(token) else {
            return;
        };
        match result {
            Ok(mut conversation) => {
                // The open already issued a mark-read for this side.
                conversation.apply(&ConversationUpdate::mark_read(role, now_ms()));
                session.conversation = Some(conversation);
                self.unread = 0;
            }
            Err(e) => {
                warn!(error = %e, conversation_id = %session.conversation_id, "conversation fetch failed");
                self.error = Some(format!("could not load conversation: {e}"));
            }
        }
    }

    fn on_channel(&mut self, token: u64, event: ChannelEvent) {
        if !self.is_current(token) {
            debug!(token, "dropping channel event for an abandoned session");
            return;
        }
        match event {
            ChannelEvent::Subscribed => self.on_subscribed(),
            ChannelEvent::Broadcast(Broadcast::Message(message)) => self.on_incoming(message, Source::Broadcast),
            ChannelEvent::MessageInserted(message) => self.on_incoming(message, Source::Persisted),
            ChannelEvent::Broadcast(Broadcast::Clear { conversation_id }) => {
                if self.session.as_ref().is_some_and(|s| s.conversation_id == conversation_id) {
                    self.timeline.clear();
                    info!(%conversation_id, "conversation cleared by a peer");
                }
            }
            ChannelEvent::ConversationChanged(conversation) => {
                let role = self.role;
                if let Some(session) = self.session.as_mut().filter(|s| s.conversation_id == conversation.id) {
                    self.unread = conversation.unread_for(role);
                    session.conversation = Some(conversation);
                }
            }
            ChannelEvent::Disconnected(reason) => self.on_disconnected(token, &reason),
        }
    }

    fn on_subscribed(&mut self) {
        let realtime = self.backend.realtime.clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.channel_ready = true;
        session.reconnecting = false;

        let (outbox, mut rx) = mpsc::unbounded_channel::<Broadcast>();
        let conversation_id = session.conversation_id;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = realtime.broadcast(&event).await {
                    warn!(error = %e, %conversation_id, "broadcast failed");
                }
            }
        });

        let flushed = session.pending.len();
        while let Some(event) = session.pending.pop_front() {
            let _ = outbox.send(event);
        }
        session.outbox = Some(outbox);
        info!(%conversation_id, flushed, "realtime channel ready");
    }

    fn on_incoming(&mut self, message: Message, source: Source) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if message.conversation_id != session.conversation_id {
            debug!(message_id = %message.id, "ignoring message for another conversation");
            return;
        }
        let conversation_id = session.conversation_id;
        let from_counterpart = message.sender_role == self.role.counterpart();
        let message_id = message.id;
        let outcome = self.timeline.merge(message, source);
        debug!(%message_id, ?source, ?outcome, "merged incoming message");

        if outcome == MergeOutcome::Inserted && from_counterpart {
            self.spawn_mark_read(conversation_id);
            self.unread = 0;
        }
    }

    fn on_disconnected(&mut self, token: u64, reason: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let conversation_id = session.conversation_id;
        let was_reconnecting = session.reconnecting;
        session.detach_channel();

        if was_reconnecting {
            error!(%conversation_id, reason, "realtime resubscribe failed");
            self.error = Some(format!("live updates unavailable: {reason}"));
            return;
        }

        warn!(%conversation_id, reason, pending = session.pending.len(), "realtime channel lost; resubscribing");
        session.reconnecting = true;
        let forwarder = self.spawn_subscription(conversation_id, token);
        if let Some(session) = self.session.as_mut() {
            session.forwarder = Some(forwarder);
        }
        self.spawn_history_fetch(conversation_id, token);
    }

    fn on_subscribe_failed(&mut self, token: u64, error: &StoreError) {
        let Some(session) = self.current(token) else {
            return;
        };
        session.channel_ready = false;
        session.forwarder = None;
        let conversation_id = session.conversation_id;
        error!(error = %error, %conversation_id, "realtime subscribe failed");
        self.error = Some(format!("live updates unavailable: {error}"));
    }

    // -------------------------------------------------------------------------
    // Spawned I/O
    // -------------------------------------------------------------------------

    fn spawn_history_fetch(&self, conversation_id: ConversationId, token: u64) {
        let messages = self.backend.messages.clone();
        let inbox = self.inbox.clone();
        let limit = self.config.history_limit(self.role);
        tokio::spawn(async move {
            let result = messages.list_recent(conversation_id, limit).await;
            post(&inbox, Inbox::HistoryLoaded { token, result }).await;
        });
    }

    fn spawn_conversation_fetch(&self, conversation_id: ConversationId, token: u64) {
        let conversations = self.backend.conversations.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = conversations.get(conversation_id).await;
            post(&inbox, Inbox::ConversationLoaded { token, result }).await;
        });
    }

    /// Subscribe, then relay every channel event into the inbox. Emits
    /// exactly one `Disconnected` when the stream ends.
    fn spawn_subscription(&self, conversation_id: ConversationId, token: u64) -> JoinHandle<()> {
        let realtime = self.backend.realtime.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let mut subscription = match realtime.subscribe(conversation_id).await {
                Ok(subscription) => subscription,
                Err(error) => {
                    post(&inbox, Inbox::SubscribeFailed { token, error }).await;
                    return;
                }
            };
            while let Some(event) = subscription.next().await {
                let last = matches!(event, ChannelEvent::Disconnected(_));
                if !post(&inbox, Inbox::Channel { token, event }).await || last {
                    return;
                }
            }
            let event = ChannelEvent::Disconnected("subscription stream ended".into());
            post(&inbox, Inbox::Channel { token, event }).await;
        })
    }

    /// Best-effort read receipt. Failures are logged and swallowed.
    fn spawn_mark_read(&self, conversation_id: ConversationId) {
        let conversations = self.backend.conversations.clone();
        let update = ConversationUpdate::mark_read(self.role, now_ms());
        tokio::spawn(async move {
            if let Err(e) = conversations.update(conversation_id, &update).await {
                warn!(error = %e, %conversation_id, "mark read failed");
            }
        });
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
