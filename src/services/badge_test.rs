use std::sync::Arc;

use super::*;
use crate::model::{ConversationUpdate, Role, test_helpers};
use crate::store::memory::MemoryBackend;
use crate::store::{ConversationStore, MessageStore, StaticIdentity};
use tokio::time::{Duration, timeout};
use uuid::Uuid;

fn backend_for(memory: &MemoryBackend, user: Option<Uuid>) -> Backend {
    Backend::from_shared(Arc::new(StaticIdentity(user)), Arc::new(memory.clone()))
}

async fn wait_unread(badge: &UnreadBadge, expected: i32) {
    let mut rx = badge.watch();
    timeout(Duration::from_secs(1), rx.wait_for(|n| *n == expected))
        .await
        .unwrap_or_else(|_| panic!("badge never reached {expected}"))
        .expect("badge sender dropped");
}

#[tokio::test]
async fn badge_without_conversation_stays_zero_and_creates_nothing() {
    let memory = MemoryBackend::new();
    let student = Uuid::new_v4();
    let badge = UnreadBadge::start(&backend_for(&memory, Some(student))).await.unwrap();
    assert_eq!(badge.current(), 0);
    assert!(badge.conversation_id().is_none());
    assert!(memory.find_for_user(student).await.unwrap().is_none());
}

#[tokio::test]
async fn badge_follows_admin_replies_and_reads() {
    let memory = MemoryBackend::new();
    let student = Uuid::new_v4();
    let conv = memory.get_or_create(student).await.unwrap();
    let badge = UnreadBadge::start(&backend_for(&memory, Some(student))).await.unwrap();
    assert_eq!(badge.conversation_id(), Some(conv.id));

    for ts in [1, 2] {
        memory
            .append(&test_helpers::message_at(conv.id, Role::Admin, "reply", ts))
            .await
            .unwrap();
    }
    wait_unread(&badge, 2).await;

    memory
        .update(conv.id, &ConversationUpdate::mark_read(Role::Student, 10))
        .await
        .unwrap();
    wait_unread(&badge, 0).await;
}

#[tokio::test]
async fn badge_requires_identity() {
    let memory = MemoryBackend::new();
    assert!(matches!(UnreadBadge::start(&backend_for(&memory, None)).await, Err(SyncError::Auth)));
}
