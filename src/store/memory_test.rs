use super::*;
use crate::model::test_helpers;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

async fn next_event(sub: &mut Subscription) -> ChannelEvent {
    timeout(Duration::from_millis(200), sub.next())
        .await
        .expect("event receive timed out")
        .expect("subscription closed")
}

async fn assert_no_event(sub: &mut Subscription) {
    assert!(
        timeout(Duration::from_millis(80), sub.next()).await.is_err(),
        "expected subscription to stay quiet"
    );
}

#[tokio::test]
async fn get_or_create_returns_same_row_per_student() {
    let backend = MemoryBackend::new();
    let student = Uuid::new_v4();
    let a = backend.get_or_create(student).await.unwrap();
    let b = backend.get_or_create(student).await.unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(backend.find_for_user(student).await.unwrap(), Some(a));
    assert!(backend.find_for_user(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn subscribe_completes_handshake_first() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    let mut sub = backend.subscribe(conv.id).await.unwrap();
    assert_eq!(next_event(&mut sub).await, ChannelEvent::Subscribed);
    assert_no_event(&mut sub).await;
}

#[tokio::test]
async fn append_publishes_insert_and_conversation_change() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    let mut sub = backend.subscribe(conv.id).await.unwrap();
    assert_eq!(next_event(&mut sub).await, ChannelEvent::Subscribed);

    let msg = test_helpers::message_at(conv.id, Role::Student, "help", 100);
    backend.append(&msg).await.unwrap();

    assert_eq!(next_event(&mut sub).await, ChannelEvent::MessageInserted(msg.clone()));
    let ChannelEvent::ConversationChanged(changed) = next_event(&mut sub).await else {
        panic!("expected conversation change");
    };
    assert_eq!(changed.unread_admin, 1);
    assert_eq!(changed.last_message_body.as_deref(), Some("help"));
    assert_eq!(backend.stored_messages(conv.id).await, vec![msg]);
}

#[tokio::test]
async fn append_rejects_duplicate_id_and_unknown_conversation() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    let msg = test_helpers::message_at(conv.id, Role::Student, "once", 1);
    backend.append(&msg).await.unwrap();
    assert!(matches!(backend.append(&msg).await, Err(StoreError::InvalidRow(_))));
    assert_eq!(backend.stored_conversation(conv.id).await.unwrap().unread_admin, 1);

    let orphan = test_helpers::message_at(Uuid::new_v4(), Role::Student, "lost", 1);
    assert!(matches!(backend.append(&orphan).await, Err(StoreError::ConversationNotFound(_))));
}

#[tokio::test]
async fn append_fault_switch_fails_without_side_effects() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    backend.set_fail_appends(true).await;
    let msg = test_helpers::message_at(conv.id, Role::Admin, "nope", 1);
    assert!(matches!(backend.append(&msg).await, Err(StoreError::Unavailable(_))));
    assert!(backend.stored_messages(conv.id).await.is_empty());
}

#[tokio::test]
async fn list_recent_keeps_newest_window_oldest_first() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    for ts in [30, 10, 20, 40] {
        let msg = test_helpers::message_at(conv.id, Role::Student, &ts.to_string(), ts);
        backend.append(&msg).await.unwrap();
    }

    let recent = backend.list_recent(conv.id, 3).await.unwrap();
    let stamps = recent.iter().map(|m| m.created_at).collect::<Vec<_>>();
    assert_eq!(stamps, vec![20, 30, 40]);
}

#[tokio::test]
async fn held_handshake_waits_for_release() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    backend.set_hold_handshakes(true).await;

    let mut sub = backend.subscribe(conv.id).await.unwrap();
    assert_no_event(&mut sub).await;
    assert_eq!(backend.subscriber_count(conv.id).await, 1);

    backend.release_handshakes(conv.id).await;
    assert_eq!(next_event(&mut sub).await, ChannelEvent::Subscribed);
}

#[tokio::test]
async fn dropped_subscription_is_pruned() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    let sub = backend.subscribe(conv.id).await.unwrap();
    assert_eq!(backend.subscriber_count(conv.id).await, 1);
    drop(sub);
    assert_eq!(backend.subscriber_count(conv.id).await, 0);

    // Publishing to a channel with only dead subscribers must not fail.
    backend
        .broadcast(&Broadcast::Clear { conversation_id: conv.id })
        .await
        .unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_live_subscriber() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    let mut a = backend.subscribe(conv.id).await.unwrap();
    let mut b = backend.subscribe(conv.id).await.unwrap();
    next_event(&mut a).await;
    next_event(&mut b).await;

    let event = Broadcast::Clear { conversation_id: conv.id };
    backend.broadcast(&event).await.unwrap();
    assert_eq!(next_event(&mut a).await, ChannelEvent::Broadcast(event.clone()));
    assert_eq!(next_event(&mut b).await, ChannelEvent::Broadcast(event));
}

#[tokio::test]
async fn disconnect_notifies_and_detaches() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    let mut sub = backend.subscribe(conv.id).await.unwrap();
    next_event(&mut sub).await;

    backend.disconnect(conv.id, "socket reset").await;
    assert_eq!(next_event(&mut sub).await, ChannelEvent::Disconnected("socket reset".into()));
    assert!(timeout(Duration::from_millis(200), sub.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_all_resets_preview_or_removes_row() {
    let backend = MemoryBackend::new();
    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    backend
        .append(&test_helpers::message_at(conv.id, Role::Student, "a", 1))
        .await
        .unwrap();

    backend.delete_all(conv.id, false).await.unwrap();
    assert!(backend.stored_messages(conv.id).await.is_empty());
    let kept = backend.stored_conversation(conv.id).await.unwrap();
    assert!(kept.last_message_body.is_none());
    assert_eq!(kept.unread_admin, 0);

    backend.delete_all(conv.id, true).await.unwrap();
    assert!(backend.stored_conversation(conv.id).await.is_none());
}

#[tokio::test]
async fn list_for_admin_joins_profiles_filters_and_pages() {
    let backend = MemoryBackend::new();
    let mona = Uuid::new_v4();
    let karim = Uuid::new_v4();
    backend
        .seed_profile(mona, Profile { full_name: "Mona".into(), student_code: "S-1".into(), role: Role::Student })
        .await;
    backend
        .seed_profile(karim, Profile { full_name: "Karim".into(), student_code: "S-2".into(), role: Role::Student })
        .await;
    let first = backend.get_or_create(mona).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = backend.get_or_create(karim).await.unwrap();

    let all = backend
        .list_for_admin(&ConversationFilter::default(), Page::first(10))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].conversation.id, second.id);
    assert_eq!(all[1].student_name.as_deref(), Some("Mona"));

    let only_mona = backend
        .list_for_admin(&ConversationFilter::search("mon"), Page::first(10))
        .await
        .unwrap();
    assert_eq!(only_mona.len(), 1);
    assert_eq!(only_mona[0].conversation.id, first.id);

    let paged = backend
        .list_for_admin(&ConversationFilter::default(), Page { limit: 1, offset: 1 })
        .await
        .unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].conversation.id, first.id);
}

async fn next_feed_event(feed: &mut ConversationFeed) -> FeedEvent {
    timeout(Duration::from_millis(200), feed.next())
        .await
        .expect("feed receive timed out")
        .expect("feed closed")
}

#[tokio::test]
async fn conversation_feed_sees_create_change_and_delete() {
    let backend = MemoryBackend::new();
    let mut feed = backend.subscribe_conversations().await.unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Subscribed);

    let conv = backend.get_or_create(Uuid::new_v4()).await.unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Changed(conv.clone()));

    backend
        .append(&test_helpers::message_at(conv.id, Role::Student, "help", 5))
        .await
        .unwrap();
    let FeedEvent::Changed(changed) = next_feed_event(&mut feed).await else {
        panic!("expected a conversation change");
    };
    assert_eq!(changed.unread_admin, 1);
    assert_eq!(changed.last_message_body.as_deref(), Some("help"));

    backend.delete_all(conv.id, true).await.unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Removed(conv.id));

    drop(feed);
    backend.get_or_create(Uuid::new_v4()).await.unwrap();
    assert_eq!(backend.feed_count().await, 0);
}
