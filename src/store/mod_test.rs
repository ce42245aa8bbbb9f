use super::*;
use crate::model::{Role, test_helpers};
use uuid::Uuid;

fn summary(name: &str, code: &str, last: Option<&str>) -> ConversationSummary {
    let mut conversation = Conversation::new(Uuid::new_v4());
    conversation.last_message_body = last.map(str::to_owned);
    ConversationSummary { conversation, student_name: Some(name.to_owned()), student_code: Some(code.to_owned()) }
}

// =============================================================================
// ConversationFilter
// =============================================================================

#[test]
fn empty_filter_matches_everything() {
    let s = summary("Mona", "S-100", None);
    assert!(ConversationFilter::default().matches(&s));
    assert!(ConversationFilter::search("   ").matches(&s));
}

#[test]
fn filter_is_case_insensitive_over_name_code_and_preview() {
    let s = summary("Mona Adel", "S-100", Some("Cannot open Lesson 3"));
    assert!(ConversationFilter::search("mona").matches(&s));
    assert!(ConversationFilter::search("s-10").matches(&s));
    assert!(ConversationFilter::search("LESSON").matches(&s));
    assert!(!ConversationFilter::search("karim").matches(&s));
}

#[test]
fn filter_skips_missing_profile_fields() {
    let mut s = summary("x", "y", None);
    s.student_name = None;
    s.student_code = None;
    assert!(!ConversationFilter::search("x").matches(&s));
}

// =============================================================================
// Frames <-> events
// =============================================================================

#[test]
fn message_broadcast_round_trips_through_frame() {
    let msg = test_helpers::message_at(Uuid::new_v4(), Role::Admin, "hello", 5);
    let frame = Broadcast::Message(msg.clone()).to_frame().unwrap();
    assert_eq!(frame.event, EVENT_MESSAGE);

    let event = ChannelEvent::from_frame(&Frame::decode(&frame.encode().unwrap()).unwrap()).unwrap();
    assert_eq!(event, ChannelEvent::Broadcast(Broadcast::Message(msg)));
}

#[test]
fn clear_broadcast_carries_conversation_id() {
    let conv = Uuid::new_v4();
    let frame = Broadcast::Clear { conversation_id: conv }.to_frame().unwrap();
    let event = ChannelEvent::from_frame(&frame).unwrap();
    assert_eq!(event, ChannelEvent::Broadcast(Broadcast::Clear { conversation_id: conv }));
}

#[test]
fn insert_and_update_frames_decode_typed_rows() {
    let msg = test_helpers::message_at(Uuid::new_v4(), Role::Student, "row", 9);
    let frame = Frame::with_payload(msg.conversation_id, EVENT_MESSAGE_INSERT, &msg).unwrap();
    assert_eq!(ChannelEvent::from_frame(&frame).unwrap(), ChannelEvent::MessageInserted(msg));

    let conv = Conversation::new(Uuid::new_v4());
    let frame = Frame::with_payload(conv.id, EVENT_CONVERSATION_UPDATE, &conv).unwrap();
    assert_eq!(ChannelEvent::from_frame(&frame).unwrap(), ChannelEvent::ConversationChanged(conv));
}

#[test]
fn unknown_event_is_rejected() {
    let frame = Frame::new(Uuid::new_v4(), "typing", crate::frame::Data::new());
    assert!(matches!(ChannelEvent::from_frame(&frame), Err(FrameError::UnknownEvent(e)) if e == "typing"));
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn store_error_codes_and_retryable() {
    assert_eq!(StoreError::ChannelClosed.error_code(), "E_CHANNEL_CLOSED");
    assert!(StoreError::ChannelClosed.retryable());
    assert!(StoreError::Unavailable("down".into()).retryable());
    assert!(!StoreError::InvalidRow("bad".into()).retryable());
    assert!(!StoreError::ConversationNotFound(Uuid::new_v4()).retryable());
}

#[test]
fn static_identity_reports_configured_user() {
    let user = Uuid::new_v4();
    assert_eq!(StaticIdentity(Some(user)).current_user_id(), Some(user));
    assert_eq!(StaticIdentity(None).current_user_id(), None);
}
