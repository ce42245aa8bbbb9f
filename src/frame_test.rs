use super::*;
use crate::model::{Message, Role, test_helpers};

#[test]
fn new_sets_fields() {
    let conv = Uuid::new_v4();
    let frame = Frame::new(conv, EVENT_CLEAR, Data::new());
    assert_eq!(frame.event, "clear");
    assert_eq!(frame.conversation_id, conv);
    assert!(frame.from.is_none());
    assert!(frame.ts > 0);
}

#[test]
fn broadcast_events_are_flagged() {
    let conv = Uuid::new_v4();
    assert!(Frame::new(conv, EVENT_MESSAGE, Data::new()).is_broadcast());
    assert!(Frame::new(conv, EVENT_CLEAR, Data::new()).is_broadcast());
    assert!(!Frame::new(conv, EVENT_MESSAGE_INSERT, Data::new()).is_broadcast());
    assert!(!Frame::new(conv, EVENT_CONVERSATION_UPDATE, Data::new()).is_broadcast());
    assert!(!Frame::new(conv, EVENT_CONVERSATION_DELETE, Data::new()).is_broadcast());
}

#[test]
fn encoded_len_counts_bytes_and_escapes() {
    assert_eq!(Frame::encoded_len("hi"), 4);
    assert_eq!(Frame::encoded_len("😀"), 6);
    assert_eq!(Frame::encoded_len("a\nb"), 6);
    assert_eq!(Frame::encoded_len("\u{1}"), 8);
}

#[test]
fn message_payload_survives_encode_decode() {
    let msg = test_helpers::message_at(Uuid::new_v4(), Role::Student, "مرحبا", 42);
    let frame = Frame::with_payload(msg.conversation_id, EVENT_MESSAGE, &msg)
        .unwrap()
        .with_from(msg.sender_id.to_string());

    let raw = frame.encode().unwrap();
    let restored = Frame::decode(&raw).unwrap();
    assert_eq!(restored.id, frame.id);
    assert_eq!(restored.event, EVENT_MESSAGE);
    assert_eq!(restored.from.as_deref(), Some(msg.sender_id.to_string().as_str()));

    let decoded: Message = restored.payload().unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn payload_rejects_unknown_role() {
    let msg = test_helpers::message_at(Uuid::new_v4(), Role::Admin, "x", 1);
    let mut frame = Frame::with_payload(msg.conversation_id, EVENT_MESSAGE, &msg).unwrap();
    frame.data.insert("sender_role".into(), "staff".into());
    assert!(matches!(frame.payload::<Message>(), Err(FrameError::Payload(_))));
}

#[test]
fn with_payload_rejects_non_object() {
    let err = Frame::with_payload(Uuid::new_v4(), EVENT_MESSAGE, &"plain string").unwrap_err();
    assert!(matches!(err, FrameError::NotAnObject));
    assert_eq!(err.error_code(), "E_FRAME_SHAPE");
}

#[test]
fn decode_rejects_garbage() {
    let err = Frame::decode("not json").unwrap_err();
    assert_eq!(err.error_code(), "E_FRAME_PAYLOAD");
    assert!(!err.retryable());
}
