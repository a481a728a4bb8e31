use super::*;
use crate::blob::BlobRegistry;

fn payload(kind: MessageKind, attachment: Option<&str>) -> MessagePayload {
    MessagePayload {
        id: 41,
        sender_id: "peer".to_owned(),
        recipient_id: "me".to_owned(),
        content: "look".to_owned(),
        kind,
        attachment: attachment.map(str::to_owned),
        created_at: 1_000,
        client_ref: None,
    }
}

// =============================================================================
// MessageId / MessageKind
// =============================================================================

#[test]
fn local_and_server_ids_never_compare_equal() {
    assert_ne!(MessageId::Local(7), MessageId::Server(7));
    assert!(MessageId::Local(7).is_local());
    assert!(!MessageId::Server(7).is_local());
    assert_eq!(MessageId::Local(7).to_string(), "local-7");
    assert_eq!(MessageId::Server(7).to_string(), "7");
}

#[test]
fn kind_parse_accepts_wire_names_only() {
    for kind in [MessageKind::Text, MessageKind::Emoji, MessageKind::Image, MessageKind::File] {
        assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(MessageKind::parse("video"), None);
    assert!(MessageKind::Image.has_attachment());
    assert!(!MessageKind::Emoji.has_attachment());
}

// =============================================================================
// AttachmentRef
// =============================================================================

#[test]
fn remote_file_name_is_last_path_segment_without_query() {
    let remote = AttachmentRef::Remote { path: "/api/attachments/2024/receipt.pdf?sig=abc".to_owned() };
    assert_eq!(remote.file_name(), "receipt.pdf");
}

#[test]
fn remote_file_name_falls_back_for_trailing_slash() {
    let remote = AttachmentRef::Remote { path: "/api/attachments/".to_owned() };
    assert_eq!(remote.file_name(), "attachment");
}

#[test]
fn local_attachment_exposes_handle_and_name() {
    let blobs = BlobRegistry::new();
    let handle = blobs.create(vec![0_u8; 4]);
    let local = AttachmentRef::Local { handle, name: "photo.png".to_owned() };
    assert_eq!(local.file_name(), "photo.png");
    assert_eq!(local.local_handle(), Some(handle));
}

// =============================================================================
// MessagePayload
// =============================================================================

#[test]
fn payload_deserializes_float_encoded_integers() {
    let value = serde_json::json!({
        "id": 12.0,
        "sender_id": "a",
        "recipient_id": "b",
        "kind": "emoji",
        "content": "👍",
        "created_at": 1_700_000_000_000.0_f64
    });
    let parsed: MessagePayload = serde_json::from_value(value).expect("payload should parse");
    assert_eq!(parsed.id, 12);
    assert_eq!(parsed.created_at, 1_700_000_000_000);
    assert!(parsed.attachment.is_none());
    assert!(parsed.client_ref.is_none());
}

#[test]
fn payload_rejects_fractional_id_and_unknown_kind() {
    let fractional = serde_json::json!({
        "id": 1.5, "sender_id": "a", "recipient_id": "b", "kind": "text", "created_at": 1
    });
    assert!(serde_json::from_value::<MessagePayload>(fractional).is_err());

    let unknown = serde_json::json!({
        "id": 1, "sender_id": "a", "recipient_id": "b", "kind": "sticker", "created_at": 1
    });
    assert!(serde_json::from_value::<MessagePayload>(unknown).is_err());
}

#[test]
fn image_payload_becomes_confirmed_image_with_remote_ref() {
    let message = payload(MessageKind::Image, Some("/api/attachments/a.png"))
        .into_message()
        .expect("image with attachment converts");
    assert_eq!(message.id, MessageId::Server(41));
    assert!(!message.is_pending());
    assert_eq!(message.kind(), MessageKind::Image);
    assert_eq!(message.content(), "look");
    assert_eq!(
        message.attachment(),
        Some(&AttachmentRef::Remote { path: "/api/attachments/a.png".to_owned() })
    );
}

#[test]
fn attachment_kinds_require_a_path() {
    let err = payload(MessageKind::File, Some("  ")).into_message().expect_err("blank path rejected");
    assert_eq!(err, PayloadError::MissingAttachment { id: 41, kind: MessageKind::File });
}

#[test]
fn text_payload_ignores_stray_attachment() {
    let message = payload(MessageKind::Text, Some("/x.png")).into_message().expect("text converts");
    assert_eq!(message.body, MessageBody::Text("look".to_owned()));
    assert!(message.attachment().is_none());
}

// =============================================================================
// Message helpers
// =============================================================================

#[test]
fn alignment_and_membership_follow_participants() {
    let message = payload(MessageKind::Text, None).into_message().expect("converts");
    assert_eq!(message.alignment("me"), Alignment::Received);
    assert_eq!(message.alignment("peer"), Alignment::Sent);
    assert!(message.belongs_to("me", "peer"));
    assert!(message.belongs_to("peer", "me"));
    assert!(!message.belongs_to("me", "someone-else"));
}

#[test]
fn pending_accessors_expose_delivery_fields() {
    let mut message = payload(MessageKind::Text, None).into_message().expect("converts");
    assert_eq!(message.sent_at(), None);
    message.delivery = Delivery::Pending { sent_at: 99, client_ref: "ref-1".to_owned(), error: Some("offline".to_owned()) };
    assert!(message.is_pending());
    assert_eq!(message.sent_at(), Some(99));
    assert_eq!(message.client_ref(), Some("ref-1"));
    assert_eq!(message.send_error(), Some("offline"));
}

#[test]
fn now_ms_is_after_2020() {
    assert!(now_ms() > 1_577_836_800_000);
}
