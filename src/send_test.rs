use super::*;

fn session() -> Session {
    Session::new("me", "tok")
}

#[test]
fn validate_rejects_blank_text_and_mismatched_files() {
    assert_eq!(Draft::text("   ").validate(), Err(DraftError::Empty));
    assert_eq!(Draft::emoji("").validate(), Err(DraftError::Empty));
    assert!(Draft::text("hi").validate().is_ok());

    let missing = Draft { content: "x".to_owned(), kind: MessageKind::Image, file: None };
    assert_eq!(missing.validate(), Err(DraftError::MissingFile(MessageKind::Image)));

    let stray = Draft { content: "x".to_owned(), kind: MessageKind::Text, file: Some(DraftFile::new("a", vec![1])) };
    assert_eq!(stray.validate(), Err(DraftError::UnexpectedFile(MessageKind::Text)));
}

#[test]
fn file_draft_may_have_empty_caption() {
    assert!(Draft::file(DraftFile::new("r.pdf", vec![1, 2]), "").validate().is_ok());
}

#[test]
fn pending_ids_are_strictly_increasing() {
    let mut ids = PendingIds::new();
    assert_eq!(ids.next(1_000), MessageId::Local(1_000));
    assert_eq!(ids.next(1_000), MessageId::Local(1_001));
    assert_eq!(ids.next(900), MessageId::Local(1_002));
    assert_eq!(ids.next(5_000), MessageId::Local(5_000));
}

#[test]
fn text_draft_becomes_pending_record_and_request() {
    let blobs = BlobRegistry::new();
    let prepared =
        prepare_send(Draft::text("hi"), &session(), "peer", MessageId::Local(5), 1_234, &blobs).expect("valid draft");

    let message = &prepared.message;
    assert_eq!(message.id, MessageId::Local(5));
    assert_eq!(message.sender_id, "me");
    assert_eq!(message.recipient_id, "peer");
    assert_eq!(message.created_at, 1_234);
    assert_eq!(message.sent_at(), Some(1_234));
    assert!(message.send_error().is_none());
    assert_eq!(message.client_ref(), Some(prepared.request.client_ref.as_str()));
    assert!(uuid::Uuid::parse_str(&prepared.request.client_ref).is_ok());

    assert_eq!(prepared.request.content, "hi");
    assert_eq!(prepared.request.kind, MessageKind::Text);
    assert!(prepared.request.file.is_none());
    assert_eq!(blobs.live_count(), 0);
}

#[test]
fn image_draft_is_visible_locally_before_upload() {
    let blobs = BlobRegistry::new();
    let file = DraftFile::new("cat.png", vec![9_u8, 9, 9]);
    let prepared = prepare_send(Draft::image(file.clone(), ""), &session(), "peer", MessageId::Local(1), 1, &blobs)
        .expect("valid draft");

    let Some(AttachmentRef::Local { handle, name }) = prepared.message.attachment() else {
        panic!("pending image should hold a local reference");
    };
    assert_eq!(name, "cat.png");
    assert_eq!(blobs.get(*handle), Some(file.bytes.clone()));
    assert_eq!(blobs.live_count(), 1);
    assert_eq!(prepared.request.file, Some(file));
}

#[test]
fn invalid_draft_allocates_nothing() {
    let blobs = BlobRegistry::new();
    let err = prepare_send(Draft::text(""), &session(), "peer", MessageId::Local(1), 1, &blobs)
        .expect_err("empty draft rejected");
    assert_eq!(err, DraftError::Empty);
    assert_eq!(blobs.live_count(), 0);
}

#[test]
fn correlation_tokens_are_unique() {
    assert_ne!(new_client_ref(), new_client_ref());
}

#[test]
fn resend_request_reuses_local_file_bytes() {
    let blobs = BlobRegistry::new();
    let file = DraftFile::new("doc.txt", b"hello".to_vec());
    let prepared = prepare_send(Draft::file(file.clone(), "notes"), &session(), "peer", MessageId::Local(1), 1, &blobs)
        .expect("valid draft");

    let request = resend_request(&prepared.message, "ref-new".to_owned(), &blobs).expect("pending is resendable");
    assert_eq!(request.client_ref, "ref-new");
    assert_eq!(request.content, "notes");
    assert_eq!(request.file, Some(file));
}

#[test]
fn resend_request_refuses_confirmed_or_released() {
    let blobs = BlobRegistry::new();
    let prepared =
        prepare_send(Draft::image(DraftFile::new("a.png", vec![1]), ""), &session(), "peer", MessageId::Local(1), 1, &blobs)
            .expect("valid draft");
    if let Some(handle) = prepared.message.attachment().and_then(AttachmentRef::local_handle) {
        blobs.release(handle);
    }
    assert!(resend_request(&prepared.message, "r".to_owned(), &blobs).is_none());

    let mut confirmed = prepared.message;
    confirmed.delivery = Delivery::Confirmed;
    assert!(resend_request(&confirmed, "r".to_owned(), &blobs).is_none());
}
