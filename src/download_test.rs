use super::*;
use crate::blob::BlobRegistry;
use crate::message::MessageBody;
use crate::message::test_helpers::{confirmed, pending};

fn remote_file(id: i64, path: &str) -> Message {
    let mut message = confirmed(id, "peer", "me", "", 1);
    message.body = MessageBody::File {
        caption: String::new(),
        attachment: AttachmentRef::Remote { path: path.to_owned() },
    };
    message
}

#[test]
fn request_for_text_message_is_none() {
    assert!(DownloadRequest::for_message(&confirmed(1, "peer", "me", "hi", 1)).is_none());
}

#[test]
fn request_for_remote_file_uses_server_path() {
    let request = DownloadRequest::for_message(&remote_file(5, "/api/attachments/report.pdf")).expect("has attachment");
    assert_eq!(request.message_id, MessageId::Server(5));
    assert_eq!(request.file_name, "report.pdf");
    assert_eq!(request.source, DownloadSource::Remote("/api/attachments/report.pdf".to_owned()));
    assert!(!request.is_pending_source());
    assert!(!request.is_image);
}

#[test]
fn request_for_pending_image_uses_local_reference() {
    let blobs = BlobRegistry::new();
    let handle = blobs.create(vec![1_u8]);
    let mut draft = pending(2, "me", "peer", "", 1);
    draft.body = MessageBody::Image {
        caption: String::new(),
        attachment: AttachmentRef::Local { handle, name: "cat.png".to_owned() },
    };

    let request = DownloadRequest::for_message(&draft).expect("has attachment");
    assert!(request.is_pending_source());
    assert!(request.is_image);
    assert_eq!(request.file_name, "cat.png");
    assert_eq!(request.preview(None), DownloadPreview::Image(Some(DisplayHandle::Local(handle))));
}

#[test]
fn remote_previews_use_resolved_handle_or_name() {
    let file = DownloadRequest::for_message(&remote_file(5, "/a/report.pdf")).expect("has attachment");
    assert_eq!(file.preview(None), DownloadPreview::File { name: "report.pdf".to_owned() });

    let mut image = file;
    image.is_image = true;
    assert_eq!(image.preview(None), DownloadPreview::Image(None));
    assert_eq!(image.preview(Some(DisplayHandle::Fallback)), DownloadPreview::Image(Some(DisplayHandle::Fallback)));
}

#[test]
fn flow_moves_closed_confirming_closed() {
    let mut flow = DownloadFlow::new();
    assert_eq!(flow.state(), &DownloadState::Closed);
    assert!(flow.confirm().is_none());

    let request = DownloadRequest::for_message(&remote_file(5, "/a.pdf")).expect("has attachment");
    flow.request(request.clone());
    assert_eq!(flow.state(), &DownloadState::Confirming(request.clone()));

    assert_eq!(flow.confirm(), Some(request));
    assert_eq!(flow.state(), &DownloadState::Closed);
}

#[test]
fn cancel_discards_state() {
    let mut flow = DownloadFlow::new();
    assert!(!flow.cancel());
    flow.request(DownloadRequest::for_message(&remote_file(5, "/a.pdf")).expect("has attachment"));
    assert!(flow.cancel());
    assert_eq!(flow.state(), &DownloadState::Closed);
}

#[test]
fn retarget_follows_promoted_message_only() {
    let blobs = BlobRegistry::new();
    let handle = blobs.create(b"hello".to_vec());
    let mut draft = pending(3, "me", "peer", "", 1);
    draft.body = MessageBody::File {
        caption: String::new(),
        attachment: AttachmentRef::Local { handle, name: "notes.txt".to_owned() },
    };
    let promoted = remote_file(9, "/att/notes.txt");

    let mut flow = DownloadFlow::new();
    assert!(!flow.retarget(draft.id, &promoted));

    flow.request(DownloadRequest::for_message(&draft).expect("has attachment"));
    assert!(!flow.retarget(MessageId::Local(4), &promoted));
    assert!(matches!(flow.state(), DownloadState::Confirming(r) if r.is_pending_source()));

    assert!(flow.retarget(draft.id, &promoted));
    let DownloadState::Confirming(request) = flow.state() else {
        panic!("prompt closed");
    };
    assert_eq!(request.message_id, MessageId::Server(9));
    assert_eq!(request.source, DownloadSource::Remote("/att/notes.txt".to_owned()));
    assert_eq!(request.file_name, "notes.txt");
}

#[test]
fn sanitize_keeps_only_final_component() {
    assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
    assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
    assert_eq!(sanitize_file_name("C:\\Users\\x\\a.txt"), "a.txt");
    assert_eq!(sanitize_file_name(".."), "attachment");
    assert_eq!(sanitize_file_name("dir/"), "attachment");
}

#[tokio::test]
async fn fs_sink_writes_into_its_directory() {
    let dir = std::env::temp_dir().join(format!("storechat-sink-{}", uuid::Uuid::new_v4()));
    let sink = FsDownloadSink::new(&dir);

    let path = sink.save("../escape.txt", Bytes::from_static(b"saved")).await.expect("write succeeds");

    assert_eq!(path, dir.join("escape.txt"));
    assert_eq!(tokio::fs::read(&path).await.expect("file exists"), b"saved");
    tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
}
