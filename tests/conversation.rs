//! Full client stack against a relay server that echoes sends over the push channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use frames::{EVENT_MESSAGE_NEW, Frame};
use serde_json::json;
use storechat::attachment::DisplayHandle;
use storechat::download::DownloadOutcome;
use storechat::{
    ChatConfig, ChatEngine, ChatHandle, ConnectionStatus, Draft, DraftFile, MessageId, ThreadSnapshot,
    spawn_push_channel,
};
use tokio::sync::broadcast;

#[derive(Clone)]
struct Relay {
    frames: broadcast::Sender<String>,
    next_id: Arc<AtomicI64>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

async fn history() -> axum::Json<serde_json::Value> {
    axum::Json(json!([
        {"id": 1, "sender_id": "peer", "recipient_id": "me", "content": "is this in stock?", "kind": "text", "created_at": 10}
    ]))
}

async fn relay_send(State(relay): State<Relay>, mut multipart: Multipart) -> StatusCode {
    let mut fields = HashMap::new();
    let mut attachment = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_owned();
        if let Some(file_name) = field.file_name().map(str::to_owned) {
            let bytes = field.bytes().await.unwrap_or_default();
            relay.files.lock().unwrap().insert(file_name.clone(), bytes.to_vec());
            attachment = Some(format!("/files/{file_name}"));
        } else {
            fields.insert(name, field.text().await.unwrap_or_default());
        }
    }

    let id = relay.next_id.fetch_add(1, Ordering::SeqCst);
    let payload = json!({
        "id": id,
        "sender_id": fields.get("sender_id"),
        "recipient_id": fields.get("recipient_id"),
        "content": fields.get("content"),
        "kind": fields.get("kind"),
        "attachment": attachment,
        "created_at": 1_000 + id,
        "client_ref": fields.get("client_ref"),
    });
    let frame = Frame::done(format!("frame-{id}"), EVENT_MESSAGE_NEW, 1_000 + id, payload);
    let _ = relay.frames.send(frames::encode_text_frame(&frame).unwrap());
    StatusCode::CREATED
}

async fn file(State(relay): State<Relay>, Path(name): Path<String>) -> Response {
    match relay.files.lock().unwrap().get(&name) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(State(relay): State<Relay>, ws: WebSocketUpgrade) -> Response {
    let mut frames = relay.frames.subscribe();
    ws.on_upgrade(move |mut socket: WebSocket| async move {
        while let Ok(text) = frames.recv().await {
            if socket.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    })
}

async fn serve(download_dir: &std::path::Path) -> ChatConfig {
    let relay = Relay {
        frames: broadcast::channel(64).0,
        next_id: Arc::new(AtomicI64::new(100)),
        files: Arc::default(),
    };
    let app = Router::new()
        .route("/api/messages/{peer_id}", get(history))
        .route("/api/messages", post(relay_send))
        .route("/files/{name}", get(file))
        .route("/api/ws", get(ws_handler))
        .with_state(relay);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let mut config = ChatConfig::new(&format!("http://{addr}"), "me", "relay-token");
    config.download_dir = download_dir.to_path_buf();
    config
}

async fn wait_for(handle: &ChatHandle, what: &str, predicate: impl Fn(&ThreadSnapshot) -> bool) -> ThreadSnapshot {
    let mut rx = handle.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            rx.changed().await.unwrap();
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test]
async fn send_confirm_and_download_over_real_transports() {
    let dir = std::env::temp_dir().join(format!("storechat-e2e-{}", uuid::Uuid::new_v4()));
    let config = serve(&dir).await;

    let engine = ChatEngine::from_config(&config).unwrap();
    let blobs = engine.blobs().clone();
    let (push_task, push_rx) = spawn_push_channel(&config, config.session());
    let (handle, engine_task) = engine.spawn(push_rx);

    wait_for(&handle, "connection", |s| s.connection == ConnectionStatus::Connected).await;
    handle.open_thread("peer").await.unwrap();
    assert_eq!(handle.snapshot().message_count(), 1);

    let local = handle.send_message(Draft::text("yes, two left")).await.unwrap();
    assert!(local.is_local());
    let snapshot = wait_for(&handle, "text echo", |s| s.find(MessageId::Server(100)).is_some()).await;
    assert_eq!(snapshot.message_count(), 2);
    assert_eq!(snapshot.pending_count(), 0);
    assert!(snapshot.find(local).is_none());

    let photo = DraftFile::new("shelf.png", b"png-bytes".to_vec());
    let image_local = handle.send_message(Draft::image(photo, "")).await.unwrap();
    let snapshot = wait_for(&handle, "image display", |s| {
        s.find(MessageId::Server(101)).is_some_and(|view| view.display.is_some())
    })
    .await;
    assert!(snapshot.find(image_local).is_none());
    let display = snapshot.find(MessageId::Server(101)).and_then(|view| view.display);
    let Some(DisplayHandle::Local(handle_ref)) = display else {
        panic!("expected a resolved image, got {display:?}");
    };
    assert_eq!(blobs.get(handle_ref).as_deref(), Some(&b"png-bytes"[..]));

    handle.request_download(MessageId::Server(101)).await.unwrap();
    handle.confirm_download().await.unwrap();
    let snapshot = wait_for(&handle, "download", |s| s.last_download.is_some()).await;
    let Some(DownloadOutcome::Saved { path, .. }) = snapshot.last_download else {
        panic!("download failed: {:?}", snapshot.last_download);
    };
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"png-bytes");

    handle.shutdown().await.unwrap();
    engine_task.await.unwrap();
    push_task.abort();
    assert_eq!(blobs.live_count(), 0);
    let _ = tokio::fs::remove_dir_all(&dir).await;
}
