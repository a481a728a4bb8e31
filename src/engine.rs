//! Conversation engine: the single writer of the open thread.
//!
//! DESIGN
//! ======
//! User commands, push events, and completions of spawned network work are
//! all applied by one task, one at a time, so store mutations never
//! interleave. The order in which a draft's submission result and its echo
//! arrive is not assumed; reconciliation handles either.
//!
//! LIFECYCLE
//! =========
//! Opening a thread starts a new epoch. Spawned work (attachment resolution,
//! send submission, downloads) carries the epoch it started under; a
//! completion from an older epoch is discarded and any local reference it
//! carries is released. Closing a thread releases every reference the thread
//! held: resolved previews and pending draft attachments.

#[path = "engine_handle.rs"]
mod handle;
#[path = "engine_snapshot.rs"]
mod snapshot;

pub use handle::ChatHandle;
pub use snapshot::{MessageView, ThreadSnapshot};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::api::{ApiError, ChatApi, HttpChatApi};
use crate::attachment::{AttachmentCache, DisplayHandle, resolve_attachment};
use crate::blob::BlobRegistry;
use crate::config::ChatConfig;
use crate::download::{DownloadFlow, DownloadOutcome, DownloadPreview, DownloadRequest, DownloadSink, DownloadSource, FsDownloadSink};
use crate::message::{AttachmentRef, Delivery, MessageId, MessageKind, MessagePayload, now_ms};
use crate::push::{ConnectionStatus, PushEvent};
use crate::reconcile::{EchoMatcher, Reconciliation, ThreadKey, reconcile};
use crate::send::{Draft, DraftError, PendingIds, SendRequest, new_client_ref, prepare_send, resend_request};
use crate::session::Session;
use crate::store::MessageStore;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error("no conversation is open")]
    NoOpenThread,
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    #[error("message {0} has no attachment")]
    NoAttachment(MessageId),
    #[error("no download is awaiting confirmation")]
    NotConfirming,
    #[error("message {0} cannot be resent")]
    NotResendable(MessageId),
    #[error("attachment of message {0} is no longer held locally")]
    AttachmentReleased(MessageId),
    #[error("history fetch failed: {0}")]
    History(#[source] ApiError),
    #[error("chat engine stopped")]
    EngineStopped,
}

/// Result of spawned work, applied back on the engine task.
#[derive(Debug)]
enum Completion {
    SendSettled { epoch: u64, message_id: MessageId, client_ref: String, result: Result<(), String> },
    AttachmentResolved { epoch: u64, message_id: MessageId, handle: DisplayHandle },
    DownloadFinished { epoch: u64, outcome: DownloadOutcome },
}

struct OpenThread {
    peer_id: String,
    epoch: u64,
    store: MessageStore,
    previews: AttachmentCache,
    download: DownloadFlow,
    revision_base: u64,
}

pub struct ChatEngine {
    session: Session,
    api: Arc<dyn ChatApi>,
    sink: Arc<dyn DownloadSink>,
    matcher: EchoMatcher,
    blobs: BlobRegistry,
    ids: PendingIds,
    epoch: Arc<AtomicU64>,
    thread: Option<OpenThread>,
    connection: ConnectionStatus,
    last_download: Option<DownloadOutcome>,
    revision_floor: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    snapshot_tx: watch::Sender<ThreadSnapshot>,
}

impl ChatEngine {
    #[must_use]
    pub fn new(session: Session, api: Arc<dyn ChatApi>, sink: Arc<dyn DownloadSink>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(ThreadSnapshot::default());
        Self {
            session,
            api,
            sink,
            matcher: EchoMatcher::default(),
            blobs: BlobRegistry::new(),
            ids: PendingIds::new(),
            epoch: Arc::new(AtomicU64::new(0)),
            thread: None,
            connection: ConnectionStatus::Disconnected,
            last_download: None,
            revision_floor: 0,
            completions_tx,
            completions_rx,
            snapshot_tx,
        }
    }

    /// Engine backed by the HTTP client and a filesystem download sink.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the HTTP client fails to build.
    pub fn from_config(config: &ChatConfig) -> Result<Self, ApiError> {
        let api = Arc::new(HttpChatApi::new(config)?);
        let sink = Arc::new(FsDownloadSink::new(config.download_dir.clone()));
        Ok(Self::new(config.session(), api, sink).with_matcher(EchoMatcher::new(config.match_window)))
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: EchoMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Registry behind every local reference the engine hands out.
    #[must_use]
    pub fn blobs(&self) -> &BlobRegistry {
        &self.blobs
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ThreadSnapshot> {
        self.snapshot_tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> ThreadSnapshot {
        let viewer_id = self.session.user_id();
        let Some(thread) = &self.thread else {
            return ThreadSnapshot {
                connection: self.connection,
                last_download: self.last_download.clone(),
                revision: self.revision_floor,
                ..ThreadSnapshot::default()
            };
        };
        ThreadSnapshot {
            peer_id: Some(thread.peer_id.clone()),
            connection: self.connection,
            messages: thread
                .store
                .messages()
                .iter()
                .map(|message| snapshot::message_view(message, viewer_id, &thread.previews))
                .collect(),
            download: thread.download.state().clone(),
            preview: snapshot::preview_for(thread.download.state(), &thread.previews),
            last_download: self.last_download.clone(),
            revision: thread.revision_base + thread.store.revision(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn current_revision(&self) -> u64 {
        self.thread.as_ref().map_or(self.revision_floor, |t| t.revision_base + t.store.revision())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.thread.as_ref().is_some_and(|t| t.epoch == epoch)
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    // =========================================================================
    // THREAD LIFECYCLE
    // =========================================================================

    /// Open the conversation with `peer_id`, replacing any open one.
    ///
    /// The store is rebuilt from the server backlog. Confirmed image
    /// attachments start resolving in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::History`] when the backlog fetch fails; the thread
    /// is still open (empty) so live messages keep arriving.
    pub async fn open_thread(&mut self, peer_id: &str) -> Result<(), ChatError> {
        self.close_thread();
        let epoch = self.next_epoch();
        let revision_base = self.current_revision() + 1;

        let backlog = self.api.history(&self.session, peer_id).await;
        let (rows, result) = match backlog {
            Ok(rows) => (rows, Ok(())),
            Err(error) => {
                warn!(peer_id, %error, "history fetch failed; opening empty thread");
                (Vec::new(), Err(ChatError::History(error)))
            }
        };

        let store = MessageStore::from_backlog(rows.into_iter().filter_map(|payload| {
            let id = payload.id;
            payload
                .into_message()
                .inspect_err(|error| warn!(message_id = id, %error, "skipping history row"))
                .ok()
        }));
        info!(peer_id, epoch, messages = store.len(), "thread opened");

        let images: Vec<_> = store.messages().iter().filter_map(remote_image).collect();
        self.last_download = None;
        self.thread = Some(OpenThread {
            peer_id: peer_id.to_owned(),
            epoch,
            store,
            previews: AttachmentCache::new(self.blobs.clone()),
            download: DownloadFlow::new(),
            revision_base,
        });
        for (message_id, path) in images {
            self.spawn_resolve(epoch, message_id, path);
        }
        self.publish();
        result
    }

    /// Tear down the open thread and release every local reference it held.
    pub fn close_thread(&mut self) {
        let revision_floor = self.current_revision() + 1;
        let Some(mut thread) = self.thread.take() else {
            return;
        };
        self.revision_floor = revision_floor;
        self.next_epoch();

        let mut released = thread.previews.release_all();
        for message in thread.store.messages() {
            if let Some(handle) = message.attachment().and_then(AttachmentRef::local_handle)
                && self.blobs.release(handle)
            {
                released += 1;
            }
        }
        info!(peer_id = %thread.peer_id, released, "thread closed");
        self.publish();
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Insert a pending record for `draft` and submit it in the background.
    ///
    /// # Errors
    ///
    /// [`ChatError::NoOpenThread`] or an invalid draft.
    pub fn send_message(&mut self, draft: Draft) -> Result<MessageId, ChatError> {
        let Some(thread) = self.thread.as_mut() else {
            return Err(ChatError::NoOpenThread);
        };
        let sent_at = now_ms();
        let id = self.ids.next(sent_at);
        let prepared = prepare_send(draft, &self.session, &thread.peer_id, id, sent_at, &self.blobs)?;
        let client_ref = prepared.request.client_ref.clone();
        thread.store.append(prepared.message);
        let epoch = thread.epoch;
        debug!(message_id = %id, %client_ref, "pending message inserted");

        self.spawn_submit(epoch, id, prepared.request);
        self.publish();
        Ok(id)
    }

    /// Resubmit a pending message whose submission failed.
    ///
    /// The record keeps its list position and local id; its error clears and
    /// its send time refreshes so the new echo can match.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotResendable`] unless the message is pending with a
    /// send error; [`ChatError::AttachmentReleased`] if its draft file is gone.
    pub fn resend(&mut self, id: MessageId) -> Result<(), ChatError> {
        let Some(thread) = self.thread.as_mut() else {
            return Err(ChatError::NoOpenThread);
        };
        let message = thread.store.get(id).ok_or(ChatError::UnknownMessage(id))?;
        if message.send_error().is_none() {
            return Err(ChatError::NotResendable(id));
        }
        let client_ref = new_client_ref();
        let request = resend_request(message, client_ref.clone(), &self.blobs).ok_or(ChatError::AttachmentReleased(id))?;

        let sent_at = now_ms();
        thread.store.replace(
            |m| m.id == id,
            |m| {
                m.created_at = sent_at;
                m.delivery = Delivery::Pending { sent_at, client_ref, error: None };
            },
        );
        let epoch = thread.epoch;
        info!(message_id = %id, "resending message");

        self.spawn_submit(epoch, id, request);
        self.publish();
        Ok(())
    }

    fn spawn_submit(&self, epoch: u64, message_id: MessageId, request: SendRequest) {
        let api = Arc::clone(&self.api);
        let session = self.session.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let client_ref = request.client_ref.clone();
            let result = api.send(&session, request).await.map_err(|error| error.to_string());
            let completion = Completion::SendSettled { epoch, message_id, client_ref, result };
            if tx.send(completion).is_err() {
                debug!(message_id = %message_id, "engine stopped before send settled");
            }
        });
    }

    // =========================================================================
    // PUSH
    // =========================================================================

    /// Apply one push-channel event.
    pub fn handle_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Status(status) => self.set_connection(status),
            PushEvent::Message(payload) => self.integrate(payload),
        }
    }

    fn set_connection(&mut self, status: ConnectionStatus) {
        if self.connection == status {
            return;
        }
        info!(?status, "push channel status");
        self.connection = status;
        self.publish();
    }

    fn integrate(&mut self, payload: MessagePayload) {
        let viewer_id = self.session.user_id();
        let Some(thread) = self.thread.as_mut() else {
            debug!(message_id = payload.id, "no open thread; dropping push message");
            return;
        };
        let client_ref = payload.client_ref.clone();
        let message = match payload.into_message() {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "skipping push message");
                return;
            }
        };
        let own = message.sender_id == viewer_id;
        let image = remote_image(&message);

        let key = ThreadKey { viewer_id, peer_id: &thread.peer_id };
        let outcome = reconcile(&mut thread.store, message, client_ref.as_deref(), key, &self.matcher);
        let epoch = thread.epoch;

        let integrated = match outcome {
            Reconciliation::Promoted { local_id, server_id, released } => {
                if let Some(promoted) = thread.store.get(server_id)
                    && thread.download.retarget(local_id, promoted)
                {
                    debug!(%local_id, %server_id, "download prompt follows confirmed message");
                }
                if let Some(handle) = released {
                    self.blobs.release(handle);
                }
                debug!(%local_id, %server_id, "pending message confirmed");
                true
            }
            Reconciliation::Appended(id) => {
                if own {
                    warn!(message_id = %id, "own message had no pending match");
                } else {
                    debug!(message_id = %id, "inbound message appended");
                }
                true
            }
            Reconciliation::Duplicate(id) => {
                debug!(message_id = %id, "duplicate push message dropped");
                false
            }
            Reconciliation::Foreign(id) => {
                debug!(message_id = %id, "push message for another conversation");
                false
            }
        };

        if integrated {
            if let Some((message_id, path)) = image {
                self.spawn_resolve(epoch, message_id, path);
            }
            self.publish();
        }
    }

    // =========================================================================
    // ATTACHMENTS
    // =========================================================================

    fn spawn_resolve(&self, epoch: u64, message_id: MessageId, path: String) {
        let api = Arc::clone(&self.api);
        let session = self.session.clone();
        let blobs = self.blobs.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let handle = resolve_attachment(api.as_ref(), &session, &path, &blobs).await;
            if tx.send(Completion::AttachmentResolved { epoch, message_id, handle }).is_err()
                && let Some(local) = handle.local_ref()
            {
                blobs.release(local);
            }
        });
    }

    // =========================================================================
    // DOWNLOADS
    // =========================================================================

    /// Open the confirmation prompt for a message's attachment.
    ///
    /// # Errors
    ///
    /// [`ChatError::UnknownMessage`] or [`ChatError::NoAttachment`].
    pub fn request_download(&mut self, id: MessageId) -> Result<DownloadPreview, ChatError> {
        let Some(thread) = self.thread.as_mut() else {
            return Err(ChatError::NoOpenThread);
        };
        let message = thread.store.get(id).ok_or(ChatError::UnknownMessage(id))?;
        let request = DownloadRequest::for_message(message).ok_or(ChatError::NoAttachment(id))?;
        let preview = request.preview(thread.previews.get(id));
        debug!(message_id = %id, pending = request.is_pending_source(), "download requested");
        thread.download.request(request);
        self.publish();
        Ok(preview)
    }

    /// Carry out the download awaiting confirmation.
    ///
    /// Pending drafts save from their local reference; confirmed attachments
    /// are fetched with the bearer credential first. The outcome lands in
    /// [`ThreadSnapshot::last_download`].
    ///
    /// # Errors
    ///
    /// [`ChatError::NotConfirming`] when no prompt is open.
    pub fn confirm_download(&mut self) -> Result<(), ChatError> {
        let Some(thread) = self.thread.as_mut() else {
            return Err(ChatError::NoOpenThread);
        };
        let request = thread.download.confirm().ok_or(ChatError::NotConfirming)?;
        let epoch = thread.epoch;

        let source = match request.source {
            DownloadSource::Local(handle) => match self.blobs.get(handle) {
                Some(bytes) => Fetch::Ready(bytes),
                None => {
                    let error = ChatError::AttachmentReleased(request.message_id).to_string();
                    self.last_download = Some(DownloadOutcome::Failed { message_id: request.message_id, error });
                    self.publish();
                    return Ok(());
                }
            },
            DownloadSource::Remote(path) => Fetch::Remote(path),
        };
        info!(message_id = %request.message_id, file = %request.file_name, "download confirmed");
        self.spawn_download(epoch, request.message_id, request.file_name, source);
        self.publish();
        Ok(())
    }

    /// Close the prompt without downloading. False if none was open.
    pub fn cancel_download(&mut self) -> bool {
        let cancelled = self.thread.as_mut().is_some_and(|t| t.download.cancel());
        if cancelled {
            self.publish();
        }
        cancelled
    }

    fn spawn_download(&self, epoch: u64, message_id: MessageId, file_name: String, source: Fetch) {
        let api = Arc::clone(&self.api);
        let sink = Arc::clone(&self.sink);
        let session = self.session.clone();
        let current = Arc::clone(&self.epoch);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let bytes = match source {
                Fetch::Ready(bytes) => Ok(bytes),
                Fetch::Remote(path) => api.fetch_attachment(&session, &path).await.map_err(|e| e.to_string()),
            };
            if current.load(Ordering::SeqCst) != epoch {
                debug!(%message_id, "thread closed before download finished; not saving");
                return;
            }
            let outcome = match bytes {
                Ok(bytes) => match sink.save(&file_name, bytes).await {
                    Ok(path) => DownloadOutcome::Saved { message_id, path },
                    Err(error) => DownloadOutcome::Failed { message_id, error: error.to_string() },
                },
                Err(error) => DownloadOutcome::Failed { message_id, error },
            };
            if tx.send(Completion::DownloadFinished { epoch, outcome }).is_err() {
                debug!(%message_id, "engine stopped before download finished");
            }
        });
    }

    // =========================================================================
    // COMPLETIONS
    // =========================================================================

    fn apply_completion(&mut self, completion: Completion) {
        match completion {
            Completion::SendSettled { epoch, message_id, client_ref, result } => {
                self.apply_send_result(epoch, message_id, &client_ref, result);
            }
            Completion::AttachmentResolved { epoch, message_id, handle } => {
                let current = self.is_current(epoch);
                match self.thread.as_mut() {
                    Some(thread) if current => {
                        thread.previews.insert(message_id, handle);
                        self.publish();
                    }
                    _ => {
                        debug!(%message_id, "stale attachment resolution discarded");
                        if let Some(local) = handle.local_ref() {
                            self.blobs.release(local);
                        }
                    }
                }
            }
            Completion::DownloadFinished { epoch, outcome } => {
                if !self.is_current(epoch) {
                    debug!("stale download outcome discarded");
                    return;
                }
                match &outcome {
                    DownloadOutcome::Saved { message_id, path } => {
                        info!(%message_id, path = %path.display(), "download saved");
                    }
                    DownloadOutcome::Failed { message_id, error } => {
                        warn!(%message_id, %error, "download failed");
                    }
                }
                self.last_download = Some(outcome);
                self.publish();
            }
        }
    }

    fn apply_send_result(&mut self, epoch: u64, id: MessageId, client_ref: &str, result: Result<(), String>) {
        if !self.is_current(epoch) {
            debug!(message_id = %id, "stale send result discarded");
            return;
        }
        let error = match result {
            Ok(()) => {
                debug!(message_id = %id, "send acknowledged; awaiting echo");
                return;
            }
            Err(error) => error,
        };
        warn!(message_id = %id, %error, "send failed; message left pending");
        let Some(thread) = self.thread.as_mut() else {
            return;
        };
        let marked = thread.store.replace(
            |m| m.id == id && m.client_ref() == Some(client_ref),
            |m| {
                if let Delivery::Pending { error: slot, .. } = &mut m.delivery {
                    *slot = Some(error);
                }
            },
        );
        if marked {
            self.publish();
        }
    }

    /// Wait for the next completion and apply it. Test hook for the event loop.
    #[cfg(test)]
    async fn settle_next(&mut self) {
        if let Some(completion) = self.completions_rx.recv().await {
            self.apply_completion(completion);
        }
    }
}

/// Bytes source for a confirmed download.
enum Fetch {
    Ready(Bytes),
    Remote(String),
}

fn remote_image(message: &crate::message::Message) -> Option<(MessageId, String)> {
    if message.kind() != MessageKind::Image || message.is_pending() {
        return None;
    }
    match message.attachment()? {
        AttachmentRef::Remote { path } => Some((message.id, path.clone())),
        AttachmentRef::Local { .. } => None,
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
