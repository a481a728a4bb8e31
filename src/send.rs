//! Optimistic send pipeline: drafts become pending records before any
//! network traffic.
//!
//! Submitting the [`SendRequest`] never confirms the record. Confirmation
//! arrives only through reconciliation, whichever of the sender's echo or
//! the submission acknowledgement lands first.

use bytes::Bytes;

use crate::blob::BlobRegistry;
use crate::message::{AttachmentRef, Delivery, Message, MessageBody, MessageId, MessageKind};
use crate::session::Session;

/// A file picked by the user, held in memory until upload.
#[derive(Clone, PartialEq, Eq)]
pub struct DraftFile {
    pub name: String,
    pub bytes: Bytes,
}

impl DraftFile {
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { name: name.into(), bytes: bytes.into() }
    }
}

impl std::fmt::Debug for DraftFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftFile")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// User-composed message awaiting submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draft {
    pub content: String,
    pub kind: MessageKind,
    pub file: Option<DraftFile>,
}

impl Draft {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), kind: MessageKind::Text, file: None }
    }

    #[must_use]
    pub fn emoji(glyphs: impl Into<String>) -> Self {
        Self { content: glyphs.into(), kind: MessageKind::Emoji, file: None }
    }

    #[must_use]
    pub fn image(file: DraftFile, caption: impl Into<String>) -> Self {
        Self { content: caption.into(), kind: MessageKind::Image, file: Some(file) }
    }

    #[must_use]
    pub fn file(file: DraftFile, caption: impl Into<String>) -> Self {
        Self { content: caption.into(), kind: MessageKind::File, file: Some(file) }
    }

    /// Check the draft is sendable.
    ///
    /// # Errors
    ///
    /// Text and emoji drafts need non-blank content and no file; image and
    /// file drafts need a file.
    pub fn validate(&self) -> Result<(), DraftError> {
        match (self.kind.has_attachment(), &self.file) {
            (true, None) => Err(DraftError::MissingFile(self.kind)),
            (false, Some(_)) => Err(DraftError::UnexpectedFile(self.kind)),
            (false, None) if self.content.trim().is_empty() => Err(DraftError::Empty),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum DraftError {
    #[error("message is empty")]
    Empty,
    #[error("{0} message needs a file")]
    MissingFile(MessageKind),
    #[error("{0} message cannot carry a file")]
    UnexpectedFile(MessageKind),
}

/// Monotonic source of local placeholder ids, seeded from the wall clock.
#[derive(Debug, Default)]
pub struct PendingIds {
    last: u64,
}

impl PendingIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id: `now_ms`, or one past the previous id if the clock has not advanced.
    pub fn next(&mut self, now_ms: i64) -> MessageId {
        let now = u64::try_from(now_ms).unwrap_or(0);
        self.last = now.max(self.last + 1);
        MessageId::Local(self.last)
    }
}

/// Body of the send endpoint call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub client_ref: String,
    pub file: Option<DraftFile>,
}

#[derive(Debug)]
pub struct PreparedSend {
    pub message: Message,
    pub request: SendRequest,
}

/// Fresh correlation token for a pending record.
#[must_use]
pub fn new_client_ref() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Turn a validated draft into a pending record and its submission request.
///
/// A draft file is copied into `blobs` so the sender sees it immediately;
/// the record's attachment points at that local reference until
/// reconciliation swaps in the server path.
///
/// # Errors
///
/// Propagates [`Draft::validate`] failures without allocating anything.
pub fn prepare_send(
    draft: Draft,
    session: &Session,
    peer_id: &str,
    id: MessageId,
    sent_at: i64,
    blobs: &BlobRegistry,
) -> Result<PreparedSend, DraftError> {
    draft.validate()?;
    let Draft { content, kind, file } = draft;

    let attachment = file.as_ref().map(|file| AttachmentRef::Local {
        handle: blobs.create(file.bytes.clone()),
        name: file.name.clone(),
    });
    let body = MessageBody::from_parts(kind, content.clone(), attachment).ok_or(DraftError::MissingFile(kind))?;

    let client_ref = new_client_ref();
    let message = Message {
        id,
        sender_id: session.user_id().to_owned(),
        recipient_id: peer_id.to_owned(),
        body,
        created_at: sent_at,
        delivery: Delivery::Pending { sent_at, client_ref: client_ref.clone(), error: None },
    };
    let request = SendRequest {
        sender_id: session.user_id().to_owned(),
        recipient_id: peer_id.to_owned(),
        content,
        kind,
        client_ref,
        file,
    };
    Ok(PreparedSend { message, request })
}

/// Rebuild the submission request for an existing pending record.
///
/// Returns `None` for confirmed records, or when a draft attachment's bytes
/// are no longer held by `blobs`.
#[must_use]
pub fn resend_request(message: &Message, client_ref: String, blobs: &BlobRegistry) -> Option<SendRequest> {
    if !message.is_pending() {
        return None;
    }
    let file = match message.attachment() {
        Some(AttachmentRef::Local { handle, name }) => Some(DraftFile::new(name.clone(), blobs.get(*handle)?)),
        Some(AttachmentRef::Remote { .. }) => return None,
        None => None,
    };
    Some(SendRequest {
        sender_id: message.sender_id.clone(),
        recipient_id: message.recipient_id.clone(),
        content: message.content().to_owned(),
        kind: message.kind(),
        client_ref,
        file,
    })
}

#[cfg(test)]
#[path = "send_test.rs"]
mod tests;
