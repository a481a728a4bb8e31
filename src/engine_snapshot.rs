//! Render-ready view of the open conversation.

use crate::attachment::{AttachmentCache, DisplayHandle};
use crate::download::{DownloadOutcome, DownloadPreview, DownloadState};
use crate::message::{Alignment, AttachmentRef, Message};
use crate::push::ConnectionStatus;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageView {
    pub message: Message,
    pub alignment: Alignment,
    /// Displayable attachment: the draft's local reference, the resolved
    /// server attachment, or `None` while resolving or for non-attachments.
    pub display: Option<DisplayHandle>,
}

/// Everything the renderer needs. Published after every state change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub peer_id: Option<String>,
    pub connection: ConnectionStatus,
    /// Insertion order.
    pub messages: Vec<MessageView>,
    pub download: DownloadState,
    pub preview: Option<DownloadPreview>,
    pub last_download: Option<DownloadOutcome>,
    /// Bumped on every store mutation; the renderer's re-scroll trigger.
    pub revision: u64,
}

impl ThreadSnapshot {
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|view| view.message.is_pending()).count()
    }

    #[must_use]
    pub fn find(&self, id: crate::message::MessageId) -> Option<&MessageView> {
        self.messages.iter().find(|view| view.message.id == id)
    }
}

pub(super) fn message_view(message: &Message, viewer_id: &str, previews: &AttachmentCache) -> MessageView {
    let display = match message.attachment() {
        Some(AttachmentRef::Local { handle, .. }) => Some(DisplayHandle::Local(*handle)),
        Some(AttachmentRef::Remote { .. }) => previews.get(message.id),
        None => None,
    };
    MessageView { message: message.clone(), alignment: message.alignment(viewer_id), display }
}

pub(super) fn preview_for(download: &DownloadState, previews: &AttachmentCache) -> Option<DownloadPreview> {
    match download {
        DownloadState::Closed => None,
        DownloadState::Confirming(request) => Some(request.preview(previews.get(request.message_id))),
    }
}
