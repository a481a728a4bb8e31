//! Attachment resolver and per-conversation display cache.
//!
//! Server attachments need the bearer credential, so a view can never
//! point at the raw server path. The resolver fetches the bytes with the
//! session's credential and hands back a local reference instead. Any
//! failure degrades to [`DisplayHandle::Fallback`].

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::blob::{BlobRegistry, LocalRef};
use crate::message::MessageId;
use crate::session::Session;

/// Placeholder shown when an attachment cannot be fetched.
pub const FALLBACK_IMAGE: &str = "/images/attachment-unavailable.svg";

/// What a message bubble displays for an attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayHandle {
    Local(LocalRef),
    Fallback,
}

impl DisplayHandle {
    #[must_use]
    pub fn local_ref(self) -> Option<LocalRef> {
        match self {
            Self::Local(handle) => Some(handle),
            Self::Fallback => None,
        }
    }

    /// Source string a renderer can display.
    #[must_use]
    pub fn src(self) -> String {
        match self {
            Self::Local(handle) => handle.to_string(),
            Self::Fallback => FALLBACK_IMAGE.to_owned(),
        }
    }
}

/// Fetch `path` with the session credential and register the bytes locally.
pub async fn resolve_attachment<A>(api: &A, session: &Session, path: &str, blobs: &BlobRegistry) -> DisplayHandle
where
    A: ChatApi + ?Sized,
{
    match api.fetch_attachment(session, path).await {
        Ok(bytes) => {
            debug!(path, len = bytes.len(), "attachment resolved");
            DisplayHandle::Local(blobs.create(bytes))
        }
        Err(error) => {
            warn!(path, %error, "attachment fetch failed; using fallback");
            DisplayHandle::Fallback
        }
    }
}

/// Resolved handles for confirmed messages of the open conversation.
///
/// Owns every local reference it holds: replacing, removing, or clearing an
/// entry releases its reference.
#[derive(Debug)]
pub struct AttachmentCache {
    blobs: BlobRegistry,
    handles: HashMap<MessageId, DisplayHandle>,
}

impl AttachmentCache {
    #[must_use]
    pub fn new(blobs: BlobRegistry) -> Self {
        Self { blobs, handles: HashMap::new() }
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<DisplayHandle> {
        self.handles.get(&id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn insert(&mut self, id: MessageId, handle: DisplayHandle) {
        if let Some(previous) = self.handles.insert(id, handle)
            && previous != handle
        {
            self.release(previous);
        }
    }

    pub fn remove(&mut self, id: MessageId) {
        if let Some(previous) = self.handles.remove(&id) {
            self.release(previous);
        }
    }

    /// Release every held reference. Returns how many were live.
    pub fn release_all(&mut self) -> usize {
        let handles: Vec<_> = self.handles.drain().map(|(_, handle)| handle).collect();
        handles.into_iter().filter(|handle| self.release(*handle)).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn release(&self, handle: DisplayHandle) -> bool {
        handle.local_ref().is_some_and(|r| self.blobs.release(r))
    }
}

#[cfg(test)]
#[path = "attachment_test.rs"]
mod tests;
