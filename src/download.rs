//! Download confirmation flow.
//!
//! `Closed -> Confirming(request) -> Closed`. Activating an attachment only
//! opens the confirmation; bytes move after an explicit confirm. Pending
//! drafts save straight from their local reference, confirmed attachments
//! go through the same authorized fetch as preview resolution.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::attachment::DisplayHandle;
use crate::blob::LocalRef;
use crate::message::{AttachmentRef, Message, MessageId, MessageKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadSource {
    Local(LocalRef),
    Remote(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    pub message_id: MessageId,
    pub file_name: String,
    pub source: DownloadSource,
    pub is_image: bool,
}

impl DownloadRequest {
    /// `None` when the message has no attachment.
    #[must_use]
    pub fn for_message(message: &Message) -> Option<Self> {
        let attachment = message.attachment()?;
        let source = match attachment {
            AttachmentRef::Local { handle, .. } => DownloadSource::Local(*handle),
            AttachmentRef::Remote { path } => DownloadSource::Remote(path.clone()),
        };
        Some(Self {
            message_id: message.id,
            file_name: attachment.file_name().to_owned(),
            source,
            is_image: message.kind() == MessageKind::Image,
        })
    }

    #[must_use]
    pub fn is_pending_source(&self) -> bool {
        matches!(self.source, DownloadSource::Local(_))
    }

    /// Prompt content. `resolved` is the cached handle for a remote image.
    #[must_use]
    pub fn preview(&self, resolved: Option<DisplayHandle>) -> DownloadPreview {
        if !self.is_image {
            return DownloadPreview::File { name: self.file_name.clone() };
        }
        match self.source {
            DownloadSource::Local(handle) => DownloadPreview::Image(Some(DisplayHandle::Local(handle))),
            DownloadSource::Remote(_) => DownloadPreview::Image(resolved),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DownloadState {
    #[default]
    Closed,
    Confirming(DownloadRequest),
}

/// What the confirmation prompt shows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadPreview {
    /// `None` while a remote image is still resolving.
    Image(Option<DisplayHandle>),
    File { name: String },
}

#[derive(Debug, Default)]
pub struct DownloadFlow {
    state: DownloadState,
}

impl DownloadFlow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    /// Open (or retarget) the confirmation prompt.
    pub fn request(&mut self, request: DownloadRequest) {
        self.state = DownloadState::Confirming(request);
    }

    /// Point an open prompt for `from` at `message` once it has been
    /// confirmed under a new id. Returns whether the prompt moved.
    pub fn retarget(&mut self, from: MessageId, message: &Message) -> bool {
        let DownloadState::Confirming(request) = &self.state else {
            return false;
        };
        if request.message_id != from {
            return false;
        }
        match DownloadRequest::for_message(message) {
            Some(request) => self.state = DownloadState::Confirming(request),
            None => self.state = DownloadState::Closed,
        }
        true
    }

    /// Close the prompt, returning the request to carry out.
    pub fn confirm(&mut self) -> Option<DownloadRequest> {
        match std::mem::take(&mut self.state) {
            DownloadState::Confirming(request) => Some(request),
            DownloadState::Closed => None,
        }
    }

    /// Close the prompt without doing anything. False if it was already closed.
    pub fn cancel(&mut self) -> bool {
        !matches!(std::mem::take(&mut self.state), DownloadState::Closed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Saved { message_id: MessageId, path: PathBuf },
    Failed { message_id: MessageId, error: String },
}

/// Destination for confirmed downloads.
#[async_trait]
pub trait DownloadSink: Send + Sync {
    /// Persist `bytes` under `file_name`, returning where they landed.
    ///
    /// # Errors
    ///
    /// Any I/O failure writing the file.
    async fn save(&self, file_name: &str, bytes: Bytes) -> io::Result<PathBuf>;
}

/// Writes downloads into one directory.
#[derive(Clone, Debug)]
pub struct FsDownloadSink {
    dir: PathBuf,
}

impl FsDownloadSink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl DownloadSink for FsDownloadSink {
    async fn save(&self, file_name: &str, bytes: Bytes) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(sanitize_file_name(file_name));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}

/// Final path component of `name`, or `"attachment"` if nothing usable remains.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if last.is_empty() || last == "." || last == ".." {
        "attachment".to_owned()
    } else {
        last.to_owned()
    }
}

#[cfg(test)]
#[path = "download_test.rs"]
mod tests;
