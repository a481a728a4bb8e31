//! Conversation message model.
//!
//! DESIGN
//! ======
//! The kind of a message decides which fields exist, so the body is a
//! tagged union rather than a record of optional fields. Delivery state is a
//! second union: pending records carry their local send time and
//! correlation token, confirmed records carry nothing extra.
//!
//! [`MessagePayload`] is the server's JSON shape, shared by history rows and
//! push events.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::blob::LocalRef;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

/// Identity of a message in the store.
///
/// Pending records hold a `Local` placeholder until reconciliation swaps in
/// the `Server` id, so the two can never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    Local(u64),
    Server(i64),
}

impl MessageId {
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local-{id}"),
            Self::Server(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Emoji,
    Image,
    File,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Emoji => "emoji",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    /// Image and file messages are defined by their attachment.
    #[must_use]
    pub fn has_attachment(self) -> bool {
        matches!(self, Self::Image | Self::File)
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "emoji" => Some(Self::Emoji),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an attachment's bytes live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachmentRef {
    /// Draft file held in memory; displayable without a network round-trip.
    Local { handle: LocalRef, name: String },
    /// Server path; fetching it requires the bearer credential.
    Remote { path: String },
}

impl AttachmentRef {
    /// File name shown to the user and used when saving.
    #[must_use]
    pub fn file_name(&self) -> &str {
        match self {
            Self::Local { name, .. } => name,
            Self::Remote { path } => {
                let trimmed = path.split(['?', '#']).next().unwrap_or(path);
                trimmed.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("attachment")
            }
        }
    }

    #[must_use]
    pub fn local_handle(&self) -> Option<LocalRef> {
        match self {
            Self::Local { handle, .. } => Some(*handle),
            Self::Remote { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    /// Short glyph string.
    Emoji(String),
    Image { caption: String, attachment: AttachmentRef },
    File { caption: String, attachment: AttachmentRef },
}

impl MessageBody {
    /// Assemble a body from wire-level parts. `None` when an image or file
    /// arrives without an attachment.
    #[must_use]
    pub fn from_parts(kind: MessageKind, content: String, attachment: Option<AttachmentRef>) -> Option<Self> {
        match (kind, attachment) {
            (MessageKind::Text, _) => Some(Self::Text(content)),
            (MessageKind::Emoji, _) => Some(Self::Emoji(content)),
            (MessageKind::Image, Some(attachment)) => Some(Self::Image { caption: content, attachment }),
            (MessageKind::File, Some(attachment)) => Some(Self::File { caption: content, attachment }),
            (MessageKind::Image | MessageKind::File, None) => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Emoji(_) => MessageKind::Emoji,
            Self::Image { .. } => MessageKind::Image,
            Self::File { .. } => MessageKind::File,
        }
    }

    /// Text payload; the caption for attachment messages, possibly empty.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Text(text) | Self::Emoji(text) => text,
            Self::Image { caption, .. } | Self::File { caption, .. } => caption,
        }
    }

    #[must_use]
    pub fn attachment(&self) -> Option<&AttachmentRef> {
        match self {
            Self::Text(_) | Self::Emoji(_) => None,
            Self::Image { attachment, .. } | Self::File { attachment, .. } => Some(attachment),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Exists only locally until its echo arrives on the push channel.
    Pending {
        /// Local issue time in ms; the anchor for echo matching.
        sent_at: i64,
        /// Correlation token submitted with the send request.
        client_ref: String,
        /// Inline submission failure, cleared on resend.
        error: Option<String>,
    },
    Confirmed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub recipient_id: String,
    pub body: MessageBody,
    /// Display time in ms; server time once confirmed.
    pub created_at: i64,
    pub delivery: Delivery,
}

/// Bubble side relative to the viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alignment {
    Sent,
    Received,
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.body.content()
    }

    #[must_use]
    pub fn attachment(&self) -> Option<&AttachmentRef> {
        self.body.attachment()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending { .. })
    }

    #[must_use]
    pub fn sent_at(&self) -> Option<i64> {
        match &self.delivery {
            Delivery::Pending { sent_at, .. } => Some(*sent_at),
            Delivery::Confirmed => None,
        }
    }

    #[must_use]
    pub fn client_ref(&self) -> Option<&str> {
        match &self.delivery {
            Delivery::Pending { client_ref, .. } => Some(client_ref),
            Delivery::Confirmed => None,
        }
    }

    #[must_use]
    pub fn send_error(&self) -> Option<&str> {
        match &self.delivery {
            Delivery::Pending { error, .. } => error.as_deref(),
            Delivery::Confirmed => None,
        }
    }

    #[must_use]
    pub fn alignment(&self, viewer_id: &str) -> Alignment {
        if self.sender_id == viewer_id { Alignment::Sent } else { Alignment::Received }
    }

    /// True when the message is between `viewer_id` and `peer_id`, either direction.
    #[must_use]
    pub fn belongs_to(&self, viewer_id: &str, peer_id: &str) -> bool {
        (self.sender_id == viewer_id && self.recipient_id == peer_id)
            || (self.sender_id == peer_id && self.recipient_id == viewer_id)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("{kind} message {id} has no attachment path")]
    MissingAttachment { id: i64, kind: MessageKind },
}

/// Server representation of a stored message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(deserialize_with = "deserialize_i64_from_number")]
    pub id: i64,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub content: String,
    pub kind: MessageKind,
    /// Server path of the attachment for image and file messages.
    #[serde(default)]
    pub attachment: Option<String>,
    #[serde(deserialize_with = "deserialize_i64_from_number")]
    pub created_at: i64,
    /// Echo of the correlation token the sender submitted, when the server relays it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl MessagePayload {
    /// Convert into a confirmed message.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::MissingAttachment`] for image or file payloads
    /// without an attachment path.
    pub fn into_message(self) -> Result<Message, PayloadError> {
        let attachment = self
            .attachment
            .filter(|path| !path.trim().is_empty())
            .map(|path| AttachmentRef::Remote { path });
        let body = MessageBody::from_parts(self.kind, self.content, attachment)
            .ok_or(PayloadError::MissingAttachment { id: self.id, kind: self.kind })?;
        Ok(Message {
            id: MessageId::Server(self.id),
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            body,
            created_at: self.created_at,
            delivery: Delivery::Confirmed,
        })
    }
}

fn deserialize_i64_from_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let serde_json::Value::Number(number) = value else {
        return Err(D::Error::custom("expected number"));
    };
    if let Some(int) = number.as_i64() {
        return Ok(int);
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    if let Some(float) = number.as_f64()
        && float.is_finite()
        && float.fract() == 0.0
        && float >= i64::MIN as f64
        && float <= i64::MAX as f64
    {
        return Ok(float as i64);
    }
    Err(D::Error::custom("expected integer-compatible number"))
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;

    #[must_use]
    pub fn text_payload(id: i64, sender: &str, recipient: &str, content: &str, created_at: i64) -> MessagePayload {
        MessagePayload {
            id,
            sender_id: sender.to_owned(),
            recipient_id: recipient.to_owned(),
            content: content.to_owned(),
            kind: MessageKind::Text,
            attachment: None,
            created_at,
            client_ref: None,
        }
    }

    #[must_use]
    pub fn confirmed(id: i64, sender: &str, recipient: &str, content: &str, created_at: i64) -> Message {
        Message {
            id: MessageId::Server(id),
            sender_id: sender.to_owned(),
            recipient_id: recipient.to_owned(),
            body: MessageBody::Text(content.to_owned()),
            created_at,
            delivery: Delivery::Confirmed,
        }
    }

    /// Pending text draft whose correlation token is `ref-{local}`.
    #[must_use]
    pub fn pending(local: u64, sender: &str, recipient: &str, content: &str, sent_at: i64) -> Message {
        Message {
            id: MessageId::Local(local),
            sender_id: sender.to_owned(),
            recipient_id: recipient.to_owned(),
            body: MessageBody::Text(content.to_owned()),
            created_at: sent_at,
            delivery: Delivery::Pending { sent_at, client_ref: format!("ref-{local}"), error: None },
        }
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
