//! HTTP collaborators: history backlog, send endpoint, authorized
//! attachment fetch.
//!
//! DESIGN
//! ======
//! [`ChatApi`] is the seam the engine talks through, so tests can script
//! responses without a server. [`HttpChatApi`] is the `reqwest` wrapper;
//! response parsing lives in plain functions for testability.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::multipart::{Form, Part};
use tracing::warn;

use crate::config::ChatConfig;
use crate::message::MessagePayload;
use crate::send::SendRequest;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {0}")]
    Status(u16),
    #[error("invalid credential header: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("malformed response body: {0}")]
    Body(String),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// HTTP status code for non-success responses.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(code) => Some(*code),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            Self::InvalidHeader(_) | Self::Body(_) | Self::InvalidUrl(_) => None,
        }
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Server endpoints the messaging core consumes. Enables mocking in tests.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Backlog for the conversation between the session user and `peer_id`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Transport failure, non-2xx status, or an unparsable body.
    async fn history(&self, session: &Session, peer_id: &str) -> Result<Vec<MessagePayload>, ApiError>;

    /// Submit a message. Success is only an acknowledgement; the confirmed
    /// record arrives over the push channel.
    ///
    /// # Errors
    ///
    /// Transport failure or non-2xx status.
    async fn send(&self, session: &Session, request: SendRequest) -> Result<(), ApiError>;

    /// Fetch attachment bytes with the bearer credential.
    ///
    /// # Errors
    ///
    /// Transport failure or non-2xx status (401, 404, ...).
    async fn fetch_attachment(&self, session: &Session, path: &str) -> Result<Bytes, ApiError>;
}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Clone, Debug)]
pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpChatApi {
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the HTTP client fails to build.
    pub fn new(config: &ChatConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeouts.request)
            .connect_timeout(config.timeouts.connect)
            .build()?;
        Ok(Self { http, base_url: config.base_url.trim_end_matches('/').to_owned() })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a server path. Absolute URLs pass through unchanged.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_owned();
        }
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// History endpoint for `peer_id`, which is encoded as a single path
    /// segment.
    ///
    /// # Errors
    ///
    /// [`ApiError::InvalidUrl`] when the base URL cannot carry a path.
    pub fn history_url(&self, peer_id: &str) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.url("/api/messages")).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut().map_err(|()| ApiError::InvalidUrl(self.base_url.clone()))?.push(peer_id);
        Ok(url)
    }

    /// `GET /healthz`.
    ///
    /// # Errors
    ///
    /// Transport failure or non-2xx status.
    pub async fn health(&self) -> Result<(), ApiError> {
        let response = self.http.get(self.url("/healthz")).send().await?;
        check_status(response.status())
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn history(&self, session: &Session, peer_id: &str) -> Result<Vec<MessagePayload>, ApiError> {
        let response = self
            .http
            .get(self.history_url(peer_id)?)
            .header(AUTHORIZATION, auth_header(session)?)
            .send()
            .await?;
        check_status(response.status())?;
        let text = response.text().await?;
        parse_history(&text)
    }

    async fn send(&self, session: &Session, request: SendRequest) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.url("/api/messages"))
            .header(AUTHORIZATION, auth_header(session)?)
            .multipart(send_form(request))
            .send()
            .await?;
        check_status(response.status())
    }

    async fn fetch_attachment(&self, session: &Session, path: &str) -> Result<Bytes, ApiError> {
        let response = self
            .http
            .get(self.url(path))
            .header(AUTHORIZATION, auth_header(session)?)
            .send()
            .await?;
        check_status(response.status())?;
        Ok(response.bytes().await?)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn auth_header(session: &Session) -> Result<HeaderValue, ApiError> {
    let mut value = HeaderValue::from_str(&session.bearer())?;
    value.set_sensitive(true);
    Ok(value)
}

fn check_status(status: reqwest::StatusCode) -> Result<(), ApiError> {
    if status.is_success() { Ok(()) } else { Err(ApiError::Status(status.as_u16())) }
}

fn send_form(request: SendRequest) -> Form {
    let SendRequest { sender_id, recipient_id, content, kind, client_ref, file } = request;
    let form = Form::new()
        .text("sender_id", sender_id)
        .text("recipient_id", recipient_id)
        .text("content", content)
        .text("kind", kind.as_str())
        .text("client_ref", client_ref);
    match file {
        Some(file) => form.part("file", Part::bytes(file.bytes.to_vec()).file_name(file.name)),
        None => form,
    }
}

/// Parse a history body: `{"messages": [...]}` or a bare array.
///
/// Rows that do not parse as payloads are skipped with a warning.
///
/// # Errors
///
/// Returns [`ApiError::Body`] when the body is not JSON or has neither shape.
pub fn parse_history(body: &str) -> Result<Vec<MessagePayload>, ApiError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| ApiError::Body(e.to_string()))?;
    let rows = match value {
        serde_json::Value::Array(rows) => rows,
        serde_json::Value::Object(mut map) => match map.remove("messages") {
            Some(serde_json::Value::Array(rows)) => rows,
            _ => return Err(ApiError::Body("expected a `messages` array".to_owned())),
        },
        _ => return Err(ApiError::Body("expected an array or object".to_owned())),
    };

    let payloads = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<MessagePayload>(row) {
            Ok(payload) => Some(payload),
            Err(error) => {
                warn!(%error, "skipping malformed history row");
                None
            }
        })
        .collect();
    Ok(payloads)
}

#[cfg(test)]
#[path = "api_mock_test.rs"]
pub(crate) mod mock;

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
