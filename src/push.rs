//! Push channel client.
//!
//! Owns the websocket lifecycle: connect with the bearer credential, decode
//! frames, forward conversation events, reconnect with exponential backoff.
//! Pending messages are never resubmitted from here; only reconciliation
//! resolves them, so an outage leaves drafts pending rather than duplicated.
//!
//! ERROR HANDLING
//! ==============
//! Transport failures end the current connection and feed the reconnect
//! loop. Undecodable frames and malformed payloads are logged and skipped.
//! The loop exits only when the event receiver is dropped.

use std::time::Duration;

use frames::Frame;
use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, info, warn};

use crate::config::{ChatConfig, ReconnectPolicy};
use crate::message::MessagePayload;
use crate::session::Session;

const EVENT_BUFFER: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushEvent {
    Status(ConnectionStatus),
    Message(MessagePayload),
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("websocket failed: {0}")]
    Socket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid credential header: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
    #[error("event receiver dropped")]
    ReceiverGone,
}

impl From<tokio_tungstenite::tungstenite::Error> for PushError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(Box::new(error))
    }
}

// =============================================================================
// URL / PARSING
// =============================================================================

/// Websocket endpoint for an HTTP base URL.
///
/// # Errors
///
/// Returns [`PushError::InvalidBaseUrl`] unless the scheme is `http` or `https`.
pub fn ws_url(base_url: &str) -> Result<String, PushError> {
    let trimmed = base_url.trim_end_matches('/');

    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/api/ws"));
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/api/ws"));
    }

    Err(PushError::InvalidBaseUrl(base_url.to_owned()))
}

/// Payload of a delivered `message:new` frame.
#[must_use]
pub fn parse_message_frame(frame: &Frame) -> Option<MessagePayload> {
    if !frame.is_message_delivery() {
        return None;
    }
    match serde_json::from_value::<MessagePayload>(frame.data.clone()) {
        Ok(payload) => Some(payload),
        Err(error) => {
            warn!(frame_id = %frame.id, %error, "skipping malformed message payload");
            None
        }
    }
}

/// Conversation event carried by `frame`, if any.
#[must_use]
pub fn frame_event(frame: &Frame) -> Option<PushEvent> {
    if frame.event == frames::EVENT_SESSION_CONNECTED {
        return Some(PushEvent::Status(ConnectionStatus::Connected));
    }
    parse_message_frame(frame).map(PushEvent::Message)
}

/// Decode a websocket message: binary frames are protobuf, text frames JSON.
#[must_use]
pub fn decode_ws_message(message: &WsMessage) -> Option<PushEvent> {
    let decoded = match message {
        WsMessage::Binary(bytes) => frames::decode_frame(bytes),
        WsMessage::Text(text) => frames::decode_text_frame(text.as_str()),
        _ => return None,
    };
    match decoded {
        Ok(frame) => frame_event(&frame),
        Err(error) => {
            warn!(%error, "skipping undecodable push frame");
            None
        }
    }
}

// =============================================================================
// BACKOFF
// =============================================================================

/// Exponential reconnect delay with up to 10% jitter below the nominal value.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, current: policy.initial }
    }

    /// Delay before the next attempt; doubles the nominal delay up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.current = nominal.saturating_mul(2).min(self.policy.max);
        let spread = u64::try_from(nominal.as_millis() / 10).unwrap_or(0);
        let jitter = if spread == 0 { 0 } else { rand::rng().random_range(0..=spread) };
        nominal.saturating_sub(Duration::from_millis(jitter))
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Spawn the push channel. Events arrive on the returned receiver; dropping
/// it stops the task.
#[must_use]
pub fn spawn_push_channel(config: &ChatConfig, session: Session) -> (JoinHandle<()>, mpsc::Receiver<PushEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let task = tokio::spawn(push_loop(config.base_url.clone(), session, config.reconnect, tx));
    (task, rx)
}

async fn push_loop(base_url: String, session: Session, policy: ReconnectPolicy, tx: mpsc::Sender<PushEvent>) {
    let mut backoff = Backoff::new(policy);

    loop {
        if tx.send(PushEvent::Status(ConnectionStatus::Connecting)).await.is_err() {
            return;
        }

        match connect_and_run(&base_url, &session, &tx, &mut backoff).await {
            Ok(()) => info!("push channel closed by server"),
            Err(PushError::ReceiverGone) => return,
            Err(error) => warn!(%error, "push channel error"),
        }

        if tx.send(PushEvent::Status(ConnectionStatus::Disconnected)).await.is_err() {
            return;
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis(), "push channel reconnecting");
        tokio::select! {
            () = tx.closed() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

fn client_request(base_url: &str, session: &Session) -> Result<Request, PushError> {
    let mut request = ws_url(base_url)?.into_client_request()?;
    let mut bearer = HeaderValue::from_str(&session.bearer())?;
    bearer.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, bearer);
    Ok(request)
}

async fn connect_and_run(
    base_url: &str,
    session: &Session,
    tx: &mpsc::Sender<PushEvent>,
    backoff: &mut Backoff,
) -> Result<(), PushError> {
    let request = client_request(base_url, session)?;
    let (mut stream, _) = tokio::select! {
        () = tx.closed() => return Err(PushError::ReceiverGone),
        connected = connect_async(request) => connected?,
    };

    backoff.reset();
    info!(user_id = %session.user_id(), "push channel connected");
    forward(tx, PushEvent::Status(ConnectionStatus::Connected)).await?;

    loop {
        let next = tokio::select! {
            () = tx.closed() => return Err(PushError::ReceiverGone),
            next = stream.next() => next,
        };
        let Some(message) = next else {
            return Ok(());
        };
        match message? {
            WsMessage::Close(_) => return Ok(()),
            message => {
                if let Some(event) = decode_ws_message(&message) {
                    forward(tx, event).await?;
                }
            }
        }
    }
}

async fn forward(tx: &mpsc::Sender<PushEvent>, event: PushEvent) -> Result<(), PushError> {
    tx.send(event).await.map_err(|_| PushError::ReceiverGone)
}

#[cfg(test)]
#[path = "push_test.rs"]
mod tests;
