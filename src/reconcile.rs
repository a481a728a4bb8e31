//! Integrating push payloads into the message store.
//!
//! ALGORITHM
//! =========
//! For each inbound confirmed message:
//! 1. Already in the store by server id: drop it (reconnect replay).
//! 2. Find the pending record it confirms. An echoed correlation token picks
//!    its record exactly; without one, [`EchoMatcher`] compares sender,
//!    recipient, content, and the distance between local send time and
//!    server creation time.
//! 3. On a match, overwrite that record in place with the server's fields.
//! 4. Otherwise append it if it belongs to the open conversation.
//!
//! TRADE-OFFS
//! ==========
//! The content/time heuristic cannot tell identical rapid-fire drafts apart
//! when no token is relayed. Taking the oldest candidate pairs them with
//! echoes in submission order, which survives clock skew between the
//! client's send time and the server's creation time.

use std::time::Duration;

use crate::blob::LocalRef;
use crate::message::{Message, MessageId};
use crate::store::MessageStore;

pub const DEFAULT_MATCH_WINDOW: Duration = Duration::from_secs(5);

/// Content + time-window predicate pairing a pending draft with its echo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EchoMatcher {
    window_ms: i64,
}

impl EchoMatcher {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX) }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.window_ms).unwrap_or(0))
    }

    /// Same participants, kind and content, sent strictly within the window
    /// of the echo's creation time.
    #[must_use]
    pub fn matches(&self, pending: &Message, echo: &Message) -> bool {
        self.distance(pending, echo).is_some()
    }

    /// Millisecond distance between draft and echo when they match.
    #[must_use]
    pub fn distance(&self, pending: &Message, echo: &Message) -> Option<i64> {
        let sent_at = pending.sent_at()?;
        if pending.sender_id != echo.sender_id
            || pending.recipient_id != echo.recipient_id
            || pending.kind() != echo.kind()
            || pending.content() != echo.content()
        {
            return None;
        }
        let distance = sent_at.abs_diff(echo.created_at);
        let distance = i64::try_from(distance).unwrap_or(i64::MAX);
        (distance < self.window_ms).then_some(distance)
    }
}

impl Default for EchoMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_WINDOW)
    }
}

/// The two participants of the open conversation.
#[derive(Clone, Copy, Debug)]
pub struct ThreadKey<'a> {
    pub viewer_id: &'a str,
    pub peer_id: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// A pending record now carries the server's data. `released` is the
    /// draft's local attachment reference, no longer referenced by the store.
    Promoted { local_id: MessageId, server_id: MessageId, released: Option<LocalRef> },
    /// Appended as a new confirmed message.
    Appended(MessageId),
    /// Already present by id.
    Duplicate(MessageId),
    /// Belongs to another conversation.
    Foreign(MessageId),
}

/// Fold one confirmed message into `store`.
///
/// `client_ref` is the correlation token echoed by the server, if any.
pub fn reconcile(
    store: &mut MessageStore,
    echo: Message,
    client_ref: Option<&str>,
    thread: ThreadKey<'_>,
    matcher: &EchoMatcher,
) -> Reconciliation {
    let server_id = echo.id;
    if store.contains(server_id) {
        return Reconciliation::Duplicate(server_id);
    }

    if let Some(pending) = find_pending(store, &echo, client_ref, matcher) {
        let local_id = pending.id;
        let released = pending.attachment().and_then(|a| a.local_handle());
        store.replace(|m| m.id == local_id, |m| *m = echo);
        return Reconciliation::Promoted { local_id, server_id, released };
    }

    if !echo.belongs_to(thread.viewer_id, thread.peer_id) {
        return Reconciliation::Foreign(server_id);
    }
    store.append(echo);
    Reconciliation::Appended(server_id)
}

fn find_pending<'s>(
    store: &'s MessageStore,
    echo: &Message,
    client_ref: Option<&str>,
    matcher: &EchoMatcher,
) -> Option<&'s Message> {
    let mut pending = store.messages().iter().filter(|m| m.is_pending());

    if let Some(token) = client_ref {
        return pending
            .filter(|m| m.sender_id == echo.sender_id && m.recipient_id == echo.recipient_id)
            .find(|m| m.client_ref() == Some(token));
    }

    // Echoes are created in submission order, so the oldest candidate wins.
    pending.find(|m| matcher.matches(m, echo))
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;
