//! Viewer identity and bearer credential.
//!
//! The surrounding storefront owns login and credential storage. The core
//! only ever sees this value, passed in explicitly.

use std::fmt;

/// Authenticated viewer context handed to every component that talks to
/// the server or decides message alignment.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: String,
    token: String,
}

impl Session {
    #[must_use]
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), token: token.into() }
    }

    /// Stable identifier of the viewing user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// `Authorization` header value for this credential.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
