//! Ordered message list for one conversation.
//!
//! DESIGN
//! ======
//! Order is insertion order and is never re-sorted by timestamp: a pending
//! draft always lands after everything known when it was sent, whatever the
//! server clock says. Records change in place through [`MessageStore::replace`],
//! which locates its target with a predicate because reconciliation knows a
//! record's signature, not its position.

use crate::message::{Message, MessageId};

#[derive(Clone, Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    revision: u64,
}

impl MessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an oldest-first backlog, dropping repeated ids.
    #[must_use]
    pub fn from_backlog(backlog: impl IntoIterator<Item = Message>) -> Self {
        let mut store = Self::new();
        for message in backlog {
            store.append_unique(message);
        }
        store
    }

    /// Append at the end.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        self.revision += 1;
    }

    /// Append unless a record with the same id is already present.
    pub fn append_unique(&mut self, message: Message) -> bool {
        if self.contains(message.id) {
            return false;
        }
        self.append(message);
        true
    }

    /// Apply `patch` to the first record matching `predicate`, keeping its
    /// position. Returns false when nothing matched.
    pub fn replace<P, F>(&mut self, predicate: P, patch: F) -> bool
    where
        P: Fn(&Message) -> bool,
        F: FnOnce(&mut Message),
    {
        let Some(target) = self.messages.iter_mut().find(|m| predicate(m)) else {
            return false;
        };
        patch(target);
        self.revision += 1;
        true
    }

    /// Copy of the ordered list.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Bumped by every successful mutation.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
