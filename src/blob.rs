//! Ephemeral local references to in-memory binary data.
//!
//! A [`LocalRef`] is the client-side handle the UI displays or saves from:
//! a draft attachment before upload, or an authorized download of a server
//! attachment. Nothing frees a reference implicitly; owners call
//! [`BlobRegistry::release`] when the handle is replaced or its conversation
//! closes, and [`BlobRegistry::live_count`] exposes what is still held.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

/// Handle to bytes held by a [`BlobRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LocalRef(u64);

impl fmt::Display for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:storechat/{}", self.0)
    }
}

/// Shared store of ephemeral references. Clones share the same storage.
#[derive(Clone, Default)]
pub struct BlobRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    next: u64,
    blobs: HashMap<u64, Bytes>,
}

impl BlobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `bytes` and return a fresh reference to them.
    pub fn create(&self, bytes: impl Into<Bytes>) -> LocalRef {
        let mut inner = self.lock();
        inner.next += 1;
        let id = inner.next;
        inner.blobs.insert(id, bytes.into());
        LocalRef(id)
    }

    /// Bytes behind `handle`, or `None` once it has been released.
    #[must_use]
    pub fn get(&self, handle: LocalRef) -> Option<Bytes> {
        self.lock().blobs.get(&handle.0).cloned()
    }

    /// Free the bytes behind `handle`. Returns false if it was already released.
    pub fn release(&self, handle: LocalRef) -> bool {
        self.lock().blobs.remove(&handle.0).is_some()
    }

    /// Number of references not yet released.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().blobs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl fmt::Debug for BlobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobRegistry").field("live", &self.live_count()).finish()
    }
}

#[cfg(test)]
#[path = "blob_test.rs"]
mod tests;
