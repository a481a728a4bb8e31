//! Realtime one-to-one messaging core for the storefront.
//!
//! ARCHITECTURE
//! ============
//! A conversation has two independent writers: the local user (optimistic
//! sends) and the server push channel (confirmed echoes and inbound
//! messages). Both are serialized through [`engine::ChatEngine`], which owns
//! the [`store::MessageStore`] for the open thread and publishes an ordered
//! [`engine::ThreadSnapshot`] for the UI to render.
//!
//! - [`send`] builds pending records and submission requests.
//! - [`reconcile`] folds push payloads into the store exactly once.
//! - [`attachment`] turns authorized server attachments into local handles.
//! - [`download`] gates attachment saves behind explicit confirmation.
//! - [`api`] and [`push`] are the HTTP and websocket collaborators.
//!
//! Everything that holds client-side bytes allocates from one
//! [`blob::BlobRegistry`], so teardown can be checked for leaks.

pub mod api;
pub mod attachment;
pub mod blob;
pub mod config;
pub mod download;
pub mod engine;
pub mod message;
pub mod push;
pub mod reconcile;
pub mod send;
pub mod session;
pub mod store;

pub use api::{ApiError, ChatApi, HttpChatApi};
pub use config::{ChatConfig, ConfigError};
pub use engine::{ChatEngine, ChatError, ChatHandle, MessageView, ThreadSnapshot};
pub use message::{Alignment, Message, MessageId, MessageKind, MessagePayload};
pub use push::{ConnectionStatus, PushEvent, spawn_push_channel};
pub use send::{Draft, DraftFile};
pub use session::Session;
