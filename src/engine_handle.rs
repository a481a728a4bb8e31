//! Event loop and the cloneable UI-facing handle.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ChatEngine, ChatError, ThreadSnapshot};
use crate::download::DownloadPreview;
use crate::message::MessageId;
use crate::push::{ConnectionStatus, PushEvent};
use crate::send::Draft;

const COMMAND_BUFFER: usize = 64;

enum Command {
    OpenThread { peer_id: String, reply: oneshot::Sender<Result<(), ChatError>> },
    CloseThread { reply: oneshot::Sender<()> },
    Send { draft: Draft, reply: oneshot::Sender<Result<MessageId, ChatError>> },
    Resend { id: MessageId, reply: oneshot::Sender<Result<(), ChatError>> },
    RequestDownload { id: MessageId, reply: oneshot::Sender<Result<DownloadPreview, ChatError>> },
    ConfirmDownload { reply: oneshot::Sender<Result<(), ChatError>> },
    CancelDownload { reply: oneshot::Sender<bool> },
    Shutdown { reply: oneshot::Sender<()> },
}

fn reply<T>(tx: oneshot::Sender<T>, value: T) {
    if tx.send(value).is_err() {
        debug!("caller dropped before reply");
    }
}

impl ChatEngine {
    /// Move the engine onto its own task and return the handle that drives it.
    pub fn spawn(self, push: mpsc::Receiver<PushEvent>) -> (ChatHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = ChatHandle { commands: commands_tx, snapshots: self.subscribe() };
        let task = tokio::spawn(self.run(commands_rx, push));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut push: mpsc::Receiver<PushEvent>) {
        let mut push_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply: tx }) => {
                        self.close_thread();
                        reply(tx, ());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = push.recv(), if push_open => match event {
                    Some(event) => self.handle_push(event),
                    None => {
                        debug!("push channel ended");
                        push_open = false;
                        self.handle_push(PushEvent::Status(ConnectionStatus::Disconnected));
                    }
                },
                Some(completion) = self.completions_rx.recv() => self.apply_completion(completion),
            }
        }
        self.close_thread();
        info!("chat engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenThread { peer_id, reply: tx } => {
                let result = self.open_thread(&peer_id).await;
                reply(tx, result);
            }
            Command::CloseThread { reply: tx } => {
                self.close_thread();
                reply(tx, ());
            }
            Command::Send { draft, reply: tx } => reply(tx, self.send_message(draft)),
            Command::Resend { id, reply: tx } => reply(tx, self.resend(id)),
            Command::RequestDownload { id, reply: tx } => reply(tx, self.request_download(id)),
            Command::ConfirmDownload { reply: tx } => reply(tx, self.confirm_download()),
            Command::CancelDownload { reply: tx } => reply(tx, self.cancel_download()),
            Command::Shutdown { reply: tx } => {
                self.close_thread();
                reply(tx, ());
            }
        }
    }
}

/// UI-facing surface of a running [`ChatEngine`]. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<ThreadSnapshot>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::OpenThread { .. } => "OpenThread",
            Self::CloseThread { .. } => "CloseThread",
            Self::Send { .. } => "Send",
            Self::Resend { .. } => "Resend",
            Self::RequestDownload { .. } => "RequestDownload",
            Self::ConfirmDownload { .. } => "ConfirmDownload",
            Self::CancelDownload { .. } => "CancelDownload",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl ChatHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| ChatError::EngineStopped)?;
        rx.await.map_err(|_| ChatError::EngineStopped)
    }

    /// # Errors
    ///
    /// See [`ChatEngine::open_thread`]; [`ChatError::EngineStopped`] after shutdown.
    pub async fn open_thread(&self, peer_id: impl Into<String>) -> Result<(), ChatError> {
        let peer_id = peer_id.into();
        self.request(|reply| Command::OpenThread { peer_id, reply }).await?
    }

    /// # Errors
    ///
    /// [`ChatError::EngineStopped`] after shutdown.
    pub async fn close_thread(&self) -> Result<(), ChatError> {
        self.request(|reply| Command::CloseThread { reply }).await
    }

    /// # Errors
    ///
    /// See [`ChatEngine::send_message`].
    pub async fn send_message(&self, draft: Draft) -> Result<MessageId, ChatError> {
        self.request(|reply| Command::Send { draft, reply }).await?
    }

    /// # Errors
    ///
    /// See [`ChatEngine::resend`].
    pub async fn resend(&self, id: MessageId) -> Result<(), ChatError> {
        self.request(|reply| Command::Resend { id, reply }).await?
    }

    /// # Errors
    ///
    /// See [`ChatEngine::request_download`].
    pub async fn request_download(&self, id: MessageId) -> Result<DownloadPreview, ChatError> {
        self.request(|reply| Command::RequestDownload { id, reply }).await?
    }

    /// # Errors
    ///
    /// See [`ChatEngine::confirm_download`].
    pub async fn confirm_download(&self) -> Result<(), ChatError> {
        self.request(|reply| Command::ConfirmDownload { reply }).await?
    }

    /// # Errors
    ///
    /// [`ChatError::EngineStopped`] after shutdown.
    pub async fn cancel_download(&self) -> Result<bool, ChatError> {
        self.request(|reply| Command::CancelDownload { reply }).await
    }

    /// Close the open thread and stop the engine task.
    ///
    /// # Errors
    ///
    /// [`ChatError::EngineStopped`] if it already stopped.
    pub async fn shutdown(&self) -> Result<(), ChatError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Receiver of published snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ThreadSnapshot> {
        self.snapshots.clone()
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ThreadSnapshot {
        self.snapshots.borrow().clone()
    }
}
