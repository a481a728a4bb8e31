use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use storechat::config::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MATCH_WINDOW_MS, DEFAULT_RECONNECT_INITIAL_MS, DEFAULT_RECONNECT_MAX_MS,
    DEFAULT_REQUEST_TIMEOUT_SECS, HttpTimeouts, ReconnectPolicy,
};
use storechat::download::{DownloadOutcome, DownloadPreview};
use storechat::{
    Alignment, ChatApi, ChatConfig, ChatEngine, ChatError, ChatHandle, ConnectionStatus, Draft, DraftFile,
    HttpChatApi, MessageId, MessageView, ThreadSnapshot, spawn_push_channel,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("api request failed: {0}")]
    Api(#[from] storechat::ApiError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("could not read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("stdin failed: {0}")]
    Stdin(std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("no message numbered {0:?}")]
    NoSuchMessage(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

#[derive(Parser, Debug)]
#[command(name = "storechat", about = "Storefront chat client")]
struct Cli {
    #[arg(long, env = "STORECHAT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "STORECHAT_USER_ID")]
    user_id: String,

    #[arg(long, env = "STORECHAT_TOKEN", hide_env_values = true)]
    token: String,

    #[arg(long, env = "STORECHAT_DOWNLOAD_DIR", default_value = ".")]
    download_dir: PathBuf,

    /// How far apart a draft and its echo may be before they stop matching.
    #[arg(long, env = "STORECHAT_MATCH_WINDOW_MS", default_value_t = DEFAULT_MATCH_WINDOW_MS)]
    match_window_ms: u64,

    #[arg(long, env = "STORECHAT_RECONNECT_INITIAL_MS", default_value_t = DEFAULT_RECONNECT_INITIAL_MS)]
    reconnect_initial_ms: u64,

    /// Raised to the initial delay when set lower.
    #[arg(long, env = "STORECHAT_RECONNECT_MAX_MS", default_value_t = DEFAULT_RECONNECT_MAX_MS)]
    reconnect_max_ms: u64,

    #[arg(long, env = "STORECHAT_REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_secs: u64,

    #[arg(long, env = "STORECHAT_CONNECT_TIMEOUT_SECS", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn config(&self) -> ChatConfig {
        let mut config = ChatConfig::new(&self.base_url, self.user_id.clone(), self.token.clone());
        config.download_dir.clone_from(&self.download_dir);
        config.match_window = Duration::from_millis(self.match_window_ms);
        let initial = Duration::from_millis(self.reconnect_initial_ms);
        let max = Duration::from_millis(self.reconnect_max_ms);
        config.reconnect = ReconnectPolicy { initial, max: max.max(initial) };
        config.timeouts = HttpTimeouts {
            request: Duration::from_secs(self.request_timeout_secs),
            connect: Duration::from_secs(self.connect_timeout_secs),
        };
        config
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the server is reachable.
    Ping,
    /// Print the stored conversation with a peer as JSON.
    History { peer_id: String },
    /// Send one message and wait for the server to confirm it.
    Send {
        peer_id: String,
        #[arg(default_value = "")]
        content: String,
        #[arg(long, conflicts_with = "file")]
        image: Option<PathBuf>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Interactive conversation.
    Chat { peer_id: String },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("storechat=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        Command::Ping => run_ping(&config).await,
        Command::History { peer_id } => run_history(&config, &peer_id).await,
        Command::Send { peer_id, content, image, file, timeout_secs } => {
            let draft = match (image, file) {
                (Some(path), _) => Draft::image(read_draft_file(&path).await?, content),
                (None, Some(path)) => Draft::file(read_draft_file(&path).await?, content),
                (None, None) => Draft::text(content),
            };
            run_send(&config, &peer_id, draft, Duration::from_secs(timeout_secs)).await
        }
        Command::Chat { peer_id } => run_chat(&config, &peer_id).await,
    }
}

async fn run_ping(config: &ChatConfig) -> Result<(), CliError> {
    HttpChatApi::new(config)?.health().await?;
    println!("ok");
    Ok(())
}

async fn run_history(config: &ChatConfig, peer_id: &str) -> Result<(), CliError> {
    let api = HttpChatApi::new(config)?;
    let rows = api.history(&config.session(), peer_id).await?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn read_draft_file(path: &Path) -> Result<DraftFile, CliError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| CliError::ReadFile { path: path.to_path_buf(), source })?;
    let name = path.file_name().map_or_else(|| "attachment".to_owned(), |n| n.to_string_lossy().into_owned());
    Ok(DraftFile::new(name, bytes))
}

struct Running {
    handle: ChatHandle,
    engine_task: tokio::task::JoinHandle<()>,
    push_task: tokio::task::JoinHandle<()>,
}

impl Running {
    fn start(config: &ChatConfig) -> Result<Self, CliError> {
        let engine = ChatEngine::from_config(config)?;
        let (push_task, push_rx) = spawn_push_channel(config, config.session());
        let (handle, engine_task) = engine.spawn(push_rx);
        Ok(Self { handle, engine_task, push_task })
    }

    async fn stop(self) {
        if let Err(error) = self.handle.shutdown().await {
            tracing::debug!(%error, "engine already stopped");
        }
        self.push_task.abort();
        if let Err(error) = self.engine_task.await {
            tracing::warn!(%error, "engine task failed");
        }
    }
}

async fn wait_until(
    rx: &mut watch::Receiver<ThreadSnapshot>,
    timeout: Duration,
    what: &'static str,
    mut predicate: impl FnMut(&ThreadSnapshot) -> bool,
) -> Result<ThreadSnapshot, CliError> {
    let waited = tokio::time::timeout(timeout, async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            if rx.changed().await.is_err() {
                return Err(CliError::Chat(ChatError::EngineStopped));
            }
        }
    });
    waited.await.map_err(|_| CliError::Timeout(what))?
}

async fn run_send(config: &ChatConfig, peer_id: &str, draft: Draft, timeout: Duration) -> Result<(), CliError> {
    let running = Running::start(config)?;
    let result = send_and_confirm(&running.handle, peer_id, draft, timeout).await;
    running.stop().await;
    result
}

async fn send_and_confirm(handle: &ChatHandle, peer_id: &str, draft: Draft, timeout: Duration) -> Result<(), CliError> {
    let mut rx = handle.subscribe();
    // The echo only arrives on a live channel.
    wait_until(&mut rx, timeout, "push connection", |s| s.connection == ConnectionStatus::Connected).await?;
    handle.open_thread(peer_id).await?;

    let local = handle.send_message(draft).await?;
    let settled = wait_until(&mut rx, timeout, "confirmation", |s| {
        s.find(local).is_none_or(|view| view.message.send_error().is_some())
    })
    .await?;
    if let Some(error) = settled.find(local).and_then(|view| view.message.send_error()) {
        return Err(CliError::SendFailed(error.to_owned()));
    }
    println!("sent");
    Ok(())
}

// =============================================================================
// INTERACTIVE
// =============================================================================

const HELP: &str = "commands: /image PATH, /file PATH, /download N, /yes, /no, /resend N, /quit";

async fn run_chat(config: &ChatConfig, peer_id: &str) -> Result<(), CliError> {
    let running = Running::start(config)?;
    let result = chat_loop(&running.handle, peer_id).await;
    running.stop().await;
    result
}

async fn chat_loop(handle: &ChatHandle, peer_id: &str) -> Result<(), CliError> {
    if let Err(error) = handle.open_thread(peer_id).await {
        eprintln!("! {error}");
    }
    println!("{HELP}");

    let mut rx = handle.subscribe();
    let mut view = Renderer::default();
    view.render(&rx.borrow_and_update());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                view.render(&rx.borrow_and_update());
            }
            line = lines.next_line() => {
                let Some(line) = line.map_err(CliError::Stdin)? else {
                    return Ok(());
                };
                if line.trim() == "/quit" {
                    return Ok(());
                }
                let snapshot = handle.snapshot();
                if let Err(error) = run_line(handle, &snapshot, line.trim()).await {
                    eprintln!("! {error}");
                }
            }
        }
    }
}

async fn run_line(handle: &ChatHandle, snapshot: &ThreadSnapshot, line: &str) -> Result<(), CliError> {
    let (command, arg) = line.split_once(' ').map_or((line, ""), |(c, a)| (c, a.trim()));
    match command {
        "" => {}
        "/image" => {
            handle.send_message(Draft::image(read_draft_file(Path::new(arg)).await?, "")).await?;
        }
        "/file" => {
            handle.send_message(Draft::file(read_draft_file(Path::new(arg)).await?, "")).await?;
        }
        "/download" => {
            let id = message_at(snapshot, arg)?;
            match handle.request_download(id).await? {
                DownloadPreview::File { name } => println!("save {name}? /yes or /no"),
                DownloadPreview::Image(_) => println!("save image? /yes or /no"),
            }
        }
        "/yes" => handle.confirm_download().await?,
        "/no" => {
            handle.cancel_download().await?;
        }
        "/resend" => handle.resend(message_at(snapshot, arg)?).await?,
        _ if command.starts_with('/') => println!("{HELP}"),
        _ => {
            handle.send_message(Draft::text(line)).await?;
        }
    }
    Ok(())
}

fn message_at(snapshot: &ThreadSnapshot, arg: &str) -> Result<MessageId, CliError> {
    arg.parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|index| snapshot.messages.get(index))
        .map(|view| view.message.id)
        .ok_or_else(|| CliError::NoSuchMessage(arg.to_owned()))
}

/// Prints each message once, plus connection and download changes.
#[derive(Default)]
struct Renderer {
    printed: HashSet<MessageId>,
    failed: HashSet<MessageId>,
    connection: Option<ConnectionStatus>,
    last_download: Option<DownloadOutcome>,
}

impl Renderer {
    fn render(&mut self, snapshot: &ThreadSnapshot) {
        if self.connection != Some(snapshot.connection) {
            self.connection = Some(snapshot.connection);
            println!("[{:?}]", snapshot.connection);
        }
        for (index, view) in snapshot.messages.iter().enumerate() {
            let id = view.message.id;
            if let Some(error) = view.message.send_error() {
                if self.failed.insert(id) {
                    println!("{} failed: {error} (/resend {})", line_for(index, view), index + 1);
                }
            } else {
                self.failed.remove(&id);
                if self.printed.insert(id) {
                    println!("{}", line_for(index, view));
                }
            }
        }
        if snapshot.last_download != self.last_download {
            self.last_download.clone_from(&snapshot.last_download);
            match &snapshot.last_download {
                Some(DownloadOutcome::Saved { path, .. }) => println!("saved {}", path.display()),
                Some(DownloadOutcome::Failed { error, .. }) => println!("download failed: {error}"),
                None => {}
            }
        }
    }
}

fn line_for(index: usize, view: &MessageView) -> String {
    let arrow = match view.alignment {
        Alignment::Sent => ">",
        Alignment::Received => "<",
    };
    let attachment =
        view.message.attachment().map(|a| format!(" [{} {}]", view.message.kind(), a.file_name())).unwrap_or_default();
    let status = if view.message.is_pending() { " (sending)" } else { "" };
    format!("{:>3} {arrow} {}{attachment}{status}", index + 1, view.message.content())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
