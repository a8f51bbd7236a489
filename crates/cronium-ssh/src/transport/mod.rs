//! Transport seam between the engine and a remote host.
//!
//! The engine only ever talks to a [`RemoteSession`]: multiplexed command
//! channels, small file transfers and PTY shells over one authenticated
//! connection. [`Connector`] dials new sessions. The production
//! implementation lives in [`ssh`].

pub mod ssh;

use crate::error::{EngineError, Result};
use crate::target::ConnectionTarget;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Buffered shell events before the pump applies backpressure.
const SHELL_BUFFER: usize = 256;

/// Terminal dimensions for a pseudo-terminal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    /// Columns.
    pub cols: u32,
    /// Rows.
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Options for a single command channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Request a pseudo-terminal before running the command.
    pub pty: Option<PtySize>,
}

impl ExecOptions {
    /// Run with a default-sized pseudo-terminal.
    pub fn with_pty() -> Self {
        Self {
            pty: Some(PtySize::default()),
        }
    }
}

/// Everything a command channel produced before it closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output (lossy UTF-8).
    pub stdout: String,
    /// Standard error (lossy UTF-8). Empty under a PTY, which merges streams.
    pub stderr: String,
    /// Exit status, if the server reported one.
    pub exit_status: Option<u32>,
    /// Terminating signal, if the server reported one.
    pub exit_signal: Option<String>,
}

impl CommandOutput {
    /// Check if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Notification that a session's transport went away.
#[derive(Debug, Clone)]
pub struct SessionClosed {
    /// Pool key of the session.
    pub key: String,
    /// Connection id assigned when the session was dialed.
    pub id: u64,
    /// Human-readable cause.
    pub reason: String,
}

/// Handed to a session at dial time so it can report its own close/error
/// events back to whoever owns it.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    key: String,
    id: u64,
    tx: mpsc::UnboundedSender<SessionClosed>,
}

impl CloseNotifier {
    /// Create a notifier for connection `id` under `key`.
    pub fn new(key: impl Into<String>, id: u64, tx: mpsc::UnboundedSender<SessionClosed>) -> Self {
        Self {
            key: key.into(),
            id,
            tx,
        }
    }

    /// Pool key of the session.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Report that the transport closed.
    pub fn notify(&self, reason: impl Into<String>) {
        // The receiver may already be gone during shutdown.
        let _ = self.tx.send(SessionClosed {
            key: self.key.clone(),
            id: self.id,
            reason: reason.into(),
        });
    }
}

/// An authenticated connection to one remote host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` on a fresh channel and wait for the channel to close.
    async fn exec(&self, command: &str, options: ExecOptions) -> Result<CommandOutput>;

    /// Write `contents` to `path` and apply `mode`.
    async fn upload(&self, path: &str, contents: &[u8], mode: u32) -> Result<()>;

    /// Read `path`. A missing or unreadable file is `Ok(None)`.
    async fn download(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Open an interactive shell on a pseudo-terminal.
    async fn open_shell(&self, size: PtySize) -> Result<ShellSession>;

    /// Whether the underlying transport has shut down.
    fn is_closed(&self) -> bool;

    /// Disconnect. Best-effort.
    async fn close(&self);
}

/// Dials new sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a session to `target`.
    ///
    /// The session reports its own close/error events through `closed`.
    async fn connect(
        &self,
        target: &ConnectionTarget,
        closed: CloseNotifier,
    ) -> Result<Arc<dyn RemoteSession>>;
}

/// Input accepted by an interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    /// Bytes typed by the user.
    Data(Vec<u8>),
    /// Terminal resize.
    Resize(PtySize),
    /// Close the channel.
    Close,
}

/// Output produced by an interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Terminal output.
    Output(Vec<u8>),
    /// The shell process exited.
    Exit(u32),
}

/// Cloneable input side of a shell.
#[derive(Debug, Clone)]
pub struct ShellWriter {
    input: mpsc::Sender<ShellInput>,
}

impl ShellWriter {
    async fn send(&self, input: ShellInput) -> Result<()> {
        self.input
            .send(input)
            .await
            .map_err(|_| EngineError::Ssh("shell channel closed".into()))
    }

    /// Send bytes to the shell.
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send(ShellInput::Data(data.into())).await
    }

    /// Resize the pseudo-terminal.
    pub async fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        self.send(ShellInput::Resize(PtySize { cols, rows })).await
    }

    /// Close the shell channel.
    pub async fn close(&self) -> Result<()> {
        self.send(ShellInput::Close).await
    }
}

/// A live interactive shell channel.
///
/// Input goes through a [`ShellWriter`]; output arrives from
/// [`next_event`](Self::next_event) until the channel ends.
#[derive(Debug)]
pub struct ShellSession {
    writer: ShellWriter,
    events: mpsc::Receiver<ShellEvent>,
}

/// Transport-side half of a [`ShellSession`].
#[derive(Debug)]
pub struct ShellEndpoint {
    /// Input forwarded from the user.
    pub inputs: mpsc::Receiver<ShellInput>,
    /// Output to deliver to the user.
    pub events: mpsc::Sender<ShellEvent>,
}

impl ShellSession {
    /// Create a connected session/endpoint pair.
    pub fn pair() -> (Self, ShellEndpoint) {
        let (input_tx, input_rx) = mpsc::channel(SHELL_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(SHELL_BUFFER);
        (
            Self {
                writer: ShellWriter { input: input_tx },
                events: event_rx,
            },
            ShellEndpoint {
                inputs: input_rx,
                events: event_tx,
            },
        )
    }

    /// Input side of the shell.
    pub fn writer(&self) -> &ShellWriter {
        &self.writer
    }

    /// Wait for the next output event. `None` once the channel has ended.
    pub async fn next_event(&mut self) -> Option<ShellEvent> {
        self.events.recv().await
    }

    /// Split into independently owned input and output halves.
    pub fn into_parts(self) -> (ShellWriter, mpsc::Receiver<ShellEvent>) {
        (self.writer, self.events)
    }
}
