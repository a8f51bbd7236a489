//! SSH transport built on russh.
//!
//! One [`SshSession`] wraps one authenticated russh client handle. Every
//! command, file transfer and shell runs on its own channel, so concurrent
//! executions share the connection without interfering.

use super::{
    CloseNotifier, CommandOutput, Connector, ExecOptions, PtySize, RemoteSession,
    ShellEndpoint, ShellEvent, ShellInput, ShellSession,
};
use crate::error::{EngineError, Result};
use crate::escape::quote;
use crate::target::ConnectionTarget;
use async_trait::async_trait;
use russh::client::{self, DisconnectReason, Handle, Msg};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal type requested for command channels.
const EXEC_TERM: &str = "xterm";

/// Terminal type requested for interactive shells.
const SHELL_TERM: &str = "xterm-256color";

/// Interval between SSH keepalive packets.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Channel extended-data stream carrying stderr.
const STDERR_STREAM: u32 = 1;

/// Dials russh client sessions.
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    /// Create a connector with keepalives enabled and no inactivity timeout.
    ///
    /// Idle sessions are reaped by the pool, not by russh.
    pub fn new() -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        closed: CloseNotifier,
    ) -> Result<Arc<dyn RemoteSession>> {
        let key = target.key();
        let start = Instant::now();
        tracing::debug!(key = %key, "Dialing SSH host");

        if target.credentials.is_empty() {
            return Err(EngineError::Auth {
                key,
                reason: "no authentication method available: neither password nor private key provided"
                    .into(),
            });
        }

        let handler = ClientHandler {
            key: key.clone(),
            expected_fingerprint: target.host_key_fingerprint.clone(),
            closed,
        };

        let mut handle = client::connect(
            Arc::clone(&self.config),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| EngineError::Unreachable {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        authenticate(&mut handle, target, &key).await?;

        tracing::info!(
            key = %key,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "SSH session established"
        );

        Ok(Arc::new(SshSession { key, handle }))
    }
}

/// Try the private key first, then the password.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &ConnectionTarget,
    key: &str,
) -> Result<()> {
    let creds = &target.credentials;
    let mut reason = String::from("no authentication method accepted");

    if let Some(pem) = &creds.private_key {
        match russh::keys::decode_secret_key(pem, creds.passphrase.as_deref()) {
            Ok(private_key) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let auth = handle
                    .authenticate_publickey(
                        &target.username,
                        PrivateKeyWithHashAlg::new(Arc::new(private_key), hash_alg),
                    )
                    .await?;
                if auth.success() {
                    tracing::debug!(key = %key, "Authenticated with private key");
                    return Ok(());
                }
                reason = "private key rejected".into();
            }
            Err(e) if creds.password.is_none() => {
                return Err(EngineError::Auth {
                    key: key.to_string(),
                    reason: format!("failed to parse private key: {e}"),
                });
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to parse private key, falling back to password auth");
            }
        }
    }

    if let Some(password) = &creds.password {
        let auth = handle
            .authenticate_password(&target.username, password)
            .await?;
        if auth.success() {
            tracing::debug!(key = %key, "Authenticated with password");
            return Ok(());
        }
        reason = "password rejected".into();
    }

    Err(EngineError::Auth {
        key: key.to_string(),
        reason,
    })
}

/// russh event handler for one session.
struct ClientHandler {
    key: String,
    expected_fingerprint: Option<String>,
    closed: CloseNotifier,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let Some(expected) = &self.expected_fingerprint else {
            return Ok(true);
        };
        let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        if &actual == expected {
            Ok(true)
        } else {
            tracing::warn!(
                key = %self.key,
                expected = %expected,
                actual = %actual,
                "Host key fingerprint mismatch"
            );
            Ok(false)
        }
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> std::result::Result<(), Self::Error> {
        let (text, result) = match reason {
            DisconnectReason::ReceivedDisconnect(_) => ("server sent disconnect".to_string(), Ok(())),
            DisconnectReason::Error(e) => (e.to_string(), Err(e)),
        };
        tracing::debug!(key = %self.key, reason = %text, "SSH transport closed");
        self.closed.notify(text);
        result
    }
}

/// Raw channel output before UTF-8 conversion.
struct RawOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    exit_signal: Option<String>,
}

/// An authenticated russh session.
pub struct SshSession {
    key: String,
    handle: Handle<ClientHandler>,
}

impl SshSession {
    /// Open a channel, run `command`, optionally feed stdin, collect until close.
    async fn run_channel(
        &self,
        command: &str,
        pty: Option<PtySize>,
        stdin: Option<&[u8]>,
    ) -> Result<RawOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        if let Some(size) = pty {
            channel
                .request_pty(false, EXEC_TERM, size.cols, size.rows, 0, 0, &[])
                .await?;
        }
        channel.exec(true, command).await?;
        if let Some(data) = stdin {
            channel.data(data).await?;
            channel.eof().await?;
        }

        let mut output = RawOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_status: None,
            exit_signal: None,
        };
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_STREAM => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    output.exit_signal = Some(format!("{signal_name:?}"))
                }
                _ => {}
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        tracing::trace!(key = %self.key, command = %command, "Opening exec channel");
        let raw = self.run_channel(command, options.pty, None).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
            exit_status: raw.exit_status,
            exit_signal: raw.exit_signal,
        })
    }

    async fn upload(&self, path: &str, contents: &[u8], mode: u32) -> Result<()> {
        let target = quote(path);
        let command = format!("cat > {target} && chmod {mode:o} {target}");
        let raw = self.run_channel(&command, None, Some(contents)).await?;
        if raw.exit_status == Some(0) {
            tracing::trace!(key = %self.key, path = %path, size = contents.len(), "File uploaded");
            Ok(())
        } else {
            Err(EngineError::Ssh(format!(
                "failed to write {path}: {}",
                String::from_utf8_lossy(&raw.stderr).trim()
            )))
        }
    }

    async fn download(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let command = format!("cat {} 2>/dev/null", quote(path));
        let raw = self.run_channel(&command, None, None).await?;
        if raw.exit_status == Some(0) {
            Ok(Some(raw.stdout))
        } else {
            Ok(None)
        }
    }

    async fn open_shell(&self, size: PtySize) -> Result<ShellSession> {
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(false, SHELL_TERM, size.cols, size.rows, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;

        let (shell, endpoint) = ShellSession::pair();
        let key = self.key.clone();
        tokio::spawn(async move {
            pump_shell(channel, endpoint).await;
            tracing::debug!(key = %key, "Shell channel ended");
        });
        Ok(shell)
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(key = %self.key, error = %e, "Disconnect failed");
        }
    }
}

/// Shuttle bytes between a russh shell channel and its [`ShellSession`].
async fn pump_shell(mut channel: Channel<Msg>, mut endpoint: ShellEndpoint) {
    loop {
        tokio::select! {
            input = endpoint.inputs.recv() => match input {
                Some(ShellInput::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        tracing::debug!(error = %e, "Shell write failed");
                        break;
                    }
                }
                Some(ShellInput::Resize(size)) => {
                    if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                        tracing::debug!(error = %e, "Shell resize failed");
                    }
                }
                Some(ShellInput::Close) | None => {
                    let _ = channel.close().await;
                    break;
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if endpoint.events.send(ShellEvent::Output(data.to_vec())).await.is_err() {
                        let _ = channel.close().await;
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    let _ = endpoint.events.send(ShellEvent::Exit(exit_status)).await;
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}
