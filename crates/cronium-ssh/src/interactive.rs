//! Interactive terminals over pooled connections.

use crate::error::Result;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::target::ConnectionTarget;
use crate::transport::{PtySize, ShellInput, ShellSession};
use std::sync::Arc;

/// Opens PTY shells and pre-warms connections for terminal users.
pub struct TerminalManager {
    pool: Arc<ConnectionPool>,
}

impl TerminalManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Open an `xterm-256color` shell of `cols` x `rows` on `target`.
    ///
    /// The connection is marked interactive, so the pool keeps it for the
    /// longer terminal idle timeout. The connection stays leased while the
    /// shell is open and traffic in either direction counts as use.
    pub async fn open_shell(
        &self,
        target: &ConnectionTarget,
        cols: u32,
        rows: u32,
    ) -> Result<ShellSession> {
        let conn = self.pool.acquire(target, false).await?;
        conn.mark_interactive();

        let shell = match conn.session().open_shell(PtySize { cols, rows }).await {
            Ok(shell) => shell,
            Err(e) => {
                self.pool.release(&conn).await;
                return Err(e);
            }
        };
        tracing::info!(key = %conn.key(), cols, rows, "Interactive shell opened");

        Ok(relay(shell, Arc::clone(&self.pool), conn))
    }

    /// Make sure a live connection to `target` is pooled.
    ///
    /// A cached connection gets a liveness round-trip. Returns `false`
    /// instead of failing.
    pub async fn prewarm(&self, target: &ConnectionTarget) -> bool {
        match self.pool.acquire(target, false).await {
            Ok(conn) => {
                self.pool.release(&conn).await;
                tracing::debug!(key = %conn.key(), "Connection pre-warmed");
                true
            }
            Err(e) => {
                tracing::warn!(key = %target.key(), error = %e, "Pre-warm failed");
                false
            }
        }
    }
}

/// Wrap `shell` so every input and output refreshes the connection.
///
/// The lease taken by `open_shell` is returned when the relay ends.
fn relay(shell: ShellSession, pool: Arc<ConnectionPool>, conn: Arc<PooledConnection>) -> ShellSession {
    let (outer, mut endpoint) = ShellSession::pair();
    let (writer, mut events) = shell.into_parts();

    tokio::spawn(async move {
        let mut input_open = true;
        loop {
            tokio::select! {
                input = endpoint.inputs.recv(), if input_open => {
                    conn.touch();
                    let sent = match input {
                        Some(ShellInput::Data(bytes)) => writer.write(bytes).await,
                        Some(ShellInput::Resize(size)) => writer.resize(size.cols, size.rows).await,
                        // Keep draining output until the shell reports its exit.
                        Some(ShellInput::Close) | None => {
                            input_open = false;
                            writer.close().await
                        }
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        conn.touch();
                        if endpoint.events.send(event).await.is_err() {
                            let _ = writer.close().await;
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        pool.release(&conn).await;
        tracing::debug!(key = %conn.key(), "Interactive shell closed");
    });

    outer
}
