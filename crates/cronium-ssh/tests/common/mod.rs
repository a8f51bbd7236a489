//! Shared test transports.
//!
//! `MockConnector` hands out in-memory sessions whose behavior tests flip at
//! will. `LocalConnector` runs every command on this machine through `sh`,
//! so full executions can be exercised without an SSH server.

#![allow(dead_code)]

use async_trait::async_trait;
use cronium_ssh::transport::{ShellEvent, ShellInput};
use cronium_ssh::{
    CloseNotifier, CommandOutput, ConnectionTarget, Connector, Credentials, EngineError,
    ExecOptions, PtySize, RemoteSession, Result, ShellSession, Variable, VariableStore,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn target(host: &str) -> ConnectionTarget {
    ConnectionTarget::new(host, "deploy", Credentials::password("secret"))
}

// ============================================================================
// In-memory transport
// ============================================================================

/// Session that answers every command with empty success.
pub struct MockSession {
    pub id: usize,
    pub closed: AtomicBool,
    pub fail_exec: AtomicBool,
    pub execs: AtomicUsize,
    notifier: CloseNotifier,
}

impl MockSession {
    /// Simulate the transport dropping out from under the pool.
    pub fn drop_transport(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.notifier.notify(reason);
    }

    pub fn is_closed_now(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, _command: &str, _options: ExecOptions) -> Result<CommandOutput> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(EngineError::Ssh("channel open failed".into()));
        }
        Ok(CommandOutput {
            exit_status: Some(0),
            ..Default::default()
        })
    }

    async fn upload(&self, _path: &str, _contents: &[u8], _mode: u32) -> Result<()> {
        Ok(())
    }

    async fn download(&self, _path: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Echo shell: every input chunk comes straight back as output.
    async fn open_shell(&self, _size: PtySize) -> Result<ShellSession> {
        let (shell, mut endpoint) = ShellSession::pair();
        tokio::spawn(async move {
            while let Some(input) = endpoint.inputs.recv().await {
                match input {
                    ShellInput::Data(bytes) => {
                        if endpoint.events.send(ShellEvent::Output(bytes)).await.is_err() {
                            break;
                        }
                    }
                    ShellInput::Resize(size) => {
                        let note = format!("resized {}x{}", size.cols, size.rows);
                        let _ = endpoint.events.send(ShellEvent::Output(note.into_bytes())).await;
                    }
                    ShellInput::Close => {
                        let _ = endpoint.events.send(ShellEvent::Exit(0)).await;
                        break;
                    }
                }
            }
        });
        Ok(shell)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector producing [`MockSession`]s.
#[derive(Default)]
pub struct MockConnector {
    pub delay: Duration,
    pub fail: AtomicBool,
    pub dials: AtomicUsize,
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        let connector = Self::default();
        connector.fail.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index])
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        closed: CloseNotifier,
    ) -> Result<Arc<dyn RemoteSession>> {
        let id = self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Unreachable {
                key: target.key(),
                reason: "connection refused".into(),
            });
        }
        let session = Arc::new(MockSession {
            id,
            closed: AtomicBool::new(false),
            fail_exec: AtomicBool::new(false),
            execs: AtomicUsize::new(0),
            notifier: closed,
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

// ============================================================================
// Local transport
// ============================================================================

/// Runs commands on the local machine.
#[derive(Default)]
pub struct LocalSession {
    pub closed: AtomicBool,
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn exec(&self, command: &str, _options: ExecOptions) -> Result<CommandOutput> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_status: output.status.code().map(|c| c as u32),
            exit_signal: None,
        })
    }

    async fn upload(&self, path: &str, contents: &[u8], mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::write(path, contents).await?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(tokio::fs::read(path).await.ok())
    }

    async fn open_shell(&self, _size: PtySize) -> Result<ShellSession> {
        Err(EngineError::Ssh("local shells are not supported".into()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector producing [`LocalSession`]s.
#[derive(Default)]
pub struct LocalConnector {
    pub sessions: Mutex<Vec<Arc<LocalSession>>>,
}

impl LocalConnector {
    pub fn dials(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session(&self, index: usize) -> Arc<LocalSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index])
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        _target: &ConnectionTarget,
        _closed: CloseNotifier,
    ) -> Result<Arc<dyn RemoteSession>> {
        let session = Arc::new(LocalSession::default());
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Scratch directory removed on drop.
pub struct TempRoot {
    path: PathBuf,
}

impl TempRoot {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("cronium-test-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path).expect("create temp root");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_str(&self) -> &str {
        self.path.to_str().expect("utf-8 temp path")
    }

    /// Entries currently in the root.
    pub fn entries(&self) -> Vec<String> {
        std::fs::read_dir(&self.path)
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub fn has_command(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// ============================================================================
// Variable stores
// ============================================================================

/// Store call log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Set(String, String),
    Delete(String),
}

/// Store that serves a fixed snapshot and records every write.
#[derive(Default)]
pub struct RecordingStore {
    pub initial: Vec<Variable>,
    pub calls: Mutex<Vec<StoreCall>>,
    pub fail: bool,
}

impl RecordingStore {
    pub fn with(pairs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            initial: pairs
                .iter()
                .map(|(k, v)| Variable {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VariableStore for RecordingStore {
    async fn get(&self, _user_id: &str) -> Result<Vec<Variable>> {
        if self.fail {
            return Err(EngineError::VariableStore("database unavailable".into()));
        }
        Ok(self.initial.clone())
    }

    async fn set(&self, _user_id: &str, key: &str, value: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::Set(key.to_string(), value.to_string()));
        Ok(())
    }

    async fn delete(&self, _user_id: &str, key: &str) -> Result<()> {
        self.calls.lock().unwrap().push(StoreCall::Delete(key.to_string()));
        Ok(())
    }
}
