//! Script execution over pooled SSH sessions.
//!
//! One [`ScriptExecutor::run`] call is strictly sequential: obtain a session,
//! stage a fresh working directory, run the wrapped script under a hard
//! deadline, read back the result files, write variable changes to the
//! store, clean up. It never fails; every error is reduced to an
//! [`ExecutionResult`] whose `stderr` carries the message.

use crate::config::ExecutorConfig;
use crate::error::{EngineError, Result};
use crate::escape::{is_env_name, quote};
use crate::materializer::{self, ScriptLanguage, SCRIPT_MODE};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::shell::ShellResolver;
use crate::target::ConnectionTarget;
use crate::transport::{ExecOptions, RemoteSession};
use crate::variables::{diff_variables, parse_variables, VariableSet, VariableStore};
use crate::workdir::{
    sweep_command, WorkDir, CONDITION_FILE, EVENT_FILE, INPUT_FILE, OUTPUT_FILE, VARIABLES_FILE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Mode of the JSON files staged for the script.
const DATA_MODE: u32 = 0o644;

/// Bound on the cleanup command.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a run executes.
#[derive(Clone)]
pub enum ExecutionTarget {
    /// Borrow a connection from the pool.
    Pooled(ConnectionTarget),
    /// Dial a private session and close it afterwards.
    Unpooled(ConnectionTarget),
    /// Caller-owned session. Never closed by the executor.
    Session {
        /// Key used for shell caching and logs.
        key: String,
        /// The session.
        session: Arc<dyn RemoteSession>,
    },
}

impl fmt::Debug for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pooled(target) => f.debug_tuple("Pooled").field(target).finish(),
            Self::Unpooled(target) => f.debug_tuple("Unpooled").field(target).finish(),
            Self::Session { key, .. } => f.debug_struct("Session").field("key", key).finish(),
        }
    }
}

/// One script run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: ScriptLanguage,
    /// Script body, or the JSON descriptor for HTTP.
    pub script: String,
    /// Environment exported before the interpreter starts.
    pub env: BTreeMap<String, String>,
    pub target: Option<ExecutionTarget>,
    /// Hard deadline. Falls back to the executor default.
    pub timeout: Option<Duration>,
    /// Contents of `input.json`.
    pub input: Value,
    /// Contents of `event.json`.
    pub event: Value,
    /// Variable snapshot. Loaded from the store when absent.
    pub variables: Option<VariableSet>,
    /// Owner of the variables.
    pub user_id: Option<String>,
}

impl ExecutionRequest {
    /// A request with empty input, event and environment.
    pub fn new(language: ScriptLanguage, script: impl Into<String>) -> Self {
        Self {
            language,
            script: script.into(),
            env: BTreeMap::new(),
            target: None,
            timeout: None,
            input: Value::Object(Default::default()),
            event: Value::Object(Default::default()),
            variables: None,
            user_id: None,
        }
    }

    pub fn with_target(mut self, target: ExecutionTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_event(mut self, event: Value) -> Self {
        self.event = event;
        self
    }

    pub fn with_variables(mut self, variables: VariableSet) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Parsed `output.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_output: Option<Value>,
    /// Parsed `condition.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_timeout: Option<bool>,
    /// Remote exit status. Informational; a non-zero code is not an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
}

impl ExecutionResult {
    /// Result for a run that failed before or during execution.
    pub fn from_error(err: &EngineError) -> Self {
        Self {
            stderr: err.to_string(),
            is_timeout: Some(err.is_timeout()),
            ..Self::default()
        }
    }

    /// Result for a run that hit its deadline.
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            stderr: format!("Execution timed out after {}ms", timeout.as_millis()),
            is_timeout: Some(true),
            ..Self::default()
        }
    }

    /// Whether the run hit its deadline.
    pub fn is_timeout(&self) -> bool {
        self.is_timeout.unwrap_or(false)
    }
}

/// A session held for the length of one run.
enum Lease {
    Pooled(Arc<PooledConnection>),
    Unpooled(Arc<dyn RemoteSession>),
    Direct(Arc<dyn RemoteSession>),
}

impl Lease {
    fn session(&self) -> &Arc<dyn RemoteSession> {
        match self {
            Self::Pooled(conn) => conn.session(),
            Self::Unpooled(session) | Self::Direct(session) => session,
        }
    }

    async fn finish(self, pool: &ConnectionPool) {
        match self {
            Self::Pooled(conn) => pool.release(&conn).await,
            Self::Unpooled(session) => session.close().await,
            Self::Direct(_) => {}
        }
    }
}

/// Runs scripts on remote hosts.
pub struct ScriptExecutor {
    pool: Arc<ConnectionPool>,
    shells: ShellResolver,
    store: Option<Arc<dyn VariableStore>>,
    config: ExecutorConfig,
}

impl ScriptExecutor {
    /// Create an executor without a variable store.
    pub fn new(pool: Arc<ConnectionPool>, config: ExecutorConfig) -> Self {
        Self {
            pool,
            shells: ShellResolver::new(config.default_shell.clone()),
            store: None,
            config,
        }
    }

    /// Persist variable changes to `store`.
    pub fn with_variable_store(mut self, store: Arc<dyn VariableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The pool sessions are borrowed from.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run one script. Never fails.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let start = Instant::now();
        let language = request.language;

        let result = match self.try_run(request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(language = %language, error = %e, "Execution failed");
                ExecutionResult::from_error(&e)
            }
        };

        tracing::info!(
            language = %language,
            exit_code = ?result.exit_code,
            timed_out = result.is_timeout(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Execution finished"
        );
        result
    }

    async fn try_run(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let (lease, key) = match &request.target {
            None => return Err(EngineError::NoSession),
            Some(ExecutionTarget::Pooled(target)) => (
                Lease::Pooled(self.pool.acquire(target, false).await?),
                target.key(),
            ),
            Some(ExecutionTarget::Unpooled(target)) => (
                Lease::Unpooled(self.pool.connect_unpooled(target).await?),
                target.key(),
            ),
            Some(ExecutionTarget::Session { key, session }) => {
                (Lease::Direct(Arc::clone(session)), key.clone())
            }
        };

        let workdir = WorkDir::generate(&self.config.workdir_root, &self.config.workdir_prefix);
        let session = lease.session().as_ref();
        tracing::debug!(key = %key, workdir = %workdir.path(), "Starting execution");

        let outcome = self.execute(session, &key, &workdir, &request).await;
        self.cleanup(session, &key, &workdir).await;
        lease.finish(&self.pool).await;
        outcome
    }

    async fn execute(
        &self,
        session: &dyn RemoteSession,
        key: &str,
        workdir: &WorkDir,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let wrapped = materializer::materialize(request.language, &request.script)?;
        let snapshot = self.load_snapshot(request).await?;

        let created = session
            .exec(&workdir.create_command(), ExecOptions::default())
            .await?;
        if !created.success() {
            return Err(EngineError::Ssh(format!(
                "failed to create working directory {}: {}",
                workdir.path(),
                created.stderr.trim()
            )));
        }

        session
            .upload(&workdir.file(INPUT_FILE), &serde_json::to_vec_pretty(&request.input)?, DATA_MODE)
            .await?;
        session
            .upload(&workdir.file(EVENT_FILE), &serde_json::to_vec_pretty(&request.event)?, DATA_MODE)
            .await?;
        session
            .upload(&workdir.file(VARIABLES_FILE), &serde_json::to_vec_pretty(&snapshot)?, DATA_MODE)
            .await?;
        for file in &wrapped.files {
            session
                .upload(&workdir.file(file.name), file.contents.as_bytes(), SCRIPT_MODE)
                .await?;
        }

        let shell = self.shells.resolve(key, session).await;
        let command = build_command(&shell, workdir, &request.env, &wrapped.command);
        let timeout = self.run_timeout(request.timeout);

        let output = match tokio::time::timeout(timeout, session.exec(&command, ExecOptions::with_pty())).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "Execution timed out");
                self.kill(session, key, workdir).await;
                return Ok(ExecutionResult::timed_out(timeout));
            }
        };

        let mut result = ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_status,
            ..ExecutionResult::default()
        };
        result.script_output = read_json(session, workdir, OUTPUT_FILE).await;
        result.condition = read_json(session, workdir, CONDITION_FILE)
            .await
            .and_then(|v| v.get("condition").and_then(Value::as_bool));

        if let (Some(user_id), Some(store)) = (&request.user_id, &self.store) {
            self.sync_variables(session, workdir, &snapshot, user_id, store.as_ref())
                .await?;
        }

        Ok(result)
    }

    /// Deadline for one run.
    ///
    /// Capped so a run always ends before the stale-directory sweep can
    /// consider its working directory abandoned.
    fn run_timeout(&self, requested: Option<Duration>) -> Duration {
        let timeout = requested
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.default_timeout);
        let limit = self.config.max_run_timeout();
        if timeout > limit {
            tracing::warn!(
                requested_ms = timeout.as_millis() as u64,
                limit_ms = limit.as_millis() as u64,
                "Clamping run timeout below the stale working directory age"
            );
            return limit;
        }
        timeout
    }

    async fn load_snapshot(&self, request: &ExecutionRequest) -> Result<VariableSet> {
        if let Some(variables) = &request.variables {
            return Ok(variables.clone());
        }
        match (&request.user_id, &self.store) {
            (Some(user_id), Some(store)) => Ok(store
                .get(user_id)
                .await?
                .into_iter()
                .map(|v| (v.key, v.value))
                .collect()),
            _ => Ok(VariableSet::new()),
        }
    }

    async fn sync_variables(
        &self,
        session: &dyn RemoteSession,
        workdir: &WorkDir,
        snapshot: &VariableSet,
        user_id: &str,
        store: &dyn VariableStore,
    ) -> Result<()> {
        let Some(bytes) = session.download(&workdir.file(VARIABLES_FILE)).await? else {
            tracing::debug!(user_id = %user_id, "Variables file missing after run");
            return Ok(());
        };
        let after = match parse_variables(&bytes) {
            Ok(after) => after,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Ignoring unreadable variables file");
                return Ok(());
            }
        };

        let diff = diff_variables(snapshot, &after);
        if diff.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            user_id = %user_id,
            set = diff.set.len(),
            deleted = diff.deleted.len(),
            "Writing variable changes"
        );
        diff.apply(store, user_id).await
    }

    /// Stop whatever is still running from `workdir`. Best-effort.
    async fn kill(&self, session: &dyn RemoteSession, key: &str, workdir: &WorkDir) {
        let command = workdir.kill_command();
        let kill = tokio::time::timeout(CLEANUP_TIMEOUT, session.exec(&command, ExecOptions::default()));
        if let Ok(Err(e)) = kill.await {
            tracing::debug!(key = %key, error = %e, "Failed to stop timed-out script");
        }
    }

    /// Remove `workdir` and stale siblings. Failures are only logged.
    async fn cleanup(&self, session: &dyn RemoteSession, key: &str, workdir: &WorkDir) {
        let command = format!(
            "{}; {}",
            workdir.remove_command(),
            sweep_command(
                &self.config.workdir_root,
                &self.config.workdir_prefix,
                self.config.stale_workdir_age
            )
        );
        match tokio::time::timeout(CLEANUP_TIMEOUT, session.exec(&command, ExecOptions::default())).await {
            Ok(Ok(output)) if !output.success() => {
                tracing::warn!(key = %key, workdir = %workdir.path(), stderr = %output.stderr.trim(), "Cleanup reported failure");
            }
            Ok(Ok(_)) => tracing::trace!(key = %key, workdir = %workdir.path(), "Working directory removed"),
            Ok(Err(e)) => tracing::warn!(key = %key, workdir = %workdir.path(), error = %e, "Cleanup failed"),
            Err(_) => tracing::warn!(key = %key, workdir = %workdir.path(), "Cleanup timed out"),
        }
    }
}

/// Soft read of a JSON file; missing or invalid is `None`.
async fn read_json(session: &dyn RemoteSession, workdir: &WorkDir, name: &str) -> Option<Value> {
    match session.download(&workdir.file(name)).await {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(file = name, error = %e, "Ignoring invalid result file");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(file = name, error = %e, "Failed to read result file");
            None
        }
    }
}

/// `<shell> -l -c '<cd dir && export K=v; ... interpreter>'`.
fn build_command(
    shell: &str,
    workdir: &WorkDir,
    env: &BTreeMap<String, String>,
    interpreter: &str,
) -> String {
    let mut inner = format!("cd {} && ", quote(workdir.path()));
    for (name, value) in env {
        if !is_env_name(name) {
            tracing::warn!(name = %name, "Skipping invalid environment variable name");
            continue;
        }
        inner.push_str(&format!("export {name}={}; ", quote(value)));
    }
    inner.push_str(interpreter);
    format!("{} -l -c {}", quote(shell), quote(&inner))
}
