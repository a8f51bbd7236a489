//! CroniumServer - MCP server that exposes remote script execution as tools.
//!
//! This module implements ServerHandler manually so each tool's JSON schema
//! comes straight from the parameter types in [`crate::types`].

use crate::config::{CroniumConfig, MAX_PAYLOAD_SIZE_BYTES, MAX_SCRIPT_SIZE_BYTES};
use crate::types::*;

use cronium_ssh::{
    ConnectionPool, Connector, ExecutionRequest, ExecutionTarget, MemoryVariableStore,
    ScriptExecutor, ScriptLanguage, SshConnector, TerminalManager, VariableStore,
};
use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData,
};
use schemars::schema_for;
use std::sync::Arc;
use std::time::Duration;

/// MCP server for Cronium script execution.
///
/// Owns the connection pool shared by script runs, pre-warming and the
/// terminal WebSocket.
#[derive(Clone)]
pub struct CroniumServer {
    pool: Arc<ConnectionPool>,
    executor: Arc<ScriptExecutor>,
    terminals: Arc<TerminalManager>,
    config: CroniumConfig,
}

impl CroniumServer {
    /// Create a server that dials real SSH sessions and keeps variables in memory.
    pub fn new(config: CroniumConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(SshConnector::new()),
            Arc::new(MemoryVariableStore::new()),
        )
    }

    /// Create a server over a custom connector and variable store.
    pub fn with_parts(
        config: CroniumConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn VariableStore>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.engine.pool.clone(), connector));
        let executor = ScriptExecutor::new(Arc::clone(&pool), config.engine.executor.clone())
            .with_variable_store(store);
        let terminals = TerminalManager::new(Arc::clone(&pool));

        tracing::info!(
            max_connections = config.engine.pool.max_connections,
            idle_timeout_secs = config.engine.pool.idle_timeout.as_secs(),
            "Connection pool configured"
        );

        Self {
            pool,
            executor: Arc::new(executor),
            terminals: Arc::new(terminals),
            config,
        }
    }

    /// Start the pool's reaper task.
    pub fn start_pool(&self) {
        self.pool.start();
        tracing::info!("Connection pool started");
    }

    /// Close every pooled connection and stop the reaper.
    pub async fn shutdown_pool(&self) {
        self.pool.shutdown().await;
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Get a reference to the terminal manager.
    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &CroniumConfig {
        &self.config
    }

    /// Truncate sensitive content for logging.
    fn truncate_for_log(s: &str, max_len: usize) -> String {
        if s.len() <= max_len {
            s.to_string()
        } else {
            let mut end = max_len;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... ({} bytes total)", &s[..end], s.len())
        }
    }

    /// Validate input size.
    fn validate_size(len: usize, max_bytes: usize, field_name: &str) -> Result<(), String> {
        if len > max_bytes {
            Err(format!(
                "{field_name} exceeds maximum size ({len} bytes > {max_bytes} bytes)"
            ))
        } else {
            Ok(())
        }
    }

    fn payload_len(value: &Option<serde_json::Value>) -> usize {
        value
            .as_ref()
            .and_then(|v| serde_json::to_vec(v).ok())
            .map_or(0, |bytes| bytes.len())
    }

    /// Helper to create success result with JSON content
    fn json_result<T: serde::Serialize>(data: &T) -> CallToolResult {
        match serde_json::to_string_pretty(data) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => CallToolResult::error(vec![Content::text(format!(
                "JSON serialization error: {e}"
            ))]),
        }
    }

    /// Helper to create error result
    fn error_result(message: impl Into<String>) -> CallToolResult {
        CallToolResult::error(vec![Content::text(message.into())])
    }

    /// Convert schemars RootSchema to rmcp JsonObject
    fn schema_to_json_object<T: schemars::JsonSchema>(
    ) -> Arc<serde_json::Map<String, serde_json::Value>> {
        let schema = schema_for!(T);
        let json = serde_json::to_value(&schema.schema).unwrap_or_else(|_| serde_json::json!({}));
        match json {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        }
    }

    /// Create an empty schema for tools with no parameters
    fn empty_schema() -> Arc<serde_json::Map<String, serde_json::Value>> {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), serde_json::json!("object"));
        map.insert("properties".into(), serde_json::json!({}));
        Arc::new(map)
    }

    // ========================================================================
    // Tool Implementations
    // ========================================================================

    async fn handle_run_script(
        &self,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> CallToolResult {
        let params: RunScriptParams = match args
            .map(|a| serde_json::from_value(serde_json::Value::Object(a)))
            .transpose()
        {
            Ok(Some(p)) => p,
            Ok(None) => {
                return Self::error_result(
                    "Missing required parameters: host, username, language, script",
                )
            }
            Err(e) => return Self::error_result(format!("Invalid parameters: {e}")),
        };

        let sizes = [
            (params.script.len(), MAX_SCRIPT_SIZE_BYTES, "script"),
            (Self::payload_len(&params.input), MAX_PAYLOAD_SIZE_BYTES, "input"),
            (Self::payload_len(&params.event), MAX_PAYLOAD_SIZE_BYTES, "event"),
        ];
        for (len, max, field) in sizes {
            if let Err(e) = Self::validate_size(len, max, field) {
                return Self::error_result(e);
            }
        }

        let language: ScriptLanguage = match params.language.parse() {
            Ok(language) => language,
            Err(e) => return Self::error_result(format!("{e}")),
        };

        let target = params.target.into_target();
        tracing::info!(
            key = %target.key(),
            language = %language,
            pooled = params.pooled,
            script = %Self::truncate_for_log(&params.script, 100),
            "Running script"
        );

        let target = if params.pooled {
            ExecutionTarget::Pooled(target)
        } else {
            ExecutionTarget::Unpooled(target)
        };
        let mut request = ExecutionRequest::new(language, params.script).with_target(target);
        request.env = params.env;
        if let Some(ms) = params.timeout_ms {
            request = request.with_timeout(Duration::from_millis(ms));
        }
        if let Some(input) = params.input {
            request = request.with_input(input);
        }
        if let Some(event) = params.event {
            request = request.with_event(event);
        }
        if let Some(variables) = params.variables {
            request = request.with_variables(variables);
        }
        if let Some(user_id) = params.user_id {
            request = request.with_user_id(user_id);
        }

        let result = self.executor.run(request).await;
        Self::json_result(&result)
    }

    async fn handle_prewarm_connection(
        &self,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> CallToolResult {
        let params: PrewarmParams = match args
            .map(|a| serde_json::from_value(serde_json::Value::Object(a)))
            .transpose()
        {
            Ok(Some(p)) => p,
            _ => return Self::error_result("Missing required parameters: host, username"),
        };

        let target = params.target.into_target();
        tracing::info!(key = %target.key(), "Pre-warming connection");

        let success = self.terminals.prewarm(&target).await;
        Self::json_result(&PrewarmResult { success })
    }

    async fn handle_pool_status(&self) -> CallToolResult {
        tracing::debug!("Reporting pool status");

        let keys = self.pool.keys().await;
        let mut connections = Vec::with_capacity(keys.len());
        for key in keys {
            let breaker = self
                .pool
                .breaker_state(&key)
                .await
                .map_or_else(|| "closed".to_string(), |state| state.to_string());
            connections.push(ConnectionInfo { key, breaker });
        }

        let stats = self.pool.stats();
        Self::json_result(&PoolStatusResult {
            size: connections.len(),
            connections,
            stats: stats.snapshot(),
            reuse_rate: stats.reuse_rate(),
        })
    }

    /// Build the list of available tools
    fn build_tools_list() -> Vec<Tool> {
        vec![
            Tool::new(
                "run_script",
                "Run a bash, python, node or http script on a remote host over SSH. \
                 Returns stdout, stderr, exit code, the script's output() value and condition.",
                Self::schema_to_json_object::<RunScriptParams>(),
            ),
            Tool::new(
                "prewarm_connection",
                "Open (or verify) a pooled SSH connection so the next run starts immediately.",
                Self::schema_to_json_object::<PrewarmParams>(),
            ),
            Tool::new(
                "pool_status",
                "List pooled SSH connections and pool counters.",
                Self::empty_schema(),
            ),
        ]
    }
}

impl ServerHandler for CroniumServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Cronium MCP Server - Run scripts on remote hosts over pooled SSH connections. \
                 Use run_script with host credentials and a language (bash, python, node, http). \
                 Scripts read input() and event(), report results with output() and \
                 setCondition(), and manage variables with getVariable()/setVariable(). \
                 Use prewarm_connection before latency-sensitive runs and pool_status to inspect the pool."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: Self::build_tools_list(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let result = match request.name.as_ref() {
            "run_script" => self.handle_run_script(request.arguments).await,
            "prewarm_connection" => self.handle_prewarm_connection(request.arguments).await,
            "pool_status" => self.handle_pool_status().await,
            _ => Self::error_result(format!("Unknown tool: {}", request.name)),
        };

        Ok(result)
    }
}
