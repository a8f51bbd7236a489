//! Tool parameter and response types.
//!
//! These types use serde for serialization and schemars for automatic
//! JSON Schema generation required by MCP. The terminal WebSocket reuses
//! the same target description.

use cronium_ssh::{ConnectionTarget, Credentials, PoolStatsSnapshot};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Targets
// ============================================================================

/// Remote host to connect to.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TargetParams {
    /// Hostname or IP address.
    pub host: String,

    /// SSH port (default: 22).
    #[serde(default)]
    pub port: Option<u16>,

    /// Login user.
    pub username: String,

    /// Password for password authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// PEM/OpenSSH private key.
    #[serde(default)]
    pub private_key: Option<String>,

    /// Passphrase of an encrypted private key.
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Expected host key fingerprint (`SHA256:...`).
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

impl TargetParams {
    /// Convert into an engine connection target.
    pub fn into_target(self) -> ConnectionTarget {
        let credentials = Credentials {
            private_key: self.private_key,
            passphrase: self.passphrase,
            password: self.password,
        };
        let mut target = ConnectionTarget::new(self.host, self.username, credentials);
        if let Some(port) = self.port {
            target = target.with_port(port);
        }
        if let Some(fingerprint) = self.host_key_fingerprint {
            target = target.with_host_key_fingerprint(fingerprint);
        }
        target
    }
}

// ============================================================================
// Script Execution
// ============================================================================

fn default_pooled() -> bool {
    true
}

/// Parameters for running a script on a remote host.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunScriptParams {
    /// Where to run.
    #[serde(flatten)]
    pub target: TargetParams,

    /// Script language: bash, python, node or http.
    pub language: String,

    /// Script body. For `http` a JSON request descriptor.
    pub script: String,

    /// Environment variables exported before the script starts.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Hard deadline in milliseconds (default: server setting).
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Value returned by `input()`.
    #[serde(default)]
    pub input: Option<serde_json::Value>,

    /// Value returned by `event()`.
    #[serde(default)]
    pub event: Option<serde_json::Value>,

    /// Variable snapshot. Loaded from the store for `user_id` when omitted.
    #[serde(default)]
    pub variables: Option<BTreeMap<String, String>>,

    /// Owner of the variables the script reads and writes.
    #[serde(default)]
    pub user_id: Option<String>,

    /// Reuse a pooled connection (default: true). `false` dials a
    /// dedicated session that is closed afterwards.
    #[serde(default = "default_pooled")]
    pub pooled: bool,
}

/// Parameters for pre-warming a connection.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PrewarmParams {
    /// Host to connect to.
    #[serde(flatten)]
    pub target: TargetParams,
}

/// Result of pre-warming a connection.
#[derive(Debug, Serialize, JsonSchema)]
pub struct PrewarmResult {
    /// Whether a live connection is now pooled.
    pub success: bool,
}

// ============================================================================
// Pool Status
// ============================================================================

/// One pooled connection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// `user@host:port`.
    pub key: String,
    /// Circuit breaker state for the key.
    pub breaker: String,
}

/// Result of `pool_status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatusResult {
    /// Number of pooled connections.
    pub size: usize,
    /// Pooled connections, sorted by key.
    pub connections: Vec<ConnectionInfo>,
    /// Counter snapshot.
    pub stats: PoolStatsSnapshot,
    /// Percentage of acquisitions served by a cached connection.
    pub reuse_rate: f64,
}

// ============================================================================
// Terminal WebSocket
// ============================================================================

/// First frame of a terminal WebSocket: where to open the shell.
#[derive(Debug, Deserialize)]
pub struct TerminalOpenRequest {
    #[serde(flatten)]
    pub target: TargetParams,

    #[serde(default)]
    pub cols: Option<u32>,

    #[serde(default)]
    pub rows: Option<u32>,
}

/// Control frame sent by a terminal client after the open request.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalControl {
    Resize { cols: u32, rows: u32 },
}
