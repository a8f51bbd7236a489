//! # cronium-mcp
//!
//! MCP (Model Context Protocol) server and terminal gateway for the Cronium
//! SSH execution engine.
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run -p cronium-mcp
//! ```
//!
//! Configure via environment variables:
//!
//! ```bash
//! export CRONIUM_TRANSPORT=http
//! export CRONIUM_HTTP_PORT=9090
//! export CRONIUM_SSH_MAX_CONNECTIONS=100
//! export CRONIUM_WORKDIR_ROOT=/var/tmp
//! cargo run -p cronium-mcp
//! ```
//!
//! ## MCP Tools
//!
//! | Tool | Description |
//! |------|-------------|
//! | `run_script` | Run a bash, python, node or http script on a remote host |
//! | `prewarm_connection` | Open or verify a pooled connection |
//! | `pool_status` | List pooled connections and counters |
//!
//! Interactive shells are served over the `/terminal` WebSocket.

mod config;
pub mod http;
mod server;
mod types;

pub use config::{
    ConfigError, CroniumConfig, TransportMode, MAX_PAYLOAD_SIZE_BYTES, MAX_SCRIPT_SIZE_BYTES,
};
pub use server::CroniumServer;
pub use types::*;
