//! Service configuration, read from `CRONIUM_*` environment variables.

use cronium_ssh::{EngineConfig, EngineError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Largest accepted script body (1 MB).
pub const MAX_SCRIPT_SIZE_BYTES: usize = 1024 * 1024;

/// Largest accepted `input` or `event` payload once serialized (10 MB).
pub const MAX_PAYLOAD_SIZE_BYTES: usize = 10 * 1024 * 1024;

const DEFAULT_HTTP_PORT: u16 = 8080;
const ANY_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Which MCP transports the binary serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// MCP over stdin/stdout for a local client.
    Stdio,
    /// MCP over streamable HTTP, plus `/terminal` and `/health`.
    Http,
    /// Stdio and HTTP together.
    #[default]
    Both,
}

impl TransportMode {
    /// Case-insensitive. Unknown values fall back to [`TransportMode::Both`].
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Self::Stdio,
            "http" | "remote" => Self::Http,
            _ => Self::Both,
        }
    }

    pub fn stdio_enabled(&self) -> bool {
        *self != Self::Http
    }

    pub fn http_enabled(&self) -> bool {
        *self != Self::Stdio
    }
}

/// Settings of the `cronium-mcp` binary.
#[derive(Debug, Clone)]
pub struct CroniumConfig {
    /// Pool and executor settings handed to the engine.
    pub engine: EngineConfig,

    pub transport_mode: TransportMode,

    /// Listen address of the HTTP transport.
    pub http_addr: SocketAddr,

    /// Terminal width used when an open request names none.
    pub default_cols: u32,

    /// Terminal height used when an open request names none.
    pub default_rows: u32,
}

/// Rejected service configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("default terminal size must be non-zero (got {cols}x{rows})")]
    InvalidTerminalSize { cols: u32, rows: u32 },
}

impl Default for CroniumConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            transport_mode: TransportMode::default(),
            http_addr: SocketAddr::new(ANY_ADDR, DEFAULT_HTTP_PORT),
            default_cols: 80,
            default_rows: 24,
        }
    }
}

fn env_or<T: FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

impl CroniumConfig {
    /// Read the configuration from the environment.
    ///
    /// Engine settings come from [`EngineConfig::from_env`]. In addition:
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CRONIUM_TRANSPORT` | `both` (stdio, http, both) |
    /// | `CRONIUM_HTTP_HOST` | `0.0.0.0` |
    /// | `CRONIUM_HTTP_PORT` | `8080` |
    /// | `CRONIUM_TERMINAL_COLS` | `80` |
    /// | `CRONIUM_TERMINAL_ROWS` | `24` |
    ///
    /// Unparseable values fall back to their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let transport_mode = std::env::var("CRONIUM_TRANSPORT")
            .map(|v| TransportMode::parse(&v))
            .unwrap_or(defaults.transport_mode);

        Self {
            engine: EngineConfig::from_env(),
            transport_mode,
            http_addr: SocketAddr::new(
                env_or("CRONIUM_HTTP_HOST", ANY_ADDR),
                env_or("CRONIUM_HTTP_PORT", DEFAULT_HTTP_PORT),
            ),
            default_cols: env_or("CRONIUM_TERMINAL_COLS", defaults.default_cols),
            default_rows: env_or("CRONIUM_TERMINAL_ROWS", defaults.default_rows),
        }
    }

    /// Check engine settings and the default terminal size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.default_cols == 0 || self.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.default_cols,
                rows: self.default_rows,
            });
        }
        Ok(())
    }
}
