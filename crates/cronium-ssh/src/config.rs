//! Engine configuration types.

use crate::error::EngineError;
use std::time::Duration;

/// Slack between the longest run and the stale working directory age, for
/// staging before the deadline starts and result read-back after it.
pub(crate) const WORKDIR_SWEEP_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bound on TCP connect + handshake + auth for a new session.
    /// Default: 20 seconds
    pub connect_timeout: Duration,

    /// Bound on the liveness probe run against a cached session.
    /// Default: 5 seconds
    pub probe_timeout: Duration,

    /// Idle time after which a batch-execution connection is reaped.
    ///
    /// Generous enough not to kill sessions between the steps of a long
    /// script. Default: 10 minutes
    pub idle_timeout: Duration,

    /// Idle time after which a connection used by a terminal is reaped.
    /// Default: 60 minutes
    pub terminal_idle_timeout: Duration,

    /// Interval between reaper sweeps.
    /// Default: 60 seconds
    pub reap_interval: Duration,

    /// Soft cap on pooled connections. Reaching it triggers a sweep before
    /// the next dial. Default: 50
    pub max_connections: usize,

    /// Consecutive dial failures that open a key's circuit. Default: 5
    pub breaker_failure_threshold: u32,

    /// Successful trial dials needed to close a half-open circuit. Default: 2
    pub breaker_success_threshold: u32,

    /// How long an open circuit refuses dials. Default: 60 seconds
    pub breaker_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            probe_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10 * 60),
            terminal_idle_timeout: Duration::from_secs(60 * 60),
            reap_interval: Duration::from_secs(60),
            max_connections: 50,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

/// Configuration for script execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Remote directory that holds per-run working directories.
    pub workdir_root: String,
    /// Name prefix of per-run working directories.
    pub workdir_prefix: String,
    /// Age after which leftover working directories are swept.
    ///
    /// Run deadlines are capped below this, so a live run's directory is
    /// never swept.
    pub stale_workdir_age: Duration,
    /// Interpreter assumed when the remote default shell can't be read.
    pub default_shell: String,
    /// Deadline applied when a request carries none.
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workdir_root: "/tmp".into(),
            workdir_prefix: "cronium".into(),
            stale_workdir_age: Duration::from_secs(60 * 60),
            default_shell: "/bin/bash".into(),
            default_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ExecutorConfig {
    /// Longest deadline a single run may have.
    pub fn max_run_timeout(&self) -> Duration {
        self.stale_workdir_age.saturating_sub(WORKDIR_SWEEP_MARGIN)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Script execution settings.
    pub executor: ExecutorConfig,
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl EngineConfig {
    /// Create a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CRONIUM_SSH_CONNECT_TIMEOUT_SECS` | `20` |
    /// | `CRONIUM_SSH_PROBE_TIMEOUT_SECS` | `5` |
    /// | `CRONIUM_SSH_IDLE_TIMEOUT_SECS` | `600` |
    /// | `CRONIUM_SSH_TERMINAL_IDLE_TIMEOUT_SECS` | `3600` |
    /// | `CRONIUM_SSH_REAP_INTERVAL_SECS` | `60` |
    /// | `CRONIUM_SSH_MAX_CONNECTIONS` | `50` |
    /// | `CRONIUM_WORKDIR_ROOT` | `/tmp` |
    /// | `CRONIUM_WORKDIR_PREFIX` | `cronium` |
    /// | `CRONIUM_STALE_WORKDIR_SECS` | `3600` |
    /// | `CRONIUM_DEFAULT_SHELL` | `/bin/bash` |
    /// | `CRONIUM_DEFAULT_TIMEOUT_SECS` | `1800` |
    pub fn from_env() -> Self {
        let pool = PoolConfig::default();
        let executor = ExecutorConfig::default();

        Self {
            pool: PoolConfig {
                connect_timeout: env_secs("CRONIUM_SSH_CONNECT_TIMEOUT_SECS")
                    .unwrap_or(pool.connect_timeout),
                probe_timeout: env_secs("CRONIUM_SSH_PROBE_TIMEOUT_SECS")
                    .unwrap_or(pool.probe_timeout),
                idle_timeout: env_secs("CRONIUM_SSH_IDLE_TIMEOUT_SECS")
                    .unwrap_or(pool.idle_timeout),
                terminal_idle_timeout: env_secs("CRONIUM_SSH_TERMINAL_IDLE_TIMEOUT_SECS")
                    .unwrap_or(pool.terminal_idle_timeout),
                reap_interval: env_secs("CRONIUM_SSH_REAP_INTERVAL_SECS")
                    .unwrap_or(pool.reap_interval),
                max_connections: env_parse("CRONIUM_SSH_MAX_CONNECTIONS")
                    .unwrap_or(pool.max_connections),
                ..pool
            },
            executor: ExecutorConfig {
                workdir_root: std::env::var("CRONIUM_WORKDIR_ROOT")
                    .unwrap_or(executor.workdir_root),
                workdir_prefix: std::env::var("CRONIUM_WORKDIR_PREFIX")
                    .unwrap_or(executor.workdir_prefix),
                stale_workdir_age: env_secs("CRONIUM_STALE_WORKDIR_SECS")
                    .unwrap_or(executor.stale_workdir_age),
                default_shell: std::env::var("CRONIUM_DEFAULT_SHELL")
                    .unwrap_or(executor.default_shell),
                default_timeout: env_secs("CRONIUM_DEFAULT_TIMEOUT_SECS")
                    .unwrap_or(executor.default_timeout),
            },
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.into()));

        if self.pool.reap_interval.is_zero() {
            return invalid("reap_interval must be > 0");
        }
        if self.pool.connect_timeout.is_zero() {
            return invalid("connect_timeout must be > 0");
        }
        if self.pool.terminal_idle_timeout < self.pool.idle_timeout {
            return invalid("terminal_idle_timeout must be >= idle_timeout");
        }
        if !self.executor.workdir_root.starts_with('/') {
            return invalid("workdir_root must be an absolute path");
        }
        if self.executor.workdir_prefix.is_empty()
            || !self
                .executor
                .workdir_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return invalid("workdir_prefix must be non-empty [A-Za-z0-9_-]");
        }
        if self.executor.default_timeout.is_zero() {
            return invalid("default_timeout must be > 0");
        }
        if self.executor.default_timeout > self.executor.max_run_timeout() {
            return invalid("stale_workdir_age must exceed default_timeout by at least 5 minutes");
        }
        Ok(())
    }
}

/// Builder for EngineConfig.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set the dial timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.connect_timeout = timeout;
        self
    }

    /// Set the liveness probe timeout.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.probe_timeout = timeout;
        self
    }

    /// Set the batch idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.idle_timeout = timeout;
        self
    }

    /// Set the terminal idle timeout.
    pub fn terminal_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.terminal_idle_timeout = timeout;
        self
    }

    /// Set the reaper interval.
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.pool.reap_interval = interval;
        self
    }

    /// Set the soft connection cap.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.pool.max_connections = max;
        self
    }

    /// Set the remote working directory root.
    pub fn workdir_root(mut self, root: impl Into<String>) -> Self {
        self.config.executor.workdir_root = root.into();
        self
    }

    /// Set the working directory name prefix.
    pub fn workdir_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.executor.workdir_prefix = prefix.into();
        self
    }

    /// Set the age after which leftover working directories are swept.
    pub fn stale_workdir_age(mut self, age: Duration) -> Self {
        self.config.executor.stale_workdir_age = age;
        self
    }

    /// Set the fallback interpreter.
    pub fn default_shell(mut self, shell: impl Into<String>) -> Self {
        self.config.executor.default_shell = shell.into();
        self
    }

    /// Set the deadline used when a request has none.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.executor.default_timeout = timeout;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
