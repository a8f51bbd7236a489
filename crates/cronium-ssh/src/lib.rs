//! # cronium-ssh
//!
//! Remote script execution engine for Cronium.
//!
//! Runs user scripts (bash, Python, Node or an HTTP request) on remote hosts
//! over pooled SSH connections and brings back their output, condition flag
//! and variable changes. Also opens interactive PTY shells for terminal
//! users.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     cronium-ssh (host)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ ScriptExecutor  │────▶│  ShellResolver           │    │
//! │  │   - run()       │     │  materializer            │    │
//! │  └─────────────────┘     │  VariableStore           │    │
//! │           │              └──────────────────────────┘    │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ ConnectionPool  │────▶│  HashMap<user@host:port, │    │
//! │  │  - acquire()    │     │      PooledConnection>   │    │
//! │  │  - release()    │     └──────────────────────────┘    │
//! │  └─────────────────┘                 │ russh             │
//! │           ▲                          ▼                   │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ TerminalManager │     │  RemoteSession           │    │
//! │  │ - open_shell()  │     │  (exec / upload / shell) │    │
//! │  │ - prewarm()     │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use cronium_ssh::{
//!     ConnectionPool, ConnectionTarget, Credentials, EngineConfig, ExecutionRequest,
//!     ExecutionTarget, ScriptExecutor, ScriptLanguage, SshConnector,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> cronium_ssh::Result<()> {
//! let config = EngineConfig::from_env();
//! config.validate()?;
//!
//! let pool = Arc::new(ConnectionPool::new(config.pool.clone(), Arc::new(SshConnector::new())));
//! pool.start();
//! let executor = ScriptExecutor::new(Arc::clone(&pool), config.executor.clone());
//!
//! let target = ConnectionTarget::new("10.0.0.5", "deploy", Credentials::password("secret"));
//! let request = ExecutionRequest::new(ScriptLanguage::Python, "output({'n': input()['n'] * 2})")
//!     .with_target(ExecutionTarget::Pooled(target))
//!     .with_input(serde_json::json!({"n": 21}));
//!
//! let result = executor.run(request).await;
//! println!("{:?}", result.script_output); // Some({"n": 42})
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Connection Pooling**: One multiplexed session per `user@host:port`, probed before reuse
//! - **Single-flight Dials**: Concurrent callers share one connection attempt
//! - **Circuit Breaking**: Hosts that keep failing are refused for a cool-down
//! - **Script Runtimes**: `input`/`output`/`setCondition`/`setVariable` helpers in every language
//! - **Hard Deadlines**: Runs are bounded and their working directories always cleaned up
//! - **Interactive Shells**: PTY terminals kept alive by the pool

mod breaker;
mod config;
mod error;
mod escape;
mod executor;
mod interactive;
pub mod materializer;
mod pool;
mod shell;
mod target;
pub mod transport;
mod variables;
pub mod workdir;

pub use breaker::BreakerState;
pub use config::{EngineConfig, EngineConfigBuilder, ExecutorConfig, PoolConfig};
pub use error::{EngineError, Result};
pub use escape::quote;
pub use executor::{ExecutionRequest, ExecutionResult, ExecutionTarget, ScriptExecutor};
pub use interactive::TerminalManager;
pub use materializer::{ScriptLanguage, WrappedScript};
pub use pool::{ConnectionPool, PoolStats, PoolStatsSnapshot, PooledConnection};
pub use shell::ShellResolver;
pub use target::{ConnectionTarget, Credentials};
pub use transport::ssh::SshConnector;
pub use transport::{
    CloseNotifier, CommandOutput, Connector, ExecOptions, PtySize, RemoteSession, ShellEvent,
    ShellInput, ShellSession, ShellWriter,
};
pub use variables::{
    diff_variables, MemoryVariableStore, Variable, VariableDiff, VariableSet, VariableStore,
};
