//! Pooled SSH connections, one per `user@host:port`.
//!
//! The pool hands out shared [`PooledConnection`]s. A cached connection is
//! probed before reuse and silently replaced when the probe fails. Concurrent
//! callers for a key that is still being dialed await the same attempt
//! instead of opening duplicate sessions.
//!
//! # Architecture
//!
//! Each dial runs in its own spawned task. Its completion is a
//! [`Shared`] future stored in the pending map, so every waiter observes the
//! same outcome and a cancelled caller never strands the others. A
//! background reaper removes idle connections and reacts to transport close
//! events between sweeps.
//!
//! # Example
//!
//! ```ignore
//! use cronium_ssh::{ConnectionPool, ConnectionTarget, Credentials, PoolConfig, SshConnector};
//!
//! let pool = ConnectionPool::new(PoolConfig::default(), Arc::new(SshConnector::new()));
//! pool.start();
//!
//! let target = ConnectionTarget::new("10.0.0.5", "deploy", Credentials::password("pw"));
//! let conn = pool.acquire(&target, false).await?;
//! conn.session().exec("uptime", ExecOptions::default()).await?;
//! pool.release(&conn).await;
//!
//! pool.shutdown().await;
//! ```

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::PoolConfig;
use crate::error::{EngineError, Result};
use crate::target::ConnectionTarget;
use crate::transport::{CloseNotifier, Connector, ExecOptions, RemoteSession, SessionClosed};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Command run on a cached session to prove it still answers.
const PROBE_COMMAND: &str = "echo cronium-ping";

/// Ids handed to unpooled sessions. Pooled ids start at 1 and never match.
const UNPOOLED_ID: u64 = 0;

// ============================================================================
// Statistics
// ============================================================================

/// Pool statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Cached connections handed out after a successful probe.
    pub reuses: AtomicU64,
    /// Callers that joined a dial already in flight.
    pub joins: AtomicU64,
    /// Dial attempts started.
    pub dials: AtomicU64,
    /// Dial attempts that failed (including circuit-open refusals).
    pub dial_failures: AtomicU64,
    /// Cached connections discarded because the probe failed.
    pub probe_failures: AtomicU64,
    /// Connections removed by the reaper or by close events.
    pub evictions: AtomicU64,
}

impl PoolStats {
    /// Get the number of reuses.
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of callers that joined an in-flight dial.
    pub fn joins(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }

    /// Get the number of dials started.
    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Get the number of failed dials.
    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    /// Get the number of failed liveness probes.
    pub fn probe_failures(&self) -> u64 {
        self.probe_failures.load(Ordering::Relaxed)
    }

    /// Get the number of evicted connections.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Calculate the reuse rate as a percentage of all acquisitions.
    pub fn reuse_rate(&self) -> f64 {
        let reuses = self.reuses() as f64;
        let total = reuses + self.joins() as f64 + self.dials() as f64;
        if total == 0.0 {
            0.0
        } else {
            (reuses / total) * 100.0
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            reuses: self.reuses(),
            joins: self.joins(),
            dials: self.dials(),
            dial_failures: self.dial_failures(),
            probe_failures: self.probe_failures(),
            evictions: self.evictions(),
        }
    }
}

/// Serializable copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatsSnapshot {
    pub reuses: u64,
    pub joins: u64,
    pub dials: u64,
    pub dial_failures: u64,
    pub probe_failures: u64,
    pub evictions: u64,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// One live session owned by the pool.
///
/// Shared between concurrent executions on the same key; every command runs
/// on its own channel.
pub struct PooledConnection {
    key: String,
    id: u64,
    session: Arc<dyn RemoteSession>,
    connected: AtomicBool,
    interactive: AtomicBool,
    retired: AtomicBool,
    leases: AtomicUsize,
    last_used: StdMutex<Instant>,
    created_at: DateTime<Utc>,
}

impl PooledConnection {
    fn new(key: String, id: u64, session: Arc<dyn RemoteSession>) -> Self {
        Self {
            key,
            id,
            session,
            connected: AtomicBool::new(true),
            interactive: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            leases: AtomicUsize::new(0),
            last_used: StdMutex::new(Instant::now()),
            created_at: Utc::now(),
        }
    }

    /// Pool key (`user@host:port`).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    /// Whether the connection is still believed usable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.session.is_closed()
    }

    /// When the connection was established.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last time the connection was handed out, released or touched.
    pub fn last_used(&self) -> Instant {
        match self.last_used.lock() {
            Ok(at) => *at,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Time since [`last_used`](Self::last_used).
    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    /// Whether a terminal has used this connection.
    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::Relaxed)
    }

    /// Select the longer terminal idle timeout for this connection.
    pub fn mark_interactive(&self) {
        self.interactive.store(true, Ordering::Relaxed);
    }

    /// Number of acquisitions not yet released.
    ///
    /// The reaper never closes a connection while this is above zero.
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Refresh [`last_used`](Self::last_used) without returning a lease.
    pub fn touch(&self) {
        match self.last_used.lock() {
            Ok(mut at) => *at = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    fn lease(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    /// Drop one lease. Returns the number still held.
    fn unlease(&self) -> usize {
        let previous = self
            .leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn idle_limit(&self, config: &PoolConfig) -> Duration {
        if self.is_interactive() {
            config.terminal_idle_timeout
        } else {
            config.idle_timeout
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("interactive", &self.is_interactive())
            .field("leases", &self.active_leases())
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ============================================================================
// Pool Implementation
// ============================================================================

type DialOutcome = std::result::Result<Arc<PooledConnection>, Arc<EngineError>>;
type PendingDial = Shared<BoxFuture<'static, DialOutcome>>;

/// State shared with dial tasks and the reaper.
struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<String, Arc<PooledConnection>>>,
    pending: Mutex<HashMap<String, PendingDial>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    /// Replaced connections still leased by running executions.
    retired: Mutex<Vec<Arc<PooledConnection>>>,
    stats: PoolStats,
    next_id: AtomicU64,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
}

/// Keyed pool of SSH connections.
///
/// Cheap to share behind an [`Arc`]; every method takes `&self`.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    /// Close events from sessions; moved into the reaper on start.
    closed_rx: StdMutex<Option<mpsc::UnboundedReceiver<SessionClosed>>>,
    /// Shutdown signal for the reaper task.
    shutdown: Arc<AtomicBool>,
    /// Notification to wake up the reaper on shutdown.
    shutdown_notify: Arc<Notify>,
    /// Handle to the background reaper task.
    reaper_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a new connection pool.
    ///
    /// The reaper is not started. Call [`start()`](Self::start) to begin
    /// evicting idle connections.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        tracing::info!(
            max_connections = config.max_connections,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            terminal_idle_timeout_secs = config.terminal_idle_timeout.as_secs(),
            "Creating connection pool"
        );

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                connections: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                breakers: Mutex::new(HashMap::new()),
                retired: Mutex::new(Vec::new()),
                stats: PoolStats::default(),
                next_id: AtomicU64::new(1),
                closed_tx,
            }),
            closed_rx: StdMutex::new(Some(closed_rx)),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            reaper_handle: StdMutex::new(None),
        }
    }

    /// Start the background reaper task.
    pub fn start(&self) {
        let receiver = match self.closed_rx.lock() {
            Ok(mut rx) => rx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(closed_rx) = receiver else {
            tracing::warn!("Pool reaper already started");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let shutdown = Arc::clone(&self.shutdown);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let handle = tokio::spawn(async move {
            Self::reaper_loop(inner, closed_rx, shutdown, shutdown_notify).await;
        });

        if let Ok(mut slot) = self.reaper_handle.lock() {
            *slot = Some(handle);
        }
        tracing::info!(
            reap_interval_secs = self.inner.config.reap_interval.as_secs(),
            "Pool reaper started"
        );
    }

    /// Background reaper loop.
    ///
    /// Sweeps on every interval tick and evicts connections as soon as their
    /// transport reports a close.
    async fn reaper_loop(
        inner: Arc<PoolInner>,
        mut closed_rx: mpsc::UnboundedReceiver<SessionClosed>,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) {
        tracing::debug!("Reaper loop started");

        let mut ticker = tokio::time::interval(inner.config.reap_interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_notify.notified() => {
                    tracing::info!("Pool reaper received shutdown signal");
                    break;
                }

                Some(event) = closed_rx.recv() => {
                    inner.handle_closed(event).await;
                }

                _ = ticker.tick() => {
                    if shutdown.load(Ordering::Relaxed) {
                        tracing::debug!("Reaper detected shutdown flag");
                        break;
                    }
                    let reaped = inner.reap_idle().await;
                    if reaped > 0 {
                        tracing::debug!(reaped, "Reaper sweep evicted connections");
                    }
                }
            }
        }

        tracing::debug!("Reaper loop exited");
    }

    /// Get a live connection for `target`.
    ///
    /// Joins an in-flight dial for the same key if there is one. Otherwise a
    /// cached connection is probed and returned, or replaced if the probe
    /// fails. `force_new` skips the cache and always dials.
    ///
    /// # Errors
    ///
    /// [`EngineError::Unreachable`], [`EngineError::CircuitOpen`] or
    /// [`EngineError::Auth`] when no session could be established. Failed
    /// dials are never retried here.
    ///
    /// Every successful call holds a lease until [`release`](Self::release).
    pub async fn acquire(
        &self,
        target: &ConnectionTarget,
        force_new: bool,
    ) -> Result<Arc<PooledConnection>> {
        let conn = self.checkout(target, force_new).await?;
        conn.lease();
        Ok(conn)
    }

    async fn checkout(
        &self,
        target: &ConnectionTarget,
        force_new: bool,
    ) -> Result<Arc<PooledConnection>> {
        let key = target.key();

        let in_flight = self.inner.pending.lock().await.get(&key).cloned();
        if let Some(dial) = in_flight {
            self.inner.stats.joins.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "Joining in-flight connection attempt");
            return dial.await.map_err(|e| unshare(&e));
        }

        if !force_new {
            let cached = self.inner.connections.lock().await.get(&key).cloned();
            if let Some(conn) = cached {
                if conn.is_connected() && self.inner.probe(&conn).await {
                    self.inner.stats.reuses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, "Reusing pooled connection");
                    return Ok(conn);
                }

                self.inner.stats.probe_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Discarding dead pooled connection");
                self.inner.evict(&conn).await;
            }
        }

        self.establish(target, key).await
    }

    /// Start a dial for `key`, or join one that raced ahead of us.
    async fn establish(
        &self,
        target: &ConnectionTarget,
        key: String,
    ) -> Result<Arc<PooledConnection>> {
        let at_capacity =
            self.inner.connections.lock().await.len() >= self.inner.config.max_connections;
        if at_capacity {
            tracing::info!(
                max_connections = self.inner.config.max_connections,
                "Pool at capacity, reaping before dial"
            );
            self.inner.reap_idle().await;
        }

        let dial = {
            let mut pending = self.inner.pending.lock().await;
            match pending.get(&key) {
                Some(existing) => {
                    self.inner.stats.joins.fetch_add(1, Ordering::Relaxed);
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let task_target = target.clone();
                    let task_key = key.clone();
                    let task = tokio::spawn(async move { inner.dial(task_target, task_key).await });

                    let join_key = key.clone();
                    let dial: PendingDial = async move {
                        match task.await {
                            Ok(outcome) => outcome,
                            Err(e) => Err(Arc::new(EngineError::Unreachable {
                                key: join_key,
                                reason: format!("connection task failed: {e}"),
                            })),
                        }
                    }
                    .boxed()
                    .shared();

                    pending.insert(key.clone(), dial.clone());
                    dial
                }
            }
        };

        dial.await.map_err(|e| unshare(&e))
    }

    /// Dial a session that the pool does not track.
    ///
    /// The caller owns it and must [`close`](RemoteSession::close) it.
    pub async fn connect_unpooled(&self, target: &ConnectionTarget) -> Result<Arc<dyn RemoteSession>> {
        let key = target.key();
        let notifier = CloseNotifier::new(key.clone(), UNPOOLED_ID, self.inner.closed_tx.clone());
        tracing::debug!(key = %key, "Dialing unpooled session");
        self.inner.connect_bounded(target, &key, notifier).await
    }

    /// Return the lease taken by [`acquire`](Self::acquire).
    ///
    /// A connection replaced while leased is closed when its last lease
    /// comes back.
    pub async fn release(&self, conn: &Arc<PooledConnection>) {
        conn.touch();
        let remaining = conn.unlease();
        tracing::trace!(key = %conn.key(), remaining, "Connection released");
        if remaining == 0 && conn.retired.load(Ordering::Acquire) {
            self.inner.close_retired(conn).await;
        }
    }

    /// Run one reaper sweep now. Returns the number of evicted connections.
    pub async fn reap_idle(&self) -> usize {
        self.inner.reap_idle().await
    }

    /// Check whether a connection for `key` is cached.
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.connections.lock().await.contains_key(key)
    }

    /// Get the current number of pooled connections.
    pub async fn size(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Keys of every pooled connection.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.connections.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Circuit breaker state for `key`, if it has ever been dialed.
    pub async fn breaker_state(&self, key: &str) -> Option<BreakerState> {
        self.inner.breakers.lock().await.get(key).map(|b| b.state())
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the pool statistics.
    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    /// Check if the reaper task is running.
    pub fn is_running(&self) -> bool {
        let started = self
            .reaper_handle
            .lock()
            .map(|h| h.is_some())
            .unwrap_or(false);
        started && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Gracefully shut down the pool.
    ///
    /// Stops the reaper, then closes every pooled connection. Close failures
    /// are logged and never stop the shutdown.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down connection pool");

        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();

        let handle = match self.reaper_handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            tracing::debug!("Waiting for reaper task to complete");
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Reaper task panicked during shutdown");
            }
        }

        let connections: Vec<Arc<PooledConnection>> = {
            let mut map = self.inner.connections.lock().await;
            map.drain().map(|(_, conn)| conn).collect()
        };

        let retired: Vec<Arc<PooledConnection>> =
            self.inner.retired.lock().await.drain(..).collect();

        let count = connections.len() + retired.len();
        tracing::info!(count, "Closing pooled connections");
        for conn in connections.into_iter().chain(retired) {
            conn.mark_disconnected();
            conn.session.close().await;
        }

        let stats = &self.inner.stats;
        tracing::info!(
            closed = count,
            reuses = stats.reuses(),
            dials = stats.dials(),
            dial_failures = stats.dial_failures(),
            reuse_rate = format!("{:.1}%", stats.reuse_rate()),
            "Pool shutdown complete"
        );
    }
}

impl PoolInner {
    /// Body of a spawned dial task.
    ///
    /// Registers the connection before clearing the pending entry so other
    /// callers always see one or the other.
    async fn dial(self: Arc<Self>, target: ConnectionTarget, key: String) -> DialOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outcome = match self.dial_once(&target, &key, id).await {
            Ok(session) => {
                let conn = Arc::new(PooledConnection::new(key.clone(), id, session));
                let replaced = self
                    .connections
                    .lock()
                    .await
                    .insert(key.clone(), Arc::clone(&conn));
                if let Some(old) = replaced {
                    tracing::debug!(key = %key, "Replaced pooled connection");
                    self.retire(old).await;
                }
                Ok(conn)
            }
            Err(e) => Err(Arc::new(e)),
        };
        self.pending.lock().await.remove(&key);
        outcome
    }

    async fn dial_once(
        &self,
        target: &ConnectionTarget,
        key: &str,
        id: u64,
    ) -> Result<Arc<dyn RemoteSession>> {
        {
            let mut breakers = self.breakers.lock().await;
            let breaker = breakers.entry(key.to_string()).or_insert_with(|| {
                CircuitBreaker::new(
                    self.config.breaker_failure_threshold,
                    self.config.breaker_success_threshold,
                    self.config.breaker_cooldown,
                )
            });
            if !breaker.allow() {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Circuit open, refusing dial");
                return Err(EngineError::CircuitOpen(key.to_string()));
            }
        }

        let notifier = CloseNotifier::new(key, id, self.closed_tx.clone());
        let result = self.connect_bounded(target, key, notifier).await;

        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(key) {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }
        if result.is_err() {
            self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Dial with the connect timeout, folding failures into `Unreachable`.
    async fn connect_bounded(
        &self,
        target: &ConnectionTarget,
        key: &str,
        notifier: CloseNotifier,
    ) -> Result<Arc<dyn RemoteSession>> {
        self.stats.dials.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let timeout = self.config.connect_timeout;

        let result = match tokio::time::timeout(timeout, self.connector.connect(target, notifier)).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e @ (EngineError::Auth { .. } | EngineError::Unreachable { .. }))) => Err(e),
            Ok(Err(e)) => Err(EngineError::Unreachable {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(EngineError::Unreachable {
                key: key.to_string(),
                reason: format!("connection timed out after {}ms", timeout.as_millis()),
            }),
        };

        match &result {
            Ok(_) => tracing::info!(
                key = %key,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Connection established"
            ),
            Err(e) => tracing::warn!(
                key = %key,
                elapsed_ms = start.elapsed().as_millis() as u64,
                error = %e,
                "Connection failed"
            ),
        }
        result
    }

    /// Liveness round-trip on a cached session.
    async fn probe(&self, conn: &PooledConnection) -> bool {
        let probe = conn.session.exec(PROBE_COMMAND, ExecOptions::default());
        match tokio::time::timeout(self.config.probe_timeout, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(key = %conn.key, error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(key = %conn.key, "Liveness probe timed out");
                false
            }
        }
    }

    /// Remove `conn` if it is still the registered entry, then close it.
    async fn evict(&self, conn: &Arc<PooledConnection>) {
        {
            let mut map = self.connections.lock().await;
            if map.get(&conn.key).is_some_and(|c| Arc::ptr_eq(c, conn)) {
                map.remove(&conn.key);
            }
        }
        conn.mark_disconnected();
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        conn.session.close().await;
    }

    /// Close a connection that left the map, or park it until its last
    /// lease is released.
    async fn retire(&self, conn: Arc<PooledConnection>) {
        conn.mark_disconnected();
        conn.retired.store(true, Ordering::Release);
        {
            // Checked under the lock `close_retired` takes, so a concurrent
            // last release either sees the parked entry or leaves it to us.
            let mut retired = self.retired.lock().await;
            if conn.active_leases() > 0 {
                tracing::debug!(
                    key = %conn.key,
                    leases = conn.active_leases(),
                    "Replaced connection still in use, closing after release"
                );
                retired.push(conn);
                return;
            }
        }
        conn.session.close().await;
    }

    async fn close_retired(&self, conn: &Arc<PooledConnection>) {
        let parked = {
            let mut retired = self.retired.lock().await;
            let before = retired.len();
            retired.retain(|c| !Arc::ptr_eq(c, conn));
            retired.len() != before
        };
        if parked {
            tracing::debug!(key = %conn.key, "Closing replaced connection");
            conn.session.close().await;
        }
    }

    async fn reap_idle(&self) -> usize {
        let stale: Vec<Arc<PooledConnection>> = {
            let mut map = self.connections.lock().await;
            let keys: Vec<String> = map
                .iter()
                .filter(|(_, conn)| {
                    !conn.is_connected()
                        || (conn.active_leases() == 0
                            && conn.idle_for() > conn.idle_limit(&self.config))
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| map.remove(key)).collect()
        };

        for conn in &stale {
            tracing::info!(
                key = %conn.key,
                idle_secs = conn.idle_for().as_secs(),
                interactive = conn.is_interactive(),
                "Reaping connection"
            );
            conn.mark_disconnected();
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            conn.session.close().await;
        }
        stale.len()
    }

    async fn handle_closed(&self, event: SessionClosed) {
        let removed = {
            let mut map = self.connections.lock().await;
            match map.get(&event.key) {
                Some(conn) if conn.id == event.id => map.remove(&event.key),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            conn.mark_disconnected();
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::info!(key = %event.key, reason = %event.reason, "Evicted connection after transport close");
        }
    }
}

/// Rebuild an owned error from a dial outcome shared between waiters.
fn unshare(err: &EngineError) -> EngineError {
    match err {
        EngineError::Unreachable { key, reason } => EngineError::Unreachable {
            key: key.clone(),
            reason: reason.clone(),
        },
        EngineError::Auth { key, reason } => EngineError::Auth {
            key: key.clone(),
            reason: reason.clone(),
        },
        EngineError::CircuitOpen(key) => EngineError::CircuitOpen(key.clone()),
        EngineError::Timeout(d) => EngineError::Timeout(*d),
        other => EngineError::Ssh(other.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================
