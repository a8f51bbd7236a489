//! Per-host default shell discovery.

use crate::transport::{ExecOptions, RemoteSession};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Caches the login shell of each connection key.
///
/// A failed lookup caches the fallback too, so each key is asked at most
/// once for the life of the resolver.
#[derive(Debug)]
pub struct ShellResolver {
    fallback: String,
    cache: Mutex<HashMap<String, String>>,
}

impl ShellResolver {
    /// Create a resolver that falls back to `fallback`.
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            fallback: fallback.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Shell for `key`, asking `session` on a cache miss.
    pub async fn resolve(&self, key: &str, session: &dyn RemoteSession) -> String {
        if let Some(shell) = self.cache.lock().await.get(key) {
            return shell.clone();
        }

        let shell = match session.exec("echo $SHELL", ExecOptions::default()).await {
            Ok(output) => {
                let answer = output.stdout.trim();
                if answer.starts_with('/') && !answer.contains(char::is_whitespace) {
                    answer.to_string()
                } else {
                    tracing::debug!(key = %key, answer = %answer, "Unusable $SHELL, using fallback");
                    self.fallback.clone()
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Shell lookup failed, using fallback");
                self.fallback.clone()
            }
        };

        tracing::debug!(key = %key, shell = %shell, "Resolved default shell");
        self.cache
            .lock()
            .await
            .entry(key.to_string())
            .or_insert(shell)
            .clone()
    }

    /// Cached shell for `key`, if any.
    pub async fn cached(&self, key: &str) -> Option<String> {
        self.cache.lock().await.get(key).cloned()
    }
}
