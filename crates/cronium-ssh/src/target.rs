//! Remote host identity and credentials.

use serde::{Deserialize, Serialize};
use std::fmt;

fn default_port() -> u16 {
    22
}

/// Credentials offered during authentication.
///
/// When both are present the private key is tried first, then the password.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// PEM/OpenSSH encoded private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Passphrase for an encrypted private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Password for keyboard/password authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credentials {
    /// Key-based credentials.
    pub fn private_key(pem: impl Into<String>) -> Self {
        Self {
            private_key: Some(pem.into()),
            ..Self::default()
        }
    }

    /// Password credentials.
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    /// Whether any authentication method is available.
    pub fn is_empty(&self) -> bool {
        self.private_key.is_none() && self.password.is_none()
    }
}

// Secrets never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A remote host/user/port triple plus the credentials to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTarget {
    /// Hostname or IP address.
    pub host: String,
    /// SSH port (default: 22).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Authentication material.
    #[serde(default, flatten)]
    pub credentials: Credentials,
    /// Expected SHA-256 host key fingerprint (`SHA256:...`). Unset accepts any key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

impl ConnectionTarget {
    /// Create a target on port 22.
    pub fn new(host: impl Into<String>, username: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            credentials,
            host_key_fingerprint: None,
        }
    }

    /// Override the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Pin the server's host key.
    pub fn with_host_key_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_key_fingerprint = Some(fingerprint.into());
        self
    }

    /// Pool key: `user@host:port`.
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}
