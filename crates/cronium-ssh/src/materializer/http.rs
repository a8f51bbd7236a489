//! HTTP request descriptors rendered as `curl` invocations.

use super::WrappedScript;
use crate::error::{EngineError, Result};
use crate::escape::quote;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

fn default_method() -> String {
    "GET".into()
}

/// `{method?, url, headers?, body?}` as sent in the script field.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpRequest {
    /// HTTP method (default: `GET`).
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute request URL.
    pub url: String,
    /// Header values; non-string values are rendered as JSON.
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    /// Request body; a non-string body is sent as JSON.
    #[serde(default)]
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Parse and validate a descriptor.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(descriptor)
            .map_err(|e| EngineError::InvalidHttpRequest(e.to_string()))?;

        if request.url.trim().is_empty() {
            return Err(EngineError::InvalidHttpRequest("url is empty".into()));
        }
        if request.method.is_empty() || !request.method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(EngineError::InvalidHttpRequest(format!(
                "invalid method: {:?}",
                request.method
            )));
        }
        if let Some(name) = request
            .headers
            .keys()
            .find(|name| name.is_empty() || name.contains([':', '\r', '\n']))
        {
            return Err(EngineError::InvalidHttpRequest(format!(
                "invalid header name: {name:?}"
            )));
        }
        Ok(request)
    }

    /// Render as a single curl command line.
    pub fn to_curl(&self) -> String {
        let mut args = vec![
            "curl".to_string(),
            "-sS".into(),
            "-X".into(),
            quote(&self.method.to_ascii_uppercase()),
        ];

        for (name, value) in &self.headers {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            args.push("-H".into());
            args.push(quote(&format!("{name}: {value}")));
        }

        match &self.body {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) => {
                args.push("--data-raw".into());
                args.push(quote(body));
            }
            Some(body) => {
                args.push("--data-raw".into());
                args.push(quote(&body.to_string()));
            }
        }

        args.push(quote(&self.url));
        args.join(" ")
    }
}

pub(super) fn wrap(descriptor: &str) -> Result<WrappedScript> {
    let request = HttpRequest::parse(descriptor)?;
    Ok(WrappedScript {
        files: Vec::new(),
        command: request.to_curl(),
    })
}
