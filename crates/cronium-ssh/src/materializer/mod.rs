//! Turns a user script into files and a command line for the remote host.
//!
//! Bash, Python and Node scripts get a small runtime module written next to
//! them (`cronium.sh`, `cronium.py`, `cronium.js`) that exposes the Cronium
//! helpers (`input`, `event`, `output`, `setCondition`, `getCondition`,
//! `getVariable`, `setVariable`) against the JSON files of the working
//! directory. The user's script body is kept verbatim below a short
//! import header.
//!
//! HTTP "scripts" are a JSON request descriptor translated into a single
//! `curl` command line; they need no runtime module.

mod bash;
mod http;
mod node;
mod python;

pub use http::HttpRequest;

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Permission bits for generated files.
pub const SCRIPT_MODE: u32 = 0o755;

/// Script language accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Bash,
    Python,
    Node,
    Http,
}

impl ScriptLanguage {
    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Python => "python",
            Self::Node => "node",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptLanguage {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bash" => Ok(Self::Bash),
            "python" => Ok(Self::Python),
            "node" => Ok(Self::Node),
            "http" => Ok(Self::Http),
            _ => Err(EngineError::UnsupportedLanguage(s.to_string())),
        }
    }
}

/// One file to place in the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    /// File name relative to the working directory.
    pub name: &'static str,
    /// File contents.
    pub contents: String,
}

/// Materialized script ready to be uploaded and run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedScript {
    /// Files to write, in order.
    pub files: Vec<ScriptFile>,
    /// Interpreter invocation, run from inside the working directory.
    pub command: String,
}

/// Wrap `script` for `language`.
///
/// # Errors
///
/// [`EngineError::InvalidHttpRequest`] for an unusable HTTP descriptor.
pub fn materialize(language: ScriptLanguage, script: &str) -> Result<WrappedScript> {
    match language {
        ScriptLanguage::Bash => Ok(bash::wrap(script)),
        ScriptLanguage::Python => Ok(python::wrap(script)),
        ScriptLanguage::Node => Ok(node::wrap(script)),
        ScriptLanguage::Http => http::wrap(script),
    }
}

/// Runtime module source for `language`, if it has one.
pub fn runtime_source(language: ScriptLanguage) -> Option<&'static str> {
    match language {
        ScriptLanguage::Bash => Some(bash::RUNTIME),
        ScriptLanguage::Python => Some(python::RUNTIME),
        ScriptLanguage::Node => Some(node::RUNTIME),
        ScriptLanguage::Http => None,
    }
}
