//! Configuration file model.
//!
//! The config file is a single JSON document:
//!
//! ```json
//! {
//!   "system": {
//!     "prompt": { "dialog": { "bot_name": "..." } },
//!     "hello": "你好呀"
//!   },
//!   "actions": [
//!     {
//!       "name": "turn-on-light",
//!       "patterns": ["^打开灯$"],
//!       "cmd": { "function": "light.on", "param": "{}" },
//!       "replysp": ["好"],
//!       "replysn": ["失败"]
//!     }
//!   ]
//! }
//! ```
//!
//! `system.prompt` is opaque to the client: it is re-serialized verbatim as
//! the session-start payload for the remote dialog service.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub system: SystemConfig,
    #[serde(default)]
    pub actions: Vec<IntentConfig>,
}

/// Dialog-service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Arbitrary dialog-service config blob (voice, role, speaking style).
    pub prompt: serde_json::Value,
    /// Opening line spoken when the session starts.
    pub hello: String,
}

/// One locally-handled intent.
#[derive(Debug, Clone, Deserialize)]
pub struct IntentConfig {
    pub name: String,
    pub patterns: Vec<String>,
    pub cmd: CmdConfig,
    #[serde(default)]
    pub replysp: Vec<String>,
    #[serde(default)]
    pub replysn: Vec<String>,
}

/// Command-bus call bound to an intent.
#[derive(Debug, Clone, Deserialize)]
pub struct CmdConfig {
    pub function: String,
    pub param: String,
}

impl AppConfig {
    /// Loads and parses the configuration file. Any malformed input is
    /// fatal: the caller is expected to refuse to run.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// The prompt blob serialized for the session-start payload.
    pub fn prompt_json(&self) -> String {
        self.system.prompt.to_string()
    }
}
