//! Engine configuration
//!
//! Every field has a default, so an empty TOML document is valid.
//!
//! ```toml
//! dispatcher_thread_name = "idbind-dispatch"
//! supports_commit = true
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default name of the dispatcher thread
pub const DEFAULT_DISPATCHER_THREAD_NAME: &str = "idbind-dispatch";

/// Failure to load an [`EngineConfig`]
#[derive(Debug, Error)]
#[error("invalid engine config: {0}")]
pub struct ConfigError(#[from] toml::de::Error);

/// Reference engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name given to the thread that runs every engine task
    #[serde(default = "default_thread_name")]
    pub dispatcher_thread_name: String,
    /// Whether transactions offer explicit commit. When false the engine
    /// behaves like engines that only auto-commit.
    #[serde(default = "default_supports_commit")]
    pub supports_commit: bool,
}

fn default_thread_name() -> String {
    DEFAULT_DISPATCHER_THREAD_NAME.to_string()
}

fn default_supports_commit() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatcher_thread_name: default_thread_name(),
            supports_commit: default_supports_commit(),
        }
    }
}

impl EngineConfig {
    /// Parse config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Config for an engine without explicit commit
    pub fn without_commit() -> Self {
        Self {
            supports_commit: false,
            ..Self::default()
        }
    }
}
