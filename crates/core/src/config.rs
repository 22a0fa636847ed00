//! Bridge configuration via `idbind.toml`
//!
//! The configuration controls behavior the bridge applies on its own, outside
//! any single call: what happens to an open database when another connection
//! upgrades it, and the default deadline for blocking waits.

use crate::error::{Error, Result};
use crate::scope::{CancelGuard, Scope};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Conventional config file name.
pub const CONFIG_FILE_NAME: &str = "idbind.toml";

/// What to do with an open database when the engine reports that another
/// connection wants to change its version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionChangePolicy {
    /// Close the connection so the upgrade can proceed
    #[default]
    Close,
    /// Keep the connection open and mark it as outdated
    Flag,
}

/// Bridge configuration loaded from `idbind.toml`.
///
/// # Example
///
/// ```toml
/// on_version_change = "close"
/// default_timeout_ms = 30000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Reaction to external version changes: `"close"` or `"flag"`.
    #[serde(default)]
    pub on_version_change: VersionChangePolicy,
    /// Deadline applied by [`BridgeConfig::scope`]; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
}

impl BridgeConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# idbind bridge configuration
#
# Reaction when another connection upgrades an open database:
#   "close" = close this connection (default)
#   "flag"  = keep it open and mark it as outdated
on_version_change = "close"

# Deadline in milliseconds for waits that use the configured scope.
# Unbounded when omitted.
# default_timeout_ms = 30000
"#
    }

    /// Parse config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Serialize this config to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// The configured default timeout
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// A fresh wait scope honoring the default timeout
    pub fn scope(&self) -> (Scope, CancelGuard) {
        let background = Scope::background();
        match self.default_timeout() {
            Some(timeout) => background.with_timeout(timeout),
            None => background.with_cancel(),
        }
    }
}
