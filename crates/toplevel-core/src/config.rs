//! Centralized configuration for the worker client.
//!
//! Constants for timeouts, framing limits and discovery paths, plus the
//! `InitConfig` sent to the worker during the readiness handshake.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client-level configuration.
pub struct ClientConfig;

impl ClientConfig {
    /// Default timeout applied to every pending request and the handshake.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);
    /// Environment id of the worker's implicit default environment.
    pub const DEFAULT_ENV_ID: &'static str = "";
    /// First numeric correlation key handed out by a fresh client.
    pub const FIRST_CELL_ID: u64 = 1;
}

/// Stream transport configuration.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Inbound frames buffered between the reader task and the client.
    pub const INBOUND_BUFFER: usize = 256;
}

/// Worker discovery configuration.
pub struct DiscoveryConfig;

impl DiscoveryConfig {
    pub const INDEX_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
    pub const STDLIB_DCS_PATH: &'static str = "lib/ocaml/dynamic_cmis.json";
    pub const WORKER_SCRIPT: &'static str = "worker.js";
    pub const USER_AGENT: &'static str = "toplevel-core/0.1";
}

/// Configuration sent with the worker's one-time `init` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    /// Packages the worker must load before reporting readiness.
    #[serde(default)]
    pub findlib_requires: Vec<String>,
    /// URL of the standard library's dynamic interface index.
    #[serde(default)]
    pub stdlib_dcs: Option<String>,
    /// URL of the package index.
    #[serde(default)]
    pub findlib_index: Option<String>,
}

impl InitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package to load during initialization.
    pub fn require(mut self, package: impl Into<String>) -> Self {
        self.findlib_requires.push(package.into());
        self
    }

    pub fn with_stdlib_dcs(mut self, url: impl Into<String>) -> Self {
        self.stdlib_dcs = Some(url.into());
        self
    }

    pub fn with_findlib_index(mut self, url: impl Into<String>) -> Self {
        self.findlib_index = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_is_thirty_seconds() {
        assert_eq!(ClientConfig::DEFAULT_REQUEST_TIMEOUT, Duration::from_secs(30));
    }

    #[test]
    fn test_init_config_builder() {
        let config = InitConfig::new()
            .require("fmt")
            .require("astring")
            .with_findlib_index("/idx/findlib_index");

        assert_eq!(config.findlib_requires, vec!["fmt", "astring"]);
        assert_eq!(config.findlib_index.as_deref(), Some("/idx/findlib_index"));
        assert!(config.stdlib_dcs.is_none());
    }

    #[test]
    fn test_init_config_tolerates_missing_fields() {
        let config: InitConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, InitConfig::default());
    }
}
