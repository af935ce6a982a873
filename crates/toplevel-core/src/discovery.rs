//! Locating a worker build from a package index.
//!
//! A package index published next to the worker builds records which
//! compiler produced them. The worker script for that compiler lives at
//!
//! ```text
//! {base_output_url}/compiler/{version}/{content_hash}/worker.js
//! ```

use crate::config::{DiscoveryConfig, InitConfig};
use crate::{ClientError, Result};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Deserialize)]
struct PackageIndex {
    compiler: Option<CompilerInfo>,
}

#[derive(Debug, Deserialize)]
struct CompilerInfo {
    version: Option<String>,
    content_hash: Option<String>,
}

/// Where a worker build and its index files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLocation {
    /// URL of the worker script.
    pub worker_url: String,
    /// URL of the package index the location was derived from.
    pub findlib_index: String,
    /// Path of the standard library's dynamic interface index.
    pub stdlib_dcs: String,
}

impl WorkerLocation {
    /// Fetch `index_url` and derive the worker location from it.
    ///
    /// `index_url` must be absolute. `base_output_url` is joined as text and
    /// may be relative, e.g. `/jtw-output`.
    pub async fn from_index(index_url: &str, base_output_url: &str) -> Result<Self> {
        let parsed = parse_url("index_url", index_url)?;

        let client = Client::builder()
            .timeout(DiscoveryConfig::INDEX_FETCH_TIMEOUT)
            .user_agent(DiscoveryConfig::USER_AGENT)
            .build()?;

        debug!("Fetching package index from {}", parsed);
        let response = client.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Network {
                message: format!("Failed to fetch package index: {}", status),
                source: None,
            });
        }

        let index: serde_json::Value = response.json().await?;
        let location = Self::from_index_json(index_url, base_output_url, &index)?;
        info!("Resolved worker at {}", location.worker_url);
        Ok(location)
    }

    /// Derive the worker location from an already fetched index document.
    pub fn from_index_json(
        index_url: &str,
        base_output_url: &str,
        index: &serde_json::Value,
    ) -> Result<Self> {
        let index: PackageIndex = serde_json::from_value(index.clone())?;
        let compiler = index.compiler.ok_or_else(|| ClientError::Validation {
            field: "compiler".to_string(),
            message: "No compiler info in package index".to_string(),
        })?;
        let version = required(compiler.version, "compiler.version")?;
        let hash = required(compiler.content_hash, "compiler.content_hash")?;

        let base = base_output_url.trim_end_matches('/');
        Ok(Self {
            worker_url: format!(
                "{}/compiler/{}/{}/{}",
                base,
                version,
                hash,
                DiscoveryConfig::WORKER_SCRIPT
            ),
            findlib_index: index_url.to_string(),
            stdlib_dcs: DiscoveryConfig::STDLIB_DCS_PATH.to_string(),
        })
    }

    /// Handshake configuration pointing the worker at this location's indexes.
    pub fn init_config<I, S>(&self, requires: I) -> InitConfig
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        requires
            .into_iter()
            .fold(InitConfig::new(), |config, package| config.require(package))
            .with_findlib_index(self.findlib_index.clone())
            .with_stdlib_dcs(self.stdlib_dcs.clone())
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| ClientError::Validation {
        field: field.to_string(),
        message: format!("Invalid URL '{}': {}", value, e),
    })
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ClientError::Validation {
            field: field.to_string(),
            message: "missing from package index".to_string(),
        }),
    }
}
