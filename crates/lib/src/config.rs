//! Bucket configuration loading.
//!
//! A configuration names the buckets to expose to scripts (in install order) and the
//! timing settings of the store client. Files are TOML or JSON, chosen by extension.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Errors that can occur while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("cannot read config '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid TOML in '{path}': {source}")]
  Toml {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid JSON in '{path}': {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unsupported config format '{0}' (expected .toml or .json)")]
  UnsupportedFormat(PathBuf),
}

/// One alias-to-store pairing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
  /// Global identifier the proxy is installed under.
  pub alias: String,
  /// Name of the remote store (bucket) selected during the handshake.
  pub store_name: String,
  /// `host:port` of the store server.
  pub endpoint: String,
  /// Access token presented during the handshake.
  #[serde(default)]
  pub token: Option<String>,
}

impl BucketConfig {
  pub fn new(alias: &str, store_name: &str, endpoint: &str) -> Self {
    Self {
      alias: alias.to_string(),
      store_name: store_name.to_string(),
      endpoint: endpoint.to_string(),
      token: None,
    }
  }

  pub fn with_token(mut self, token: &str) -> Self {
    self.token = Some(token.to_string());
    self
  }
}

/// Store client timing and threading settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
  /// Upper bound on every blocking get/set/delete.
  #[serde(deserialize_with = "humantime_duration")]
  pub op_timeout: Duration,
  /// Upper bound on a single connect attempt, handshake included.
  #[serde(deserialize_with = "humantime_duration")]
  pub connect_timeout: Duration,
  /// Extra connect attempts after a transport failure. Operations are never retried.
  pub connect_retries: u32,
  /// Fixed backoff between connect attempts.
  #[serde(deserialize_with = "humantime_duration")]
  pub retry_interval: Duration,
  /// Worker threads of the client's I/O runtime.
  pub io_threads: usize,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      op_timeout: Duration::from_secs(2),
      connect_timeout: Duration::from_secs(5),
      connect_retries: 0,
      retry_interval: Duration::from_secs(1),
      io_threads: 1,
    }
  }
}

/// Complete configuration: client settings plus buckets in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
  #[serde(default)]
  pub settings: Settings,
  #[serde(default)]
  pub buckets: Vec<BucketConfig>,
}

impl BridgeConfig {
  /// Load a configuration file, picking the parser from the file extension.
  pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
      Some("toml") => Self::from_toml_str(&content).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
      }),
      Some("json") => serde_json::from_str(&content).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
      }),
      _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    }
  }

  pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
    toml::from_str(content)
  }
}

fn humantime_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}
