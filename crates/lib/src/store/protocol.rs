//! Wire format spoken between the store client and the store server.
//!
//! Frames are newline-delimited JSON objects. Every request carries a correlation
//! id that the matching response echoes, so responses may arrive in any order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest key the store accepts, in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// Largest encoded value the store accepts, in bytes.
pub const MAX_VALUE_LEN: usize = 20 * 1024 * 1024;

/// Correlation id reserved for the connection handshake.
pub const HELLO_ID: u64 = 0;

pub mod codes {
  pub const UNKNOWN_STORE: &str = "unknown_store";
  pub const AUTH_FAILED: &str = "auth_failed";
  pub const INVALID_KEY: &str = "invalid_key";
  pub const VALUE_TOO_LARGE: &str = "value_too_large";
  pub const PROTOCOL: &str = "protocol";
  pub const DISCONNECTED: &str = "disconnected";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
  Hello {
    store: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
  },
  Get {
    key: String,
  },
  Set {
    key: String,
    value: Value,
  },
  Delete {
    key: String,
  },
}

impl Command {
  pub fn key(&self) -> Option<&str> {
    match self {
      Command::Hello { .. } => None,
      Command::Get { key } | Command::Set { key, .. } | Command::Delete { key } => Some(key),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  pub id: u64,
  #[serde(flatten)]
  pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
  Ok {
    #[serde(default)]
    value: Value,
  },
  NotFound,
  Error {
    code: String,
    message: String,
  },
}

impl Status {
  pub fn ok() -> Self {
    Status::Ok { value: Value::Null }
  }

  pub fn error(code: &str, message: impl Into<String>) -> Self {
    Status::Error {
      code: code.to_string(),
      message: message.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub id: u64,
  #[serde(flatten)]
  pub status: Status,
}

/// Encode a frame as one JSON line, newline included.
pub fn encode_line<T: Serialize>(frame: &T) -> serde_json::Result<Vec<u8>> {
  let mut line = serde_json::to_vec(frame)?;
  line.push(b'\n');
  Ok(line)
}

/// Check a key against the store's key rules, returning the reason it is rejected.
pub fn validate_key(key: &str) -> Result<(), String> {
  if key.is_empty() {
    return Err("key must not be empty".to_string());
  }
  if key.len() > MAX_KEY_LEN {
    return Err(format!("key is {} bytes, limit is {}", key.len(), MAX_KEY_LEN));
  }
  Ok(())
}
