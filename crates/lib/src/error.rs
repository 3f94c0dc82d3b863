//! Error taxonomy shared by the store adapter, bucket bindings and interceptors.
//!
//! Initialization failures (`DuplicateAlias`, `InvalidAlias`, `ConnectFailed`) abort
//! installation of a binding. Per-access failures are turned into script-visible
//! error values by the interceptors and never tear down the binding.

use std::fmt;
use std::time::Duration;

use mlua::prelude::*;
use thiserror::Error;

/// Which intercepted property operation produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
  Get,
  Set,
  Delete,
}

impl Op {
  pub fn as_str(self) -> &'static str {
    match self {
      Op::Get => "get",
      Op::Set => "set",
      Op::Delete => "delete",
    }
  }
}

impl fmt::Display for Op {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Stable, script-visible classification of a [`BridgeError`].
///
/// The string form is what Lua code sees in `err.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  DuplicateAlias,
  InvalidAlias,
  ConnectFailed,
  KeyNotFound,
  InvalidKey,
  UnsupportedValue,
  Timeout,
  ContextClosing,
  StoreError,
  ScriptError,
}

impl ErrorKind {
  pub fn as_str(self) -> &'static str {
    match self {
      ErrorKind::DuplicateAlias => "DuplicateAlias",
      ErrorKind::InvalidAlias => "InvalidAlias",
      ErrorKind::ConnectFailed => "ConnectFailed",
      ErrorKind::KeyNotFound => "KeyNotFound",
      ErrorKind::InvalidKey => "InvalidKey",
      ErrorKind::UnsupportedValue => "UnsupportedValue",
      ErrorKind::Timeout => "Timeout",
      ErrorKind::ContextClosing => "ContextClosing",
      ErrorKind::StoreError => "StoreError",
      ErrorKind::ScriptError => "ScriptError",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Errors produced while binding buckets or serving intercepted property access.
#[derive(Debug, Error)]
pub enum BridgeError {
  /// The alias is already defined in the context's global namespace.
  #[error("alias '{alias}' is already bound in this context")]
  DuplicateAlias { alias: String },

  /// The alias cannot be used as a global identifier.
  #[error("invalid bucket alias '{alias}': {reason}")]
  InvalidAlias { alias: String, reason: String },

  /// The store connection could not be established.
  #[error("failed to connect to store '{store}' at {endpoint}: {reason}")]
  ConnectFailed {
    endpoint: String,
    store: String,
    reason: String,
  },

  /// The key does not exist in the store.
  #[error("key '{key}' not found")]
  KeyNotFound { key: String },

  /// The key cannot be used for a store operation.
  #[error("key {key:?} cannot be used with a bucket: {reason}")]
  InvalidKey { key: String, reason: String },

  /// The assigned value has no wire representation.
  #[error("cannot store value for key '{key}': {reason}")]
  UnsupportedValue { key: String, reason: String },

  /// The operation did not complete within the configured bound.
  #[error("{op} of key '{key}' timed out after {after:?}")]
  Timeout { op: Op, key: String, after: Duration },

  /// The owning context is being torn down.
  #[error("context is closing")]
  ContextClosing,

  /// Any other failure reported by the store.
  #[error("store error [{code}]: {message}")]
  Store { code: String, message: String },

  /// Script evaluation failed.
  #[error("lua error: {0}")]
  Script(#[from] LuaError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl BridgeError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      BridgeError::DuplicateAlias { .. } => ErrorKind::DuplicateAlias,
      BridgeError::InvalidAlias { .. } => ErrorKind::InvalidAlias,
      BridgeError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
      BridgeError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
      BridgeError::InvalidKey { .. } => ErrorKind::InvalidKey,
      BridgeError::UnsupportedValue { .. } => ErrorKind::UnsupportedValue,
      BridgeError::Timeout { .. } => ErrorKind::Timeout,
      BridgeError::ContextClosing => ErrorKind::ContextClosing,
      BridgeError::Store { .. } | BridgeError::Io(_) => ErrorKind::StoreError,
      BridgeError::Script(_) => ErrorKind::ScriptError,
    }
  }

  /// Store-level error code, when the store reported one.
  pub fn code(&self) -> Option<&str> {
    match self {
      BridgeError::Store { code, .. } => Some(code),
      _ => None,
    }
  }

  pub(crate) fn store(code: impl Into<String>, message: impl Into<String>) -> Self {
    BridgeError::Store {
      code: code.into(),
      message: message.into(),
    }
  }
}
