//! Bucket bindings: one configured alias, its connection and its proxy.
//!
//! A binding moves through `Created → Connecting → Ready → Closed`, or ends in
//! `Failed` when initialization does not complete. It owns its connection
//! exclusively and refers back to its context weakly, so it can never keep a
//! torn-down context alive.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use mlua::prelude::*;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::BucketConfig;
use crate::context::ContextState;
use crate::error::BridgeError;
use crate::lua::shape::ProxyId;
use crate::signal::ClosingSignal;
use crate::store::{Connection, StoreClient};

/// Lua reserved words; none of them can name a global.
const LUA_KEYWORDS: &[&str] = &[
  "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in", "local", "nil",
  "not", "or", "repeat", "return", "then", "true", "until", "while",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
  Created,
  Connecting,
  Ready,
  Closed,
  Failed,
}

impl BindingState {
  pub fn as_str(self) -> &'static str {
    match self {
      BindingState::Created => "created",
      BindingState::Connecting => "connecting",
      BindingState::Ready => "ready",
      BindingState::Closed => "closed",
      BindingState::Failed => "failed",
    }
  }
}

impl fmt::Display for BindingState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Check that `alias` can be used as a Lua global name.
pub fn validate_alias(alias: &str) -> Result<(), BridgeError> {
  let invalid = |reason: &str| BridgeError::InvalidAlias {
    alias: alias.to_string(),
    reason: reason.to_string(),
  };

  let mut chars = alias.chars();
  match chars.next() {
    None => return Err(invalid("alias is empty")),
    Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
      return Err(invalid("alias must start with a letter or underscore"));
    }
    Some(_) => {}
  }
  if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
    return Err(invalid("alias may only contain letters, digits and underscores"));
  }
  if LUA_KEYWORDS.contains(&alias) {
    return Err(invalid("alias is a Lua keyword"));
  }
  Ok(())
}

/// One alias bound to one store connection.
pub struct BucketBinding {
  alias: String,
  store_name: String,
  endpoint: String,
  token: Option<String>,
  state: Cell<BindingState>,
  connection: RefCell<Option<Connection>>,
  proxy: RefCell<Option<LuaTable>>,
  context: Weak<ContextState>,
}

impl BucketBinding {
  pub(crate) fn new(config: &BucketConfig, context: Weak<ContextState>) -> Self {
    Self {
      alias: config.alias.clone(),
      store_name: config.store_name.clone(),
      endpoint: config.endpoint.clone(),
      token: config.token.clone(),
      state: Cell::new(BindingState::Created),
      connection: RefCell::new(None),
      proxy: RefCell::new(None),
      context,
    }
  }

  pub fn alias(&self) -> &str {
    &self.alias
  }

  pub fn store_name(&self) -> &str {
    &self.store_name
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  pub fn state(&self) -> BindingState {
    self.state.get()
  }

  fn transition(&self, to: BindingState) {
    let from = self.state.replace(to);
    info!(alias = %self.alias, store = %self.store_name, %from, %to, "bucket binding state changed");
  }

  /// Connect and install the proxy under the alias.
  ///
  /// On failure the binding ends `Failed` with nothing installed.
  pub(crate) fn initialize(self: &Rc<Self>, lua: &Lua, client: &StoreClient) -> Result<(), BridgeError> {
    self.transition(BindingState::Connecting);

    let result = self.connect_and_install(lua, client);
    if let Err(err) = &result {
      warn!(alias = %self.alias, endpoint = %self.endpoint, error = %err, "bucket binding failed");
      if let Some(connection) = self.connection.borrow_mut().take() {
        connection.close();
      }
      self.transition(BindingState::Failed);
    }
    result
  }

  fn connect_and_install(self: &Rc<Self>, lua: &Lua, client: &StoreClient) -> Result<(), BridgeError> {
    let context = self.context.upgrade().ok_or(BridgeError::ContextClosing)?;
    validate_alias(&self.alias)?;
    if context.is_defined(lua, &self.alias)? {
      return Err(BridgeError::DuplicateAlias {
        alias: self.alias.clone(),
      });
    }

    let connection = client.connect(&self.endpoint, &self.store_name, self.token.as_deref())?;
    *self.connection.borrow_mut() = Some(connection);

    let shape = context.shape(lua)?;
    let proxy = shape.instantiate(lua)?;
    context.register_route(ProxyId::of(&proxy), Rc::clone(self));
    if let Err(err) = context.install_global(lua, &self.alias, &proxy) {
      context.remove_route(ProxyId::of(&proxy));
      return Err(err);
    }
    *self.proxy.borrow_mut() = Some(proxy);

    self.transition(BindingState::Ready);
    Ok(())
  }

  fn closing_signal(&self) -> Result<ClosingSignal, BridgeError> {
    let context = self.context.upgrade().ok_or(BridgeError::ContextClosing)?;
    let closing = context.closing();
    if closing.is_closing() {
      return Err(BridgeError::ContextClosing);
    }
    Ok(closing)
  }

  fn with_connection<T>(&self, f: impl FnOnce(&Connection, &ClosingSignal) -> Result<T, BridgeError>) -> Result<T, BridgeError> {
    let closing = self.closing_signal()?;
    let connection = self.connection.borrow();
    match connection.as_ref() {
      Some(connection) if self.state() == BindingState::Ready => f(connection, &closing),
      _ => Err(BridgeError::ContextClosing),
    }
  }

  /// Fetch `key`. `Ok(None)` means the key is absent.
  pub fn get(&self, key: &str) -> Result<Option<Value>, BridgeError> {
    self.with_connection(|connection, closing| {
      match connection.wait(connection.async_get(key), closing) {
        Ok(value) => Ok(Some(value)),
        Err(BridgeError::KeyNotFound { .. }) => Ok(None),
        Err(err) => Err(err),
      }
    })
  }

  pub fn set(&self, key: &str, value: Value) -> Result<(), BridgeError> {
    self.with_connection(|connection, closing| {
      connection.wait(connection.async_set(key, value), closing).map(|_| ())
    })
  }

  /// Remove `key`. Removing an absent key succeeds.
  pub fn delete(&self, key: &str) -> Result<(), BridgeError> {
    self.with_connection(|connection, closing| {
      match connection.wait(connection.async_delete(key), closing) {
        Ok(_) => Ok(()),
        Err(BridgeError::KeyNotFound { .. }) => {
          debug!(alias = %self.alias, key = %key, "delete of absent key");
          Ok(())
        }
        Err(err) => Err(err),
      }
    })
  }

  /// Detach the proxy and close the connection. No-op unless `Ready`.
  pub(crate) fn close(&self, lua: &Lua) {
    if self.state() != BindingState::Ready {
      return;
    }

    let proxy = self.proxy.borrow_mut().take();
    if let Some(proxy) = proxy
      && let Some(context) = self.context.upgrade()
    {
      context.uninstall_global(lua, &self.alias, &proxy);
      context.remove_route(ProxyId::of(&proxy));
    }
    if let Some(connection) = self.connection.borrow_mut().take() {
      connection.close();
    }
    self.transition(BindingState::Closed);
  }
}

impl fmt::Debug for BucketBinding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BucketBinding")
      .field("alias", &self.alias)
      .field("store_name", &self.store_name)
      .field("endpoint", &self.endpoint)
      .field("state", &self.state.get())
      .finish()
  }
}
