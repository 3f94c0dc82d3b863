//! The owning script context: one Lua state plus the buckets bound into it.
//!
//! A context is single-threaded. The only piece that may cross threads is its
//! [`ClosingSignal`], which lets a supervisor abandon a blocked property access.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;
use tracing::{debug, info, warn};

use crate::bucket::{BindingState, BucketBinding};
use crate::config::BucketConfig;
use crate::error::{BridgeError, Op};
use crate::lua::shape::{ProxyId, ProxyShape};
use crate::signal::ClosingSignal;
use crate::store::StoreClient;

/// State shared between a context, its bindings and its interceptors.
pub(crate) struct ContextState {
  shape: OnceCell<Rc<ProxyShape>>,
  routes: RefCell<HashMap<ProxyId, Rc<BucketBinding>>>,
  bindings: RefCell<Vec<Rc<BucketBinding>>>,
  closing: ClosingSignal,
  closed: Cell<bool>,
}

impl ContextState {
  fn new() -> Self {
    Self {
      shape: OnceCell::new(),
      routes: RefCell::new(HashMap::new()),
      bindings: RefCell::new(Vec::new()),
      closing: ClosingSignal::new(),
      closed: Cell::new(false),
    }
  }

  /// The context's proxy shape, built on first use.
  pub(crate) fn shape(self: &Rc<Self>, lua: &Lua) -> LuaResult<Rc<ProxyShape>> {
    if let Some(shape) = self.shape.get() {
      return Ok(Rc::clone(shape));
    }
    let shape = Rc::new(ProxyShape::build(lua, Rc::downgrade(self))?);
    debug!("built bucket proxy shape");
    Ok(Rc::clone(self.shape.get_or_init(|| shape)))
  }

  pub(crate) fn closing(&self) -> ClosingSignal {
    self.closing.clone()
  }

  pub(crate) fn route(&self, id: ProxyId) -> Option<Rc<BucketBinding>> {
    self.routes.borrow().get(&id).cloned()
  }

  pub(crate) fn register_route(&self, id: ProxyId, binding: Rc<BucketBinding>) {
    self.routes.borrow_mut().insert(id, binding);
  }

  pub(crate) fn remove_route(&self, id: ProxyId) {
    self.routes.borrow_mut().remove(&id);
  }

  /// Whether `name` already holds a value in the global namespace.
  pub(crate) fn is_defined(&self, lua: &Lua, name: &str) -> LuaResult<bool> {
    let value: LuaValue = lua.globals().raw_get(name)?;
    Ok(!value.is_nil())
  }

  pub(crate) fn install_global(&self, lua: &Lua, alias: &str, proxy: &LuaTable) -> Result<(), BridgeError> {
    if self.is_defined(lua, alias)? {
      return Err(BridgeError::DuplicateAlias {
        alias: alias.to_string(),
      });
    }
    lua.globals().raw_set(alias, proxy.clone())?;
    Ok(())
  }

  /// Remove `alias` from the globals if it still refers to `proxy`.
  pub(crate) fn uninstall_global(&self, lua: &Lua, alias: &str, proxy: &LuaTable) {
    let globals = lua.globals();
    match globals.raw_get::<LuaValue>(alias) {
      Ok(LuaValue::Table(current)) if current.to_pointer() == proxy.to_pointer() => {
        if let Err(e) = globals.raw_set(alias, LuaValue::Nil) {
          warn!(alias = %alias, error = %e, "failed to remove bucket global");
        }
      }
      Ok(_) => debug!(alias = %alias, "global was reassigned by the script, leaving it in place"),
      Err(e) => warn!(alias = %alias, error = %e, "failed to read bucket global"),
    }
  }
}

/// A Lua state with bucket proxies installed as globals.
pub struct ScriptContext {
  state: Rc<ContextState>,
  lua: Lua,
}

impl ScriptContext {
  pub fn new() -> Self {
    Self {
      state: Rc::new(ContextState::new()),
      lua: Lua::new(),
    }
  }

  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  /// The shared proxy shape of this context. Built once, then cached.
  pub fn proxy_shape(&self) -> Result<Rc<ProxyShape>, BridgeError> {
    Ok(self.state.shape(&self.lua)?)
  }

  /// A new proxy object. It is not routed to any bucket until bound.
  pub fn make_proxy(&self, shape: &ProxyShape) -> Result<LuaTable, BridgeError> {
    Ok(shape.instantiate(&self.lua)?)
  }

  /// Define a global, failing with `DuplicateAlias` if the name is taken.
  pub fn install_global(&self, alias: &str, value: &LuaTable) -> Result<(), BridgeError> {
    self.state.install_global(&self.lua, alias, value)
  }

  /// Build the structured error value scripts receive for a failed access.
  pub fn make_error_value(&self, op: Op, key: &str, err: &BridgeError) -> Result<LuaTable, BridgeError> {
    Ok(self.proxy_shape()?.make_error_value(&self.lua, op, key, err)?)
  }

  /// Create and initialize one bucket binding.
  ///
  /// Leaves every other binding untouched whether or not this one succeeds.
  pub fn bind_bucket(&self, client: &StoreClient, config: &BucketConfig) -> Result<Rc<BucketBinding>, BridgeError> {
    if self.is_closing() {
      return Err(BridgeError::ContextClosing);
    }
    let binding = Rc::new(BucketBinding::new(config, Rc::downgrade(&self.state)));
    binding.initialize(&self.lua, client)?;
    self.state.bindings.borrow_mut().push(Rc::clone(&binding));
    Ok(binding)
  }

  /// Tear down the binding installed under `alias`. Returns false if there is none.
  pub fn unbind(&self, alias: &str) -> bool {
    let binding = {
      let mut bindings = self.state.bindings.borrow_mut();
      match bindings.iter().position(|b| b.alias() == alias) {
        Some(index) => bindings.remove(index),
        None => return false,
      }
    };
    binding.close(&self.lua);
    true
  }

  pub fn binding(&self, alias: &str) -> Option<Rc<BucketBinding>> {
    self.state.bindings.borrow().iter().find(|b| b.alias() == alias).cloned()
  }

  pub fn binding_state(&self, alias: &str) -> Option<BindingState> {
    self.binding(alias).map(|b| b.state())
  }

  /// Aliases of the installed buckets, in install order.
  pub fn aliases(&self) -> Vec<String> {
    self.state.bindings.borrow().iter().map(|b| b.alias().to_string()).collect()
  }

  /// A handle that can signal teardown from any thread.
  pub fn closer(&self) -> ClosingSignal {
    self.state.closing()
  }

  pub fn is_closing(&self) -> bool {
    self.state.closing.is_closing()
  }

  fn ensure_open(&self) -> Result<(), BridgeError> {
    if self.is_closing() {
      return Err(BridgeError::ContextClosing);
    }
    Ok(())
  }

  /// Run a chunk of Lua source.
  pub fn exec(&self, source: &str, name: &str) -> Result<(), BridgeError> {
    self.ensure_open()?;
    self.lua.load(source).set_name(name).exec()?;
    Ok(())
  }

  /// Evaluate a chunk and convert its result.
  pub fn eval<R: FromLuaMulti>(&self, source: &str) -> Result<R, BridgeError> {
    self.ensure_open()?;
    Ok(self.lua.load(source).eval()?)
  }

  /// Run a Lua file.
  pub fn exec_file(&self, path: &Path) -> Result<(), BridgeError> {
    let source = std::fs::read_to_string(path)?;
    self.exec(&source, &format!("@{}", path.display()))
  }

  /// Signal closing and tear every binding down in reverse install order. Idempotent.
  pub fn close(&self) {
    if self.state.closed.replace(true) {
      return;
    }
    self.state.closing.close();

    let bindings = std::mem::take(&mut *self.state.bindings.borrow_mut());
    for binding in bindings.iter().rev() {
      binding.close(&self.lua);
    }
    info!(buckets = bindings.len(), "script context closed");
  }
}

impl Default for ScriptContext {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for ScriptContext {
  fn drop(&mut self) {
    self.close();
  }
}
