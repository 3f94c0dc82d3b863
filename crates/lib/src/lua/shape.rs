//! The bucket proxy shape: one shared metatable per context.
//!
//! Every bucket proxy is an empty table carrying this metatable. `__index` maps to the
//! get interceptor and `__newindex` to set, or to delete when the assigned value is nil.
//! The raw handlers report failure as `(false, error_value)` and a small Lua dispatch
//! layer raises the error value at the caller's level, so `pcall` receives the table.

use std::rc::{Rc, Weak};

use mlua::prelude::*;

use super::intercept::Interceptors;
use crate::context::ContextState;
use crate::error::{BridgeError, Op};

/// `__type` marker carried by the proxy metatable.
pub const PROXY_TYPE: &str = "kvbridge.bucket";

/// `__type` marker carried by script-visible error values.
pub const ERROR_TYPE: &str = "kvbridge.error";

/// Metatable field holding the type marker.
pub const TYPE_FIELD: &str = "__type";

const DISPATCH_SOURCE: &str = r#"
local get, set, delete, type_name = ...
local error = error

return {
  __type = type_name,
  __metatable = false,
  __index = function(proxy, key)
    local ok, result = get(proxy, key)
    if not ok then
      error(result, 2)
    end
    return result
  end,
  __newindex = function(proxy, key, value)
    local ok, err
    if value == nil then
      ok, err = delete(proxy, key)
    else
      ok, err = set(proxy, key, value)
    end
    if not ok then
      error(err, 2)
    end
  end,
}
"#;

/// Identity of a proxy table within its Lua state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(usize);

impl ProxyId {
  pub fn of(table: &LuaTable) -> Self {
    Self(table.to_pointer() as usize)
  }
}

/// Builds the structured error values raised into scripts.
#[derive(Clone)]
pub(crate) struct ErrorValues {
  metatable: LuaTable,
}

impl ErrorValues {
  fn new(lua: &Lua) -> LuaResult<Self> {
    let metatable = lua.create_table()?;
    metatable.set(TYPE_FIELD, ERROR_TYPE)?;
    metatable.set(
      "__tostring",
      lua.create_function(|_, err: LuaTable| {
        let kind: String = err.raw_get("kind")?;
        let message: String = err.raw_get("message")?;
        Ok(format!("{}: {}", kind, message))
      })?,
    )?;
    Ok(Self { metatable })
  }

  /// `{ kind, op, key, message, code }` with the shared error metatable.
  pub(crate) fn make(&self, lua: &Lua, op: Op, key: &str, err: &BridgeError) -> LuaResult<LuaTable> {
    let value = lua.create_table()?;
    value.set("kind", err.kind().as_str())?;
    value.set("op", op.as_str())?;
    value.set("key", key)?;
    value.set("message", err.to_string())?;
    value.set("code", err.code())?;
    value.set_metatable(Some(self.metatable.clone()))?;
    Ok(value)
  }
}

/// Per-context descriptor shared by every bucket proxy.
pub struct ProxyShape {
  metatable: LuaTable,
  errors: ErrorValues,
}

impl ProxyShape {
  /// Build the shape for the context owning `state`.
  pub(crate) fn build(lua: &Lua, state: Weak<ContextState>) -> LuaResult<Self> {
    let errors = ErrorValues::new(lua)?;
    let interceptors = Rc::new(Interceptors::new(state, errors.clone()));

    let get = {
      let interceptors = Rc::clone(&interceptors);
      lua.create_function(move |lua, (proxy, key): (LuaTable, LuaValue)| interceptors.get(lua, &proxy, key))?
    };
    let set = {
      let interceptors = Rc::clone(&interceptors);
      lua.create_function(move |lua, (proxy, key, value): (LuaTable, LuaValue, LuaValue)| {
        interceptors.set(lua, &proxy, key, value)
      })?
    };
    let delete = lua.create_function(move |lua, (proxy, key): (LuaTable, LuaValue)| interceptors.delete(lua, &proxy, key))?;

    let metatable: LuaTable = lua
      .load(DISPATCH_SOURCE)
      .set_name("=kvbridge.shape")
      .call((get, set, delete, PROXY_TYPE))?;

    Ok(Self { metatable, errors })
  }

  /// Create a new, empty proxy carrying this shape.
  pub fn instantiate(&self, lua: &Lua) -> LuaResult<LuaTable> {
    let proxy = lua.create_table()?;
    proxy.set_metatable(Some(self.metatable.clone()))?;
    Ok(proxy)
  }

  /// Whether `table` was created from this shape.
  pub fn is_instance(&self, table: &LuaTable) -> bool {
    table
      .metatable()
      .is_some_and(|mt| mt.to_pointer() == self.metatable.to_pointer())
  }

  pub fn make_error_value(&self, lua: &Lua, op: Op, key: &str, err: &BridgeError) -> LuaResult<LuaTable> {
    self.errors.make(lua, op, key, err)
  }
}
