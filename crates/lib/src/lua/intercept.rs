//! Property interceptors for bucket proxies.
//!
//! Each handler resolves the binding behind the proxy, performs one blocking store
//! operation and marshals the result. Handlers never raise directly: they return
//! `(true, result)` or `(false, error_value)` and the shape's dispatch layer raises.

use std::rc::{Rc, Weak};

use mlua::prelude::*;
use tracing::debug;

use super::shape::{ErrorValues, ProxyId};
use super::value::{MarshalError, native_value_of, wire_value_of};
use crate::bucket::BucketBinding;
use crate::context::ContextState;
use crate::error::{BridgeError, Op};
use crate::store::protocol::codes;

type Outcome = (bool, LuaValue);

/// The store key addressed by a property key, or `None` for reserved keys.
///
/// Strings are data keys unless empty or in the `__` metamethod namespace.
/// Integers, and floats with an integral value, address the same key as their
/// decimal string, so `kv[1]`, `kv[1.0]` and `kv["1"]` agree.
pub fn data_key(key: &LuaValue) -> Option<String> {
  match key {
    LuaValue::String(s) => {
      let s = s.to_str().ok()?;
      if s.is_empty() || s.starts_with("__") {
        None
      } else {
        Some(s.to_string())
      }
    }
    LuaValue::Integer(i) => Some(i.to_string()),
    LuaValue::Number(n) => integral(*n).map(|i| i.to_string()),
    _ => None,
  }
}

/// `n` as an integer when Lua would normalize it to one as a table key.
fn integral(n: f64) -> Option<i64> {
  const BOUND: f64 = 9_223_372_036_854_775_808.0; // 2^63
  if n.fract() == 0.0 && (-BOUND..BOUND).contains(&n) {
    Some(n as i64)
  } else {
    None
  }
}

/// Printable form of any property key, for error values and logs.
fn describe_key(key: &LuaValue) -> String {
  match key {
    LuaValue::String(s) => s.to_string_lossy(),
    LuaValue::Integer(i) => i.to_string(),
    LuaValue::Number(n) => n.to_string(),
    LuaValue::Boolean(b) => b.to_string(),
    other => format!("<{}>", other.type_name()),
  }
}

fn reserved_key_reason(key: &LuaValue) -> &'static str {
  match key {
    LuaValue::String(s) if s.as_bytes().is_empty() => "key is empty",
    LuaValue::String(s) if s.as_bytes().starts_with(b"__") => "keys starting with '__' are reserved",
    LuaValue::String(_) => "key is not valid UTF-8",
    _ => "keys must be strings or integers",
  }
}

pub(crate) struct Interceptors {
  context: Weak<ContextState>,
  errors: ErrorValues,
}

impl Interceptors {
  pub(crate) fn new(context: Weak<ContextState>, errors: ErrorValues) -> Self {
    Self { context, errors }
  }

  fn binding(&self, proxy: &LuaTable) -> Result<Rc<BucketBinding>, BridgeError> {
    let context = self.context.upgrade().ok_or(BridgeError::ContextClosing)?;
    context.route(ProxyId::of(proxy)).ok_or(BridgeError::ContextClosing)
  }

  fn fail(&self, lua: &Lua, op: Op, key: &str, err: BridgeError) -> LuaResult<Outcome> {
    debug!(op = %op, key = %key, kind = %err.kind(), error = %err, "property access failed");
    let value = self.errors.make(lua, op, key, &err)?;
    Ok((false, LuaValue::Table(value)))
  }

  fn reject_key(&self, lua: &Lua, op: Op, key: &LuaValue) -> LuaResult<Outcome> {
    let shown = describe_key(key);
    let err = BridgeError::InvalidKey {
      key: shown.clone(),
      reason: reserved_key_reason(key).to_string(),
    };
    self.fail(lua, op, &shown, err)
  }

  /// `proxy[key]`: the stored value, or nil when the key is absent or reserved.
  pub(crate) fn get(&self, lua: &Lua, proxy: &LuaTable, key: LuaValue) -> LuaResult<Outcome> {
    let Some(key) = data_key(&key) else {
      return Ok((true, LuaValue::Nil));
    };

    match self.binding(proxy).and_then(|binding| binding.get(&key)) {
      Ok(Some(value)) => Ok((true, native_value_of(lua, &value)?)),
      Ok(None) => Ok((true, LuaValue::Nil)),
      Err(err) => self.fail(lua, Op::Get, &key, err),
    }
  }

  /// `proxy[key] = value` for a non-nil value.
  pub(crate) fn set(&self, lua: &Lua, proxy: &LuaTable, key: LuaValue, value: LuaValue) -> LuaResult<Outcome> {
    let Some(name) = data_key(&key) else {
      return self.reject_key(lua, Op::Set, &key);
    };

    let wire = match wire_value_of(&value) {
      Ok(wire) => wire,
      Err(e @ MarshalError::TooLarge { .. }) => {
        return self.fail(lua, Op::Set, &name, BridgeError::store(codes::VALUE_TOO_LARGE, e.to_string()));
      }
      Err(e) => {
        let err = BridgeError::UnsupportedValue {
          key: name.clone(),
          reason: e.to_string(),
        };
        return self.fail(lua, Op::Set, &name, err);
      }
    };

    match self.binding(proxy).and_then(|binding| binding.set(&name, wire)) {
      Ok(()) => Ok((true, LuaValue::Nil)),
      Err(err) => self.fail(lua, Op::Set, &name, err),
    }
  }

  /// `proxy[key] = nil`. Deleting an absent key succeeds.
  pub(crate) fn delete(&self, lua: &Lua, proxy: &LuaTable, key: LuaValue) -> LuaResult<Outcome> {
    let Some(name) = data_key(&key) else {
      return self.reject_key(lua, Op::Delete, &key);
    };

    match self.binding(proxy).and_then(|binding| binding.delete(&name)) {
      Ok(()) => Ok((true, LuaValue::Boolean(true))),
      Err(err) => self.fail(lua, Op::Delete, &name, err),
    }
  }
}
