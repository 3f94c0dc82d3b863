//! Conversion between Lua values and wire (JSON) values.
//!
//! Lua → wire accepts nil-free trees of booleans, numbers, UTF-8 strings and tables.
//! Functions, userdata, threads and bucket proxies have no wire form and are rejected.
//! A table whose keys are exactly `1..=n` becomes an array and a table with only
//! string keys becomes an object. Anything in between (sparse sequences, mixed
//! integer and string keys) is rejected, since it could not be read back unchanged.
//!
//! JSON `null` maps to the `mlua` null light userdata so it survives inside tables.

use std::collections::HashSet;
use std::ffi::c_void;

use mlua::prelude::*;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::shape::{PROXY_TYPE, TYPE_FIELD};
use crate::store::protocol::MAX_VALUE_LEN;

/// Tables nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 64;

/// Metatable marker keeping empty JSON arrays distinct from empty objects.
pub const EMPTY_ARRAY_TYPE: &str = "kvbridge.empty_array";

/// A Lua value that cannot be sent to the store.
#[derive(Debug, Error)]
pub enum MarshalError {
  /// The value has no wire representation.
  #[error("{0}")]
  Unsupported(String),

  /// The encoded value would exceed what the store accepts.
  #[error("value encodes to more than {limit} bytes")]
  TooLarge { limit: usize },
}

impl MarshalError {
  fn new(reason: impl Into<String>) -> Self {
    MarshalError::Unsupported(reason.into())
  }
}

/// Convert a wire value into a Lua value owned by `lua`.
pub fn native_value_of(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
  match value {
    Value::Null => Ok(LuaValue::NULL),
    Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
    Value::Number(n) => Ok(match n.as_i64() {
      Some(i) => LuaValue::Integer(i),
      None => LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)),
    }),
    Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
    Value::Array(items) => {
      let table = lua.create_table_with_capacity(items.len(), 0)?;
      for (i, item) in items.iter().enumerate() {
        table.raw_set(i + 1, native_value_of(lua, item)?)?;
      }
      if items.is_empty() {
        let mt = lua.create_table()?;
        mt.set(TYPE_FIELD, EMPTY_ARRAY_TYPE)?;
        table.set_metatable(Some(mt))?;
      }
      Ok(LuaValue::Table(table))
    }
    Value::Object(map) => {
      let table = lua.create_table_with_capacity(0, map.len())?;
      for (k, v) in map {
        table.raw_set(k.as_str(), native_value_of(lua, v)?)?;
      }
      Ok(LuaValue::Table(table))
    }
  }
}

/// Convert a Lua value into its wire representation.
pub fn wire_value_of(value: &LuaValue) -> Result<Value, MarshalError> {
  Encoder::new(MAX_VALUE_LEN).encode(value, 0)
}

/// Lua → wire walk.
///
/// `path` holds the tables currently being encoded, so a table reached again
/// through itself is a cycle while one shared between siblings is not. `budget`
/// is a lower bound on the bytes the JSON text still may take; shared subtables
/// are charged once per occurrence.
struct Encoder {
  path: HashSet<*const c_void>,
  budget: usize,
  limit: usize,
}

impl Encoder {
  fn new(limit: usize) -> Self {
    Self {
      path: HashSet::new(),
      budget: limit,
      limit,
    }
  }

  fn charge(&mut self, bytes: usize) -> Result<(), MarshalError> {
    match self.budget.checked_sub(bytes) {
      Some(rest) => {
        self.budget = rest;
        Ok(())
      }
      None => Err(MarshalError::TooLarge { limit: self.limit }),
    }
  }

  fn encode(&mut self, value: &LuaValue, depth: usize) -> Result<Value, MarshalError> {
    match value {
      LuaValue::Nil => {
        self.charge(4)?;
        Ok(Value::Null)
      }
      LuaValue::Boolean(b) => {
        self.charge(4)?;
        Ok(Value::Bool(*b))
      }
      LuaValue::Integer(i) => {
        self.charge(1)?;
        Ok(Value::from(*i))
      }
      LuaValue::Number(n) => {
        self.charge(1)?;
        Number::from_f64(*n)
          .map(Value::Number)
          .ok_or_else(|| MarshalError::new(format!("number {} has no JSON representation", n)))
      }
      LuaValue::String(s) => {
        self.charge(s.as_bytes().len() + 2)?;
        s.to_str()
          .map(|s| Value::String(s.to_string()))
          .map_err(|_| MarshalError::new("string is not valid UTF-8"))
      }
      LuaValue::LightUserData(ud) if ud.0.is_null() => {
        self.charge(4)?;
        Ok(Value::Null)
      }
      LuaValue::Table(t) => {
        let id = t.to_pointer();
        if !self.path.insert(id) {
          return Err(MarshalError::new("cyclic table cannot be stored"));
        }
        let encoded = self.table(t, depth);
        self.path.remove(&id);
        encoded
      }
      other => Err(MarshalError::new(format!(
        "values of type '{}' cannot be stored",
        other.type_name()
      ))),
    }
  }

  fn table(&mut self, table: &LuaTable, depth: usize) -> Result<Value, MarshalError> {
    if depth >= MAX_DEPTH {
      return Err(MarshalError::new(format!("tables nested deeper than {} levels", MAX_DEPTH)));
    }
    self.charge(2)?;

    match type_marker(table).as_deref() {
      Some(PROXY_TYPE) => return Err(MarshalError::new("a bucket proxy cannot be stored")),
      Some(EMPTY_ARRAY_TYPE) if table.raw_len() == 0 => return Ok(Value::Array(Vec::new())),
      _ => {}
    }

    let mut entries = Vec::new();
    let mut integer_keys = 0;
    for pair in table.pairs::<LuaValue, LuaValue>() {
      let (k, v) = pair.map_err(|e| MarshalError::new(e.to_string()))?;
      match &k {
        LuaValue::Integer(_) => integer_keys += 1,
        LuaValue::String(_) => {}
        other => {
          return Err(MarshalError::new(format!(
            "table keys must be strings or integers, found '{}'",
            other.type_name()
          )));
        }
      }
      self.charge(1)?;
      entries.push((k, v));
    }

    if integer_keys == 0 {
      return self.object(entries, depth);
    }

    // Integer keys must be exactly 1..=n
    let n = entries.len();
    let sequence = integer_keys == n
      && entries
        .iter()
        .all(|(k, _)| matches!(k, LuaValue::Integer(i) if (1..=n as i64).contains(i)));
    if !sequence {
      return Err(MarshalError::new(
        "tables mixing integer and string keys, or with gaps in their integer keys, cannot be stored",
      ));
    }
    let mut items = Vec::with_capacity(n);
    for i in 1..=n {
      let item: LuaValue = table.raw_get(i).map_err(|e| MarshalError::new(e.to_string()))?;
      items.push(self.encode(&item, depth + 1)?);
    }
    Ok(Value::Array(items))
  }

  fn object(&mut self, entries: Vec<(LuaValue, LuaValue)>, depth: usize) -> Result<Value, MarshalError> {
    let mut map = Map::with_capacity(entries.len());
    for (k, v) in entries {
      let LuaValue::String(s) = k else {
        continue;
      };
      let key = s
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| MarshalError::new("table key is not valid UTF-8"))?;
      self.charge(key.len() + 3)?;
      map.insert(key, self.encode(&v, depth + 1)?);
    }
    Ok(Value::Object(map))
  }
}

fn type_marker(table: &LuaTable) -> Option<String> {
  table
    .metatable()
    .and_then(|mt| mt.raw_get::<Option<String>>(TYPE_FIELD).ok().flatten())
}
