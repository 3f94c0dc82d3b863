//! Key-level properties of the bridge, checked against a live store.

use mlua::prelude::*;
use proptest::prelude::*;

use super::common::Fixture;

fn key_strategy() -> impl Strategy<Value = String> {
  "[a-z][a-z0-9_]{0,15}"
}

fn scalar_strategy() -> impl Strategy<Value = Scalar> {
  prop_oneof![
    any::<bool>().prop_map(Scalar::Bool),
    any::<i64>().prop_map(Scalar::Int),
    "[ -~]{0,32}".prop_map(Scalar::Text),
  ]
}

#[derive(Debug, Clone)]
enum Scalar {
  Bool(bool),
  Int(i64),
  Text(String),
}

impl IntoLua for Scalar {
  fn into_lua(self, lua: &Lua) -> LuaResult<LuaValue> {
    match self {
      Scalar::Bool(b) => b.into_lua(lua),
      Scalar::Int(i) => i.into_lua(lua),
      Scalar::Text(s) => s.into_lua(lua),
    }
  }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(32))]

  #[test]
  fn unset_keys_are_absent(key in key_strategy()) {
    let fx = Fixture::new();
    let absent: bool = fx.ctx.lua().load("return kv[...] == nil").call(key).unwrap();
    prop_assert!(absent);
  }

  #[test]
  fn get_returns_last_set(key in key_strategy(), values in prop::collection::vec(scalar_strategy(), 1..5)) {
    let fx = Fixture::new();
    let lua = fx.ctx.lua();
    let set = lua.load("local k, v = ...; kv[k] = v").into_function().unwrap();
    for value in &values {
      set.call::<()>((key.as_str(), value.clone())).unwrap();
    }

    let stored: LuaValue = lua.load("return kv[...]").call(key.as_str()).unwrap();
    let expected = values.last().cloned().unwrap().into_lua(lua).unwrap();
    prop_assert!(lua_equal(&stored, &expected), "{:?} != {:?}", stored, expected);
  }

  #[test]
  fn delete_then_get_is_absent(key in key_strategy(), preset in any::<bool>()) {
    let fx = Fixture::new();
    let absent: bool = fx
      .ctx
      .lua()
      .load("local k, preset = ...; if preset then kv[k] = 'x' end; kv[k] = nil; return kv[k] == nil")
      .call((key, preset))
      .unwrap();
    prop_assert!(absent);
  }
}

fn lua_equal(a: &LuaValue, b: &LuaValue) -> bool {
  match (a, b) {
    (LuaValue::String(x), LuaValue::String(y)) => x.to_string_lossy() == y.to_string_lossy(),
    _ => a == b,
  }
}
