//! Bounded waits, teardown while blocked, and multiplexing.

use std::thread;
use std::time::{Duration, Instant};

use kvbridge_lib::store::protocol::MAX_VALUE_LEN;
use kvbridge_lib::{BindingState, BridgeError, BucketConfig, ScriptContext, StoreClient};
use serde_json::json;

use super::common::{Fixture, SilentServer, start_server, test_client, test_settings};

fn silent_context(op_timeout: Duration) -> (SilentServer, ScriptContext) {
  bind_to(SilentServer::start(), op_timeout)
}

fn bind_to(server: SilentServer, op_timeout: Duration) -> (SilentServer, ScriptContext) {
  let client = StoreClient::new(test_settings(op_timeout)).unwrap();
  let ctx = ScriptContext::new();
  ctx
    .bind_bucket(&client, &BucketConfig::new("kv", "default", &server.endpoint()))
    .unwrap();
  (server, ctx)
}

#[test]
fn unanswered_set_times_out_without_partial_write() -> Result<(), BridgeError> {
  let (_server, ctx) = silent_context(Duration::from_millis(200));

  let started = Instant::now();
  let (kind, op, key, absent): (String, String, String, bool) = ctx.eval(
    r#"
      local ok, err = pcall(function() kv.counter = 1 end)
      assert(not ok)
      return err.kind, err.op, err.key, kv.counter == nil
    "#,
  )?;
  let elapsed = started.elapsed();

  assert_eq!(kind, "Timeout");
  assert_eq!(op, "set");
  assert_eq!(key, "counter");
  assert!(absent);
  assert!(elapsed >= Duration::from_millis(200), "returned after {:?}", elapsed);
  assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
  assert_eq!(ctx.binding_state("kv"), Some(BindingState::Ready));
  Ok(())
}

#[test]
fn unanswered_get_times_out() -> Result<(), BridgeError> {
  let (_server, ctx) = bind_to(SilentServer::mute(), Duration::from_millis(150));

  let started = Instant::now();
  let (kind, op, key): (String, String, String) = ctx.eval(
    r#"
      local ok, err = pcall(function() return kv.profile end)
      assert(not ok)
      return err.kind, err.op, err.key
    "#,
  )?;

  assert_eq!((kind.as_str(), op.as_str(), key.as_str()), ("Timeout", "get", "profile"));
  assert!(started.elapsed() >= Duration::from_millis(150));
  assert_eq!(ctx.binding_state("kv"), Some(BindingState::Ready));
  Ok(())
}

#[test]
fn unanswered_delete_times_out() -> Result<(), BridgeError> {
  let (_server, ctx) = silent_context(Duration::from_millis(100));
  let kind: String = ctx.eval("local ok, err = pcall(function() kv.x = nil end); return err.kind")?;
  assert_eq!(kind, "Timeout");
  Ok(())
}

#[test]
fn closing_from_another_thread_abandons_the_wait() {
  let (_server, ctx) = silent_context(Duration::from_secs(60));
  let closer = ctx.closer();
  let supervisor = thread::spawn(move || {
    thread::sleep(Duration::from_millis(200));
    closer.close();
  });

  let started = Instant::now();
  let kind: String = ctx
    .eval("local ok, err = pcall(function() kv.slow = true end); return err.kind")
    .unwrap();
  supervisor.join().unwrap();

  assert_eq!(kind, "ContextClosing");
  assert!(started.elapsed() < Duration::from_secs(30));

  let err = ctx.exec("kv.after = 1", "=after").unwrap_err();
  assert!(matches!(err, BridgeError::ContextClosing));
}

#[test]
fn access_after_close_signal_fails_fast() {
  let fx = Fixture::new();
  let binding = fx.ctx.binding("kv").unwrap();

  fx.ctx.closer().close();
  assert!(matches!(binding.get("x"), Err(BridgeError::ContextClosing)));
  assert!(matches!(binding.set("x", json!(1)), Err(BridgeError::ContextClosing)));

  fx.ctx.close();
  assert_eq!(binding.state(), BindingState::Closed);
}

#[test]
fn outstanding_operations_are_multiplexed() {
  let fx = Fixture::new();
  let client = StoreClient::new(test_settings(Duration::from_secs(5))).unwrap();
  let connection = client.connect(&fx.server.endpoint(), "default", None).unwrap();
  let closing = fx.ctx.closer();

  let writes: Vec<_> = (0..16)
    .map(|i| connection.async_set(&format!("k{}", i), json!(i)))
    .collect();
  for handle in writes {
    connection.wait(handle, &closing).unwrap();
  }

  let reads: Vec<_> = (0..16).map(|i| connection.async_get(&format!("k{}", i))).collect();
  // Collect out of issue order
  for (i, handle) in reads.into_iter().enumerate().rev() {
    assert_eq!(connection.wait(handle, &closing).unwrap(), json!(i));
  }
  assert_eq!(connection.in_flight(), 0);

  let seen: i64 = fx.ctx.eval("return kv.k7").unwrap();
  assert_eq!(seen, 7);
}

#[test]
fn waiting_from_inside_a_runtime_works() {
  let fx = Fixture::new();
  let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(1).build().unwrap();
  let binding = fx.ctx.binding("kv").unwrap();

  let connection = fx
    .client
    .connect(&fx.server.endpoint(), "default", None)
    .unwrap();
  let closing = fx.ctx.closer();
  let value = runtime.block_on(async {
    let handle = connection.async_set("inside", json!("runtime"));
    connection.wait(handle, &closing)
  });
  assert!(value.is_ok());
  assert_eq!(binding.get("inside").unwrap(), Some(json!("runtime")));
}

#[test]
fn store_rejects_oversized_values() {
  let fx = Fixture::new();
  let connection = fx.client.connect(&fx.server.endpoint(), "default", None).unwrap();
  let closing = fx.ctx.closer();

  let handle = connection.async_set("blob", json!("x".repeat(MAX_VALUE_LEN)));
  match connection.wait(handle, &closing) {
    Err(BridgeError::Store { code, .. }) => assert_eq!(code, "value_too_large"),
    other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
  }

  let absent: bool = fx.ctx.eval("return kv.blob == nil").unwrap();
  assert!(absent);
}

#[test]
fn oversized_script_values_fail_before_sending() -> Result<(), BridgeError> {
  let fx = Fixture::new();
  let (kind, code): (String, String) = fx.ctx.eval(&format!(
    "local ok, err = pcall(function() kv.blob = string.rep('x', {}) end); return err.kind, err.code",
    MAX_VALUE_LEN
  ))?;
  assert_eq!(kind, "StoreError");
  assert_eq!(code, "value_too_large");
  Ok(())
}

#[test]
fn waiting_from_a_current_thread_runtime_works() {
  let fx = Fixture::new();
  let binding = fx.ctx.binding("kv").unwrap();
  let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

  let seen = runtime.block_on(async {
    binding.set("flavor", json!("current_thread")).unwrap();
    binding.get("flavor").unwrap()
  });
  assert_eq!(seen, Some(json!("current_thread")));
}

#[test]
fn context_can_be_built_and_dropped_inside_a_runtime() {
  let server = start_server(&["default"]);
  let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

  runtime.block_on(async {
    let ctx = ScriptContext::new();
    {
      let client = test_client();
      ctx
        .bind_bucket(&client, &BucketConfig::new("kv", "default", &server.endpoint()))
        .unwrap();
    }
    let n: i64 = ctx.eval("kv.n = 41; return kv.n + 1").unwrap();
    assert_eq!(n, 42);
    // Last owner of the client's I/O runtime goes away here
    drop(ctx);
  });
}
