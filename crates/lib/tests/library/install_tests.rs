//! Binding initialization and multi-bucket installation.

use std::io::Write;

use kvbridge_lib::{
  BackgroundServer, BindingState, BridgeConfig, BridgeError, BucketConfig, InstallError, ScriptContext, ServerOptions,
  install_buckets, start_context,
};

use super::common::{Fixture, start_server, test_client, unreachable_endpoint};

mod bind_bucket {
  use super::*;

  #[test]
  fn binding_becomes_ready() {
    let fx = Fixture::new();
    let binding = fx.ctx.binding("kv").unwrap();
    assert_eq!(binding.state(), BindingState::Ready);
    assert_eq!(binding.store_name(), "default");
    assert_eq!(binding.endpoint(), fx.server.endpoint());
  }

  #[test]
  fn duplicate_alias_keeps_first_binding() -> Result<(), BridgeError> {
    let fx = Fixture::new();
    let err = fx.ctx.bind_bucket(&fx.client, &fx.bucket("kv", "default")).unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateAlias { ref alias } if alias == "kv"));

    assert_eq!(fx.ctx.binding_state("kv"), Some(BindingState::Ready));
    let works: bool = fx.ctx.eval("kv.still = 'here'; return kv.still == 'here'")?;
    assert!(works);
    Ok(())
  }

  #[test]
  fn builtin_globals_cannot_be_shadowed() {
    let fx = Fixture::new();
    for alias in ["print", "string", "_G"] {
      let err = fx.ctx.bind_bucket(&fx.client, &fx.bucket(alias, "default")).unwrap_err();
      assert!(matches!(err, BridgeError::DuplicateAlias { .. }), "{}: {}", alias, err);
    }
  }

  #[test]
  fn invalid_alias_is_rejected_before_connecting() {
    let ctx = ScriptContext::new();
    let bucket = BucketConfig::new("not-an-identifier", "default", &unreachable_endpoint());
    let err = ctx.bind_bucket(&test_client(), &bucket).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidAlias { .. }), "unexpected error: {}", err);
    assert!(ctx.aliases().is_empty());
  }

  #[test]
  fn unreachable_endpoint_fails_binding() {
    let ctx = ScriptContext::new();
    let bucket = BucketConfig::new("kv", "default", &unreachable_endpoint());
    let err = ctx.bind_bucket(&test_client(), &bucket).unwrap_err();
    assert!(matches!(err, BridgeError::ConnectFailed { .. }), "unexpected error: {}", err);
    assert_eq!(ctx.binding_state("kv"), None);
    let defined: bool = ctx.eval("return kv ~= nil").unwrap();
    assert!(!defined);
  }

  #[test]
  fn unknown_store_fails_binding() {
    let server = start_server(&["default"]);
    let ctx = ScriptContext::new();
    let bucket = BucketConfig::new("kv", "nope", &server.endpoint());
    let err = ctx.bind_bucket(&test_client(), &bucket).unwrap_err();
    match err {
      BridgeError::ConnectFailed { reason, .. } => assert!(reason.contains("unknown_store"), "{}", reason),
      other => panic!("unexpected error: {}", other),
    }
  }

  #[test]
  fn token_is_checked_during_handshake() {
    let server = BackgroundServer::start("127.0.0.1:0", ServerOptions::with_stores(["default"]).token("s3cret")).unwrap();
    let ctx = ScriptContext::new();
    let client = test_client();

    let anonymous = BucketConfig::new("anon", "default", &server.endpoint());
    let err = ctx.bind_bucket(&client, &anonymous).unwrap_err();
    assert!(matches!(err, BridgeError::ConnectFailed { ref reason, .. } if reason.contains("auth_failed")));

    let authed = BucketConfig::new("kv", "default", &server.endpoint()).with_token("s3cret");
    assert!(ctx.bind_bucket(&client, &authed).is_ok());
  }

  #[test]
  fn close_detaches_in_reverse_order() {
    let fx = Fixture::with_aliases(&[("first", "a"), ("second", "b")]);
    let first = fx.ctx.binding("first").unwrap();
    let second = fx.ctx.binding("second").unwrap();

    fx.ctx.close();
    assert_eq!(first.state(), BindingState::Closed);
    assert_eq!(second.state(), BindingState::Closed);
    assert!(fx.ctx.aliases().is_empty());
    assert!(fx.ctx.lua().globals().raw_get::<mlua::Value>("first").unwrap().is_nil());
  }
}

mod installer {
  use super::*;

  #[test]
  fn installs_in_declaration_order() {
    let server = start_server(&["users", "cache"]);
    let ctx = ScriptContext::new();
    let buckets = [
      BucketConfig::new("users", "users", &server.endpoint()),
      BucketConfig::new("cache", "cache", &server.endpoint()),
    ];

    let installed = install_buckets(&ctx, &test_client(), &buckets).unwrap();
    let aliases: Vec<&str> = installed.iter().map(|b| b.alias()).collect();
    assert_eq!(aliases, ["users", "cache"]);
    assert_eq!(ctx.aliases(), ["users", "cache"]);
  }

  #[test]
  fn first_failure_aborts_and_rolls_back() {
    let server = start_server(&["a", "c"]);
    let ctx = ScriptContext::new();
    let buckets = [
      BucketConfig::new("a", "a", &server.endpoint()),
      BucketConfig::new("b", "b", &unreachable_endpoint()),
      BucketConfig::new("c", "c", &server.endpoint()),
    ];

    let err = install_buckets(&ctx, &test_client(), &buckets).unwrap_err();
    match &err {
      InstallError::Binding { alias, index, source } => {
        assert_eq!(alias, "b");
        assert_eq!(*index, 1);
        assert!(matches!(source, BridgeError::ConnectFailed { .. }));
      }
      other => panic!("unexpected error: {}", other),
    }

    assert!(ctx.aliases().is_empty(), "no partial environment");
    let (a, c): (bool, bool) = ctx.eval("return a == nil, c == nil").unwrap();
    assert!(a && c);
  }

  #[test]
  fn start_context_from_config_file() {
    let server = start_server(&["default"]);
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
      file,
      r#"
[settings]
op_timeout = "2s"

[[buckets]]
alias = "kv"
store_name = "default"
endpoint = "{}"
"#,
      server.endpoint()
    )
    .unwrap();

    let config = BridgeConfig::from_path(file.path()).unwrap();
    let ctx = start_context(&config).unwrap();
    let value: String = ctx.eval("kv.greeting = 'hi'; return kv.greeting").unwrap();
    assert_eq!(value, "hi");
  }

  #[test]
  fn start_context_reports_failed_bucket() {
    let mut config = BridgeConfig::default();
    config.buckets.push(BucketConfig::new("kv", "default", &unreachable_endpoint()));

    let err = start_context(&config).err().unwrap();
    assert!(matches!(err.bridge_error(), BridgeError::ConnectFailed { .. }));
    assert!(err.to_string().contains("'kv'"), "unexpected message: {}", err);
  }
}

mod connect_retries {
  use std::thread;
  use std::time::{Duration, Instant};

  use kvbridge_lib::{Settings, StoreClient};

  use super::*;

  fn retrying_client(retries: u32, interval: Duration) -> StoreClient {
    StoreClient::new(Settings {
      connect_timeout: Duration::from_secs(2),
      connect_retries: retries,
      retry_interval: interval,
      ..Settings::default()
    })
    .unwrap()
  }

  #[test]
  fn transport_failures_retry_until_the_store_appears() {
    let endpoint = unreachable_endpoint();
    let listen = endpoint.clone();
    let late_server = thread::spawn(move || {
      thread::sleep(Duration::from_millis(300));
      BackgroundServer::start(&listen, ServerOptions::with_stores(["default"])).unwrap()
    });

    let client = retrying_client(20, Duration::from_millis(100));
    let connection = client.connect(&endpoint, "default", None);
    let _server = late_server.join().unwrap();
    assert!(connection.is_ok(), "connect should succeed once the store is up");
  }

  #[test]
  fn transport_failures_give_up_after_the_configured_retries() {
    let endpoint = unreachable_endpoint();
    let client = retrying_client(2, Duration::from_millis(150));

    let started = Instant::now();
    let err = client.connect(&endpoint, "default", None).err().unwrap();
    assert!(matches!(err, BridgeError::ConnectFailed { .. }));
    assert!(started.elapsed() >= Duration::from_millis(300), "returned after {:?}", started.elapsed());
  }

  #[test]
  fn store_rejections_are_never_retried() {
    let server = BackgroundServer::start("127.0.0.1:0", ServerOptions::with_stores(["default"]).token("s3cret")).unwrap();
    let client = retrying_client(5, Duration::from_secs(3));

    let started = Instant::now();
    let unknown = client.connect(&server.endpoint(), "nope", Some("s3cret")).err().unwrap();
    let denied = client.connect(&server.endpoint(), "default", Some("wrong")).err().unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(unknown, BridgeError::ConnectFailed { ref reason, .. } if reason.contains("unknown_store")));
    assert!(matches!(denied, BridgeError::ConnectFailed { ref reason, .. } if reason.contains("auth_failed")));
    assert!(elapsed < Duration::from_secs(3), "a rejection was retried: took {:?}", elapsed);
  }
}
