//! In-memory reference store server.
//!
//! Hosts a fixed set of named stores and speaks the line protocol from
//! [`super::protocol`]. Used by `kvbridge serve` and by the test suites.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::protocol::{Command, MAX_VALUE_LEN, Request, Response, Status, codes, encode_line, validate_key};

/// Which stores the server hosts and how clients authenticate.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
  pub stores: Vec<String>,
  pub token: Option<String>,
}

impl ServerOptions {
  pub fn with_stores<I, S>(stores: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      stores: stores.into_iter().map(Into::into).collect(),
      token: None,
    }
  }

  pub fn token(mut self, token: &str) -> Self {
    self.token = Some(token.to_string());
    self
  }
}

type Documents = HashMap<String, Value>;

struct ServerState {
  stores: RwLock<HashMap<String, Documents>>,
  token: Option<String>,
}

impl ServerState {
  fn new(options: ServerOptions) -> Self {
    let stores = options.stores.into_iter().map(|name| (name, Documents::new())).collect();
    Self {
      stores: RwLock::new(stores),
      token: options.token,
    }
  }

  fn hello(&self, store: &str, token: Option<&str>) -> Status {
    if let Some(expected) = &self.token
      && token != Some(expected.as_str())
    {
      return Status::error(codes::AUTH_FAILED, "invalid or missing token");
    }
    let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
    if !stores.contains_key(store) {
      return Status::error(codes::UNKNOWN_STORE, format!("store '{}' does not exist", store));
    }
    Status::ok()
  }

  fn apply(&self, store: &str, command: Command) -> Status {
    if let Some(key) = command.key()
      && let Err(reason) = validate_key(key)
    {
      return Status::error(codes::INVALID_KEY, reason);
    }

    match command {
      Command::Hello { .. } => Status::error(codes::PROTOCOL, "connection already selected a store"),
      Command::Get { key } => {
        let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
        match stores.get(store).and_then(|docs| docs.get(&key)) {
          Some(value) => Status::Ok { value: value.clone() },
          None => Status::NotFound,
        }
      }
      Command::Set { key, value } => {
        let encoded_len = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(usize::MAX);
        if encoded_len > MAX_VALUE_LEN {
          return Status::error(
            codes::VALUE_TOO_LARGE,
            format!("value is {} bytes, limit is {}", encoded_len, MAX_VALUE_LEN),
          );
        }
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        match stores.get_mut(store) {
          Some(docs) => {
            docs.insert(key, value);
            Status::ok()
          }
          None => Status::error(codes::UNKNOWN_STORE, format!("store '{}' does not exist", store)),
        }
      }
      Command::Delete { key } => {
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        match stores.get_mut(store).and_then(|docs| docs.remove(&key)) {
          Some(_) => Status::ok(),
          None => Status::NotFound,
        }
      }
    }
  }
}

/// A bound, not yet serving, store server.
pub struct StoreServer {
  listener: TcpListener,
  state: Arc<ServerState>,
}

impl StoreServer {
  pub async fn bind(addr: &str, options: ServerOptions) -> io::Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self {
      listener,
      state: Arc::new(ServerState::new(options)),
    })
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Accept connections until `shutdown` resolves.
  pub async fn serve<S>(self, shutdown: S) -> io::Result<()>
  where
    S: Future<Output = ()>,
  {
    let addr = self.local_addr()?;
    info!(addr = %addr, "store server listening");
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!(addr = %addr, "store server shutting down");
          return Ok(());
        }
        accepted = self.listener.accept() => {
          let (stream, peer) = accepted?;
          let state = Arc::clone(&self.state);
          tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, state).await {
              debug!(peer = %peer, error = %e, "connection ended with error");
            }
          });
        }
      }
    }
  }
}

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>) -> io::Result<()> {
  stream.set_nodelay(true)?;
  let (read, mut write) = stream.into_split();
  let mut lines = BufReader::new(read).lines();
  let mut selected: Option<String> = None;

  while let Some(line) = lines.next_line().await? {
    let response = match serde_json::from_str::<Request>(&line) {
      Ok(Request { id, command }) => {
        let status = if let Some(store) = selected.as_deref() {
          state.apply(store, command)
        } else {
          let (status, store) = select_store(&state, command);
          selected = store;
          status
        };
        Response { id, status }
      }
      Err(e) => {
        warn!(error = %e, "rejecting malformed request frame");
        Response {
          id: 0,
          status: Status::error(codes::PROTOCOL, e.to_string()),
        }
      }
    };

    let frame = encode_line(&response).map_err(io::Error::other)?;
    write.write_all(&frame).await?;
  }

  Ok(())
}

/// Handle the first frame of a connection, which must be a successful hello.
fn select_store(state: &ServerState, command: Command) -> (Status, Option<String>) {
  match command {
    Command::Hello { store, token } => {
      let status = state.hello(&store, token.as_deref());
      if matches!(status, Status::Ok { .. }) {
        debug!(store = %store, "client selected store");
        (status, Some(store))
      } else {
        (status, None)
      }
    }
    _ => (Status::error(codes::PROTOCOL, "first frame must be hello"), None),
  }
}

/// A store server running on its own runtime; stops when dropped.
pub struct BackgroundServer {
  addr: SocketAddr,
  shutdown: Option<oneshot::Sender<()>>,
  runtime: Option<Runtime>,
}

impl BackgroundServer {
  pub fn start(listen: &str, options: ServerOptions) -> io::Result<Self> {
    let runtime = Builder::new_multi_thread()
      .worker_threads(1)
      .thread_name("kvbridge-store")
      .enable_all()
      .build()?;

    let server = runtime.block_on(StoreServer::bind(listen, options))?;
    let addr = server.local_addr()?;
    let (shutdown, stop) = oneshot::channel::<()>();
    runtime.spawn(async move {
      let stopped = async {
        let _ = stop.await;
      };
      if let Err(e) = server.serve(stopped).await {
        warn!(error = %e, "background store server failed");
      }
    });

    Ok(Self {
      addr,
      shutdown: Some(shutdown),
      runtime: Some(runtime),
    })
  }

  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  /// `host:port` string suitable for a bucket endpoint.
  pub fn endpoint(&self) -> String {
    self.addr.to_string()
  }
}

impl Drop for BackgroundServer {
  fn drop(&mut self) {
    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(());
    }
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_timeout(Duration::from_secs(1));
    }
  }
}
