//! Store client adapter.
//!
//! A [`StoreClient`] owns a dedicated I/O runtime. Each [`Connection`] runs a reader
//! and a writer task on that runtime and multiplexes any number of outstanding
//! operations over one TCP stream, matching replies to callers by correlation id.
//!
//! The calling (script) thread issues `async_*` operations and then blocks in
//! [`Connection::wait`]. The wait only parks on a future; the I/O threads keep
//! driving the socket, so the caller never has to pump anything itself.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{Command, HELLO_ID, Request, Response, Status, codes, encode_line};
use crate::config::Settings;
use crate::error::{BridgeError, Op};
use crate::signal::ClosingSignal;

/// Run `future` to completion on `handle`, blocking the current thread.
///
/// From a plain thread this parks on the I/O runtime directly. Inside a
/// multi-threaded runtime the worker is handed off with `block_in_place`. A
/// current-thread runtime cannot give up its only thread, so the wait moves to a
/// scoped helper thread instead.
pub(crate) fn block_on_io<F>(handle: &Handle, future: F) -> F::Output
where
  F: Future + Send,
  F::Output: Send,
{
  match Handle::try_current() {
    Err(_) => handle.block_on(future),
    Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => std::thread::scope(|scope| {
      match scope.spawn(|| handle.block_on(future)).join() {
        Ok(output) => output,
        Err(panic) => std::panic::resume_unwind(panic),
      }
    }),
    Ok(_) => tokio::task::block_in_place(|| handle.block_on(future)),
  }
}

/// The I/O runtime shared by a client and its connections.
///
/// Shut down in the background on drop, so the last owner may go away inside
/// async code without tokio refusing to block.
struct IoRuntime {
  runtime: Option<Runtime>,
  handle: Handle,
}

impl IoRuntime {
  fn new(threads: usize) -> std::io::Result<Self> {
    let runtime = Builder::new_multi_thread()
      .worker_threads(threads.max(1))
      .thread_name("kvbridge-io")
      .enable_all()
      .build()?;
    Ok(Self {
      handle: runtime.handle().clone(),
      runtime: Some(runtime),
    })
  }

  fn handle(&self) -> &Handle {
    &self.handle
  }
}

impl Drop for IoRuntime {
  fn drop(&mut self) {
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_background();
    }
  }
}

/// Factory for store connections, owning the I/O runtime they run on.
pub struct StoreClient {
  runtime: Arc<IoRuntime>,
  settings: Settings,
}

impl StoreClient {
  pub fn new(settings: Settings) -> Result<Self, BridgeError> {
    Ok(Self {
      runtime: Arc::new(IoRuntime::new(settings.io_threads)?),
      settings,
    })
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  /// Open a connection to `store_name` at `endpoint`, blocking until the handshake completes.
  ///
  /// Transport failures are retried `connect_retries` times with a fixed backoff.
  /// Rejections by the store (unknown store, bad token) are never retried.
  pub fn connect(&self, endpoint: &str, store_name: &str, token: Option<&str>) -> Result<Connection, BridgeError> {
    let mut attempt = 0;
    loop {
      let result = block_on_io(
        self.runtime.handle(),
        handshake(endpoint, store_name, token, self.settings.connect_timeout),
      );

      match result {
        Ok((lines, writer)) => {
          info!(endpoint = %endpoint, store = %store_name, "connected to store");
          return Ok(Connection::start(
            Arc::clone(&self.runtime),
            endpoint,
            store_name,
            self.settings.op_timeout,
            lines,
            writer,
          ));
        }
        Err(HandshakeError::Transport(reason)) if attempt < self.settings.connect_retries => {
          attempt += 1;
          warn!(
            endpoint = %endpoint,
            store = %store_name,
            attempt,
            error = %reason,
            "connect failed, retrying"
          );
          std::thread::sleep(self.settings.retry_interval);
        }
        Err(HandshakeError::Transport(reason) | HandshakeError::Rejected(reason)) => {
          return Err(BridgeError::ConnectFailed {
            endpoint: endpoint.to_string(),
            store: store_name.to_string(),
            reason,
          });
        }
      }
    }
  }
}

enum HandshakeError {
  Transport(String),
  Rejected(String),
}

type ReplyLines = Lines<BufReader<OwnedReadHalf>>;

async fn handshake(
  endpoint: &str,
  store_name: &str,
  token: Option<&str>,
  timeout: Duration,
) -> Result<(ReplyLines, OwnedWriteHalf), HandshakeError> {
  let attempt = async {
    let stream = TcpStream::connect(endpoint)
      .await
      .map_err(|e| HandshakeError::Transport(e.to_string()))?;
    stream
      .set_nodelay(true)
      .map_err(|e| HandshakeError::Transport(e.to_string()))?;
    let (read, mut write) = stream.into_split();

    let hello = Request {
      id: HELLO_ID,
      command: Command::Hello {
        store: store_name.to_string(),
        token: token.map(str::to_string),
      },
    };
    let line = encode_line(&hello).map_err(|e| HandshakeError::Transport(e.to_string()))?;
    write
      .write_all(&line)
      .await
      .map_err(|e| HandshakeError::Transport(e.to_string()))?;

    let mut lines = BufReader::new(read).lines();
    let reply = lines
      .next_line()
      .await
      .map_err(|e| HandshakeError::Transport(e.to_string()))?
      .ok_or_else(|| HandshakeError::Transport("connection closed during handshake".to_string()))?;
    let response: Response =
      serde_json::from_str(&reply).map_err(|e| HandshakeError::Rejected(format!("malformed handshake reply: {}", e)))?;

    match response.status {
      Status::Ok { .. } => Ok((lines, write)),
      Status::NotFound => Err(HandshakeError::Rejected(format!("store '{}' not found", store_name))),
      Status::Error { code, message } => Err(HandshakeError::Rejected(format!("{}: {}", code, message))),
    }
  };

  tokio::time::timeout(timeout, attempt)
    .await
    .unwrap_or_else(|_| Err(HandshakeError::Transport(format!("timed out after {:?}", timeout))))
}

/// Operations awaiting a reply, keyed by correlation id.
#[derive(Default)]
struct PendingTable {
  waiters: Mutex<HashMap<u64, oneshot::Sender<Status>>>,
  lost: AtomicBool,
}

impl PendingTable {
  fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Status>>> {
    self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register a waiter. Returns false (dropping the sender) once the connection is lost.
  fn insert(&self, id: u64, waiter: oneshot::Sender<Status>) -> bool {
    let mut waiters = self.lock();
    if self.lost.load(Ordering::Acquire) {
      return false;
    }
    waiters.insert(id, waiter);
    true
  }

  fn complete(&self, id: u64, status: Status) -> bool {
    match self.lock().remove(&id) {
      Some(waiter) => waiter.send(status).is_ok(),
      None => false,
    }
  }

  fn abandon(&self, id: u64) {
    self.lock().remove(&id);
  }

  /// Mark the connection lost and drop every waiter, failing their waits.
  fn fail_all(&self) {
    let mut waiters = self.lock();
    self.lost.store(true, Ordering::Release);
    waiters.clear();
  }

  fn len(&self) -> usize {
    self.lock().len()
  }
}

/// An issued store operation whose reply has not been collected yet.
#[derive(Debug)]
pub struct OperationHandle {
  id: u64,
  op: Op,
  key: String,
  reply: oneshot::Receiver<Status>,
}

impl OperationHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn op(&self) -> Op {
    self.op
  }

  pub fn key(&self) -> &str {
    &self.key
  }
}

enum Outcome {
  Reply(Status),
  Disconnected,
  TimedOut,
  Closing,
}

/// One multiplexed connection to a store.
pub struct Connection {
  endpoint: String,
  store_name: String,
  runtime: Arc<IoRuntime>,
  op_timeout: Duration,
  next_id: AtomicU64,
  pending: Arc<PendingTable>,
  outbound: mpsc::UnboundedSender<Request>,
  tasks: Vec<JoinHandle<()>>,
}

impl Connection {
  fn start(
    runtime: Arc<IoRuntime>,
    endpoint: &str,
    store_name: &str,
    op_timeout: Duration,
    lines: ReplyLines,
    writer: OwnedWriteHalf,
  ) -> Self {
    let pending = Arc::new(PendingTable::default());
    let (outbound, requests) = mpsc::unbounded_channel();

    let reader = runtime.handle().spawn(read_replies(lines, Arc::clone(&pending), endpoint.to_string()));
    let writer = runtime.handle().spawn(write_requests(writer, requests, Arc::clone(&pending)));

    Self {
      endpoint: endpoint.to_string(),
      store_name: store_name.to_string(),
      runtime,
      op_timeout,
      next_id: AtomicU64::new(HELLO_ID + 1),
      pending,
      outbound,
      tasks: vec![reader, writer],
    }
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  pub fn store_name(&self) -> &str {
    &self.store_name
  }

  pub fn op_timeout(&self) -> Duration {
    self.op_timeout
  }

  /// Number of issued operations still waiting for a reply.
  pub fn in_flight(&self) -> usize {
    self.pending.len()
  }

  pub fn async_get(&self, key: &str) -> OperationHandle {
    self.submit(Op::Get, Command::Get { key: key.to_string() })
  }

  pub fn async_set(&self, key: &str, value: Value) -> OperationHandle {
    self.submit(
      Op::Set,
      Command::Set {
        key: key.to_string(),
        value,
      },
    )
  }

  pub fn async_delete(&self, key: &str) -> OperationHandle {
    self.submit(Op::Delete, Command::Delete { key: key.to_string() })
  }

  fn submit(&self, op: Op, command: Command) -> OperationHandle {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let key = command.key().unwrap_or_default().to_string();
    let (waiter, reply) = oneshot::channel();

    if self.pending.insert(id, waiter) && self.outbound.send(Request { id, command }).is_err() {
      self.pending.abandon(id);
    }
    debug!(store = %self.store_name, id, op = %op, key = %key, "issued store operation");

    OperationHandle { id, op, key, reply }
  }

  /// Block until `handle` resolves, the op timeout elapses, or `closing` is raised.
  ///
  /// `Ok` carries the stored value for gets and `Value::Null` otherwise. A missing key
  /// is reported as [`BridgeError::KeyNotFound`]; callers decide whether that is an error.
  /// Timed-out and abandoned operations are dropped locally; the store may still apply them.
  pub fn wait(&self, handle: OperationHandle, closing: &ClosingSignal) -> Result<Value, BridgeError> {
    let OperationHandle { id, op, key, reply } = handle;
    let mut closing_rx = closing.subscribe();
    let timeout = self.op_timeout;

    let outcome = block_on_io(self.runtime.handle(), async move {
      tokio::select! {
        biased;
        _ = closing_rx.wait_for(|closing| *closing) => Outcome::Closing,
        reply = tokio::time::timeout(timeout, reply) => match reply {
          Ok(Ok(status)) => Outcome::Reply(status),
          Ok(Err(_)) => Outcome::Disconnected,
          Err(_) => Outcome::TimedOut,
        },
      }
    });

    match outcome {
      Outcome::Reply(Status::Ok { value }) => Ok(value),
      Outcome::Reply(Status::NotFound) => Err(BridgeError::KeyNotFound { key }),
      Outcome::Reply(Status::Error { code, message }) => Err(BridgeError::Store { code, message }),
      Outcome::Disconnected => Err(BridgeError::store(
        codes::DISCONNECTED,
        format!("connection to {} lost", self.endpoint),
      )),
      Outcome::TimedOut => {
        self.pending.abandon(id);
        warn!(store = %self.store_name, id, op = %op, key = %key, ?timeout, "store operation timed out");
        Err(BridgeError::Timeout { op, key, after: timeout })
      }
      Outcome::Closing => {
        self.pending.abandon(id);
        debug!(store = %self.store_name, id, op = %op, key = %key, "wait abandoned, context closing");
        Err(BridgeError::ContextClosing)
      }
    }
  }

  /// Close the connection. Outstanding operations fail as disconnected.
  pub fn close(mut self) {
    self.shutdown();
    info!(endpoint = %self.endpoint, store = %self.store_name, "store connection closed");
  }

  fn shutdown(&mut self) {
    self.pending.fail_all();
    for task in self.tasks.drain(..) {
      task.abort();
    }
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.shutdown();
  }
}

async fn read_replies(mut lines: ReplyLines, pending: Arc<PendingTable>, endpoint: String) {
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => match serde_json::from_str::<Response>(&line) {
        Ok(response) => {
          let id = response.id;
          if !pending.complete(id, response.status) {
            debug!(endpoint = %endpoint, id, "discarding reply for abandoned operation");
          }
        }
        Err(e) => warn!(endpoint = %endpoint, error = %e, "malformed reply frame"),
      },
      Ok(None) => {
        debug!(endpoint = %endpoint, "store closed the connection");
        break;
      }
      Err(e) => {
        warn!(endpoint = %endpoint, error = %e, "connection read failed");
        break;
      }
    }
  }
  pending.fail_all();
}

async fn write_requests(
  mut writer: OwnedWriteHalf,
  mut requests: mpsc::UnboundedReceiver<Request>,
  pending: Arc<PendingTable>,
) {
  while let Some(request) = requests.recv().await {
    let line = match encode_line(&request) {
      Ok(line) => line,
      Err(e) => {
        pending.complete(request.id, Status::error(codes::PROTOCOL, e.to_string()));
        continue;
      }
    };
    if let Err(e) = writer.write_all(&line).await {
      warn!(id = request.id, error = %e, "connection write failed");
      pending.complete(request.id, Status::error(codes::DISCONNECTED, e.to_string()));
      break;
    }
  }
  pending.fail_all();
}
