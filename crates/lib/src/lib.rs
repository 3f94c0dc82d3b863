//! kvbridge-lib: synchronous property access to a remote key-value store.
//!
//! Scripts running in a [`ScriptContext`] see each configured bucket as a global
//! proxy object. Reading, assigning and clearing its fields become blocking
//! get/set/delete operations against the store:
//!
//! ```lua
//! kv.greeting = "hello"   -- set
//! print(kv.greeting)      -- get
//! kv.greeting = nil       -- delete
//! ```
//!
//! - [`store`]: wire protocol, multiplexed client connections and a reference server
//! - [`bucket`]: per-alias binding lifecycle
//! - [`context`]: the owning Lua state, globals and teardown
//! - [`install`]: fail-fast installation of every configured bucket
//! - [`lua`]: proxy shape, interceptors and value marshaling

pub mod bucket;
pub mod config;
pub mod context;
pub mod error;
pub mod install;
pub mod lua;
pub mod signal;
pub mod store;

pub use bucket::{BindingState, BucketBinding};
pub use config::{BridgeConfig, BucketConfig, ConfigError, Settings};
pub use context::ScriptContext;
pub use error::{BridgeError, ErrorKind, Op};
pub use install::{InstallError, install_buckets, start_context};
pub use signal::ClosingSignal;
pub use store::{BackgroundServer, ServerOptions, StoreClient, StoreServer};
