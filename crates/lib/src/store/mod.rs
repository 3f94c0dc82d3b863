//! Remote key-value store: wire protocol, client adapter and reference server.
//!
//! - [`protocol`] - Newline-delimited JSON frames with correlation ids
//! - [`client`] - Multiplexed connections and the blocking `wait` primitive
//! - [`server`] - In-memory server speaking the same protocol

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{Connection, OperationHandle, StoreClient};
pub use server::{BackgroundServer, ServerOptions, StoreServer};
