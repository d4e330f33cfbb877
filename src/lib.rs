//! Client runtime for the DDP publish/subscribe and RPC protocol.
//!
//! The crate is organized bottom-up:
//! - `channel`: synchronous named event channel.
//! - `ejson`: extensible JSON values, custom type registry and text codec.
//! - `proto`: typed DDP messages.
//! - `socket`: transport trait, websocket transport and socket sessions.
//! - `store`: action pipeline, admission control, call queue, collection
//!   merge engine, auth state machine.
//! - `config` / `client`: configuration and the async driver.
//! - `retry`: retry and timeout utilities used when connecting.

/// Named synchronous event channel.
pub mod channel;
/// Async driver pumping transports and timers into the store.
pub mod client;
/// Client configuration and defaults.
pub mod config;
/// Extensible JSON codec.
pub mod ejson;
/// DDP message types.
pub mod proto;
/// Retry and timeout helpers.
pub mod retry;
/// Transports and socket sessions.
pub mod socket;
/// Synchronous dispatch core and state machines.
pub mod store;

pub use client::DdpClient;
pub use config::ClientConfig;
pub use ejson::{Ejson, TypeRegistry};
pub use store::{Action, ActionKind, CallOptions, State, Store, StoreError};
