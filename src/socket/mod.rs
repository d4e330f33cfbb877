//! Socket modules.
//!
//! - `transport`: transport capability trait and the websocket transport.
//! - `session`: frame codec and lifecycle event translation over a transport.

/// Session wrapper emitting decoded frames and lifecycle events.
pub mod session;
/// Transport trait, callback sink, and websocket implementation.
pub mod transport;
