//! Browser-facing bridge
//!
//! JSON frame protocol, the per-session relay engine and the WebSocket
//! server that feeds it.

pub mod protocol;
pub mod relay;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol::{Frame, FrameSink, FrameSource, ProtocolError};
pub use relay::{Relay, RelayConfig, RelayOutcome, RelayState, ShutdownReason};
pub use server::{BridgeServer, ChannelRequest, ConnectionResolver};
