//! SSH module - turns stored connection records into live shells
//!
//! This module provides the session broker using the russh library.
//!
//! # Features
//! - Password and private-key authentication from vault-encrypted secrets
//! - Bounded dial (handshake and authentication included)
//! - PTY allocation with a fixed initial geometry
//! - Pluggable host identity policy
//! - Connection probe without a shell

mod client;
mod config;
mod error;
mod host_key;
mod session;

pub use client::{ClientHandler, SshBroker};
pub use config::{AuthVariant, BrokerOptions, ConnectionRecord, PtyRequest, DEFAULT_CONNECT_TIMEOUT};
pub use error::TransportError;
pub use host_key::{fingerprint, HostKeyPolicy};
pub use session::{
    OutputStream, SessionBroker, ShellCommand, ShellControl, ShellSession, SshShell,
};
