//! Shellgate - browser-facing SSH shell relay
//!
//! Opens interactive remote shells for stored connections and bridges them
//! to a JSON-framed WebSocket channel. Connection secrets stay encrypted at
//! rest and are decrypted only for the duration of authentication.

pub mod bridge;
pub mod config;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use bridge::{BridgeServer, Frame, Relay, RelayConfig, RelayOutcome};
pub use config::{ConnectionStore, ServerConfig, Vault};
pub use ssh::{SessionBroker, SshBroker};

/// Initialize logging (`RUST_LOG`, default `info`)
///
/// Logs go to stderr so `shellgate encrypt` output stays clean.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
