//! SSH Error types

use thiserror::Error;

/// Failures while standing up a shell session
///
/// Every variant is session-scoped and reported once to the external channel.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Dial, handshake, host identity or authentication failure
    #[error("{0}")]
    ConnectError(String),

    /// The stored secret could not be decrypted
    #[error("failed to decrypt credentials: {0}")]
    CredentialError(String),

    /// The decrypted private key could not be parsed
    #[error("failed to parse private key: {0}")]
    KeyParseError(String),

    /// Session channel, PTY or shell request failure
    #[error("{0}")]
    ShellError(String),
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        TransportError::ConnectError(err.to_string())
    }
}
