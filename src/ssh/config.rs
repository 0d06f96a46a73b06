//! SSH Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::host_key::HostKeyPolicy;
use crate::config::vault::SecretBlob;

/// Default transport dial timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved connection target handed to the broker for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Which kind of secret `secret` holds
    #[serde(default, rename = "auth_type")]
    pub auth: AuthVariant,

    /// Encrypted password or private key
    pub secret: SecretBlob,
}

impl ConnectionRecord {
    /// `host:port` form used for dialing and in messages
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `user@host:port` form shown to the user while connecting
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Authentication variants supported by stored connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthVariant {
    /// The secret is a password
    #[default]
    Password,

    /// The secret is an unencrypted private key (OpenSSH or PEM)
    #[serde(alias = "key")]
    PrivateKey,
}

/// Terminal request sent when the shell channel opens
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    /// (opcode, value) terminal modes
    pub modes: Vec<(russh::Pty, u32)>,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            modes: vec![
                (russh::Pty::ECHO, 1),
                (russh::Pty::TTY_OP_ISPEED, 14400),
                (russh::Pty::TTY_OP_OSPEED, 14400),
            ],
        }
    }
}

/// Broker-wide settings shared by every session
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Bound on dial + handshake + authentication
    pub connect_timeout: Duration,
    /// Remote host identity policy
    pub host_key_policy: HostKeyPolicy,
    /// Initial terminal geometry and modes
    pub pty: PtyRequest,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            host_key_policy: HostKeyPolicy::AcceptAny,
            pty: PtyRequest::default(),
        }
    }
}

fn default_port() -> u16 {
    22
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_defaults() {
        let record: ConnectionRecord = serde_json::from_str(
            r#"{"host":"example.com","username":"root","secret":"AAAA"}"#,
        )
        .unwrap();

        assert_eq!(record.port, 22);
        assert_eq!(record.auth, AuthVariant::Password);
        assert_eq!(record.address(), "example.com:22");
        assert_eq!(record.target(), "root@example.com:22");
    }

    #[test]
    fn test_auth_variant_names() {
        let record: ConnectionRecord = serde_json::from_str(
            r#"{"host":"h","port":2222,"username":"u","auth_type":"key","secret":"AAAA"}"#,
        )
        .unwrap();
        assert_eq!(record.auth, AuthVariant::PrivateKey);

        let json = serde_json::to_value(AuthVariant::PrivateKey).unwrap();
        assert_eq!(json, "private_key");
    }

    #[test]
    fn test_port_overflow_rejected() {
        let too_big = serde_json::from_str::<ConnectionRecord>(
            r#"{"host":"h","port":70000,"username":"u","secret":"AAAA"}"#,
        );
        assert!(too_big.is_err());
    }

    #[test]
    fn test_default_pty() {
        let pty = PtyRequest::default();
        assert_eq!((pty.cols, pty.rows), (80, 24));
        assert_eq!(pty.term, "xterm-256color");
        assert_eq!(pty.modes.len(), 3);
    }
}
