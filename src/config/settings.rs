//! Process configuration from the environment

use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use super::storage::connections_file;
use super::vault::{Vault, VaultError};
use crate::ssh::{BrokerOptions, HostKeyPolicy, DEFAULT_CONNECT_TIMEOUT};

pub const ENV_ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";
pub const ENV_BIND_ADDR: &str = "BIND_ADDR";
pub const ENV_PORT: &str = "PORT";
pub const ENV_CONNECTIONS_FILE: &str = "CONNECTIONS_FILE";
pub const ENV_CONNECT_TIMEOUT: &str = "SSH_CONNECT_TIMEOUT_SECS";
pub const ENV_IDLE_TIMEOUT: &str = "SESSION_IDLE_TIMEOUT_SECS";
pub const ENV_HOST_KEY_FINGERPRINTS: &str = "SSH_HOST_KEY_FINGERPRINTS";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;

/// Configuration errors (fatal at startup)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set in environment")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to determine connections file location")]
    NoConnectionsFile,
}

/// Server configuration
pub struct ServerConfig {
    /// Vault key material; only read to build the [`Vault`]
    encryption_key: Zeroizing<String>,
    /// `host:port` to listen on
    pub listen_addr: String,
    pub connections_file: PathBuf,
    pub connect_timeout: Duration,
    /// `None` disables the idle bound
    pub idle_timeout: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
}

impl ServerConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let encryption_key = encryption_key(&lookup)?;

        let bind = get(ENV_BIND_ADDR).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let port = match get(ENV_PORT) {
            Some(raw) => parse_port(&raw)?,
            None => DEFAULT_PORT,
        };

        let connections_file = match get(ENV_CONNECTIONS_FILE) {
            Some(path) => PathBuf::from(path),
            None => connections_file().map_err(|_| ConfigError::NoConnectionsFile)?,
        };

        let connect_timeout = match get(ENV_CONNECT_TIMEOUT) {
            Some(raw) => parse_secs(ENV_CONNECT_TIMEOUT, &raw)?,
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        let idle_timeout = get(ENV_IDLE_TIMEOUT)
            .map(|raw| parse_secs(ENV_IDLE_TIMEOUT, &raw))
            .transpose()?;

        let host_key_policy = get(ENV_HOST_KEY_FINGERPRINTS)
            .map(|list| HostKeyPolicy::from_list(&list))
            .unwrap_or(HostKeyPolicy::AcceptAny);

        Ok(Self {
            encryption_key,
            listen_addr: format!("{}:{}", bind, port),
            connections_file,
            connect_timeout,
            idle_timeout,
            host_key_policy,
        })
    }

    /// Build the process vault from the configured key
    pub fn vault(&self) -> Result<Vault, VaultError> {
        Vault::new(&self.encryption_key)
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            connect_timeout: self.connect_timeout,
            host_key_policy: self.host_key_policy.clone(),
            ..Default::default()
        }
    }
}

/// Vault key material, as read by every subcommand
///
/// Only an empty value is rejected; surrounding whitespace is part of the key.
pub fn encryption_key<F>(lookup: F) -> Result<Zeroizing<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(ENV_ENCRYPTION_KEY)
        .filter(|key| !key.is_empty())
        .map(Zeroizing::new)
        .ok_or(ConfigError::Missing(ENV_ENCRYPTION_KEY))
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::Invalid {
            name: ENV_PORT,
            value: raw.to_string(),
            reason: "expected a port number between 1 and 65535".to_string(),
        }),
        Ok(port) => Ok(port),
    }
}

fn parse_secs(name: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw.to_string(),
            reason: "expected a positive number of seconds".to_string(),
        }),
    }
}
