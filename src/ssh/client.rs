//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::{Channel, ChannelMsg};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::config::{AuthVariant, BrokerOptions, ConnectionRecord};
use super::error::TransportError;
use super::host_key::{fingerprint, HostKeyPolicy};
use super::session::{spawn_shell_owner, SessionBroker, ShellSession, SshShell};
use crate::config::vault::Vault;

/// Decrypted credential, alive only until authentication returns
enum Credential {
    Password(Zeroizing<String>),
    Key(Arc<PrivateKey>),
}

/// Opens PTY-backed shells over SSH for stored connections
pub struct SshBroker {
    vault: Arc<Vault>,
    options: BrokerOptions,
}

impl SshBroker {
    pub fn new(vault: Arc<Vault>, options: BrokerOptions) -> Self {
        Self { vault, options }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Dial and authenticate, then disconnect without opening a shell
    pub async fn probe(&self, record: &ConnectionRecord) -> Result<(), TransportError> {
        let handle = self.connect(record).await?;
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "Probe complete", "en")
            .await
        {
            debug!("Disconnect after probe of {} failed: {}", record.address(), e);
        }
        info!("Probe of {} succeeded", record.address());
        Ok(())
    }

    fn resolve_credential(&self, record: &ConnectionRecord) -> Result<Credential, TransportError> {
        let secret = self
            .vault
            .decrypt(&record.secret)
            .map_err(|e| TransportError::CredentialError(e.to_string()))?;

        match record.auth {
            AuthVariant::Password => Ok(Credential::Password(secret)),
            AuthVariant::PrivateKey => {
                let key = russh::keys::decode_secret_key(&secret, None)
                    .map_err(|e| TransportError::KeyParseError(e.to_string()))?;
                Ok(Credential::Key(Arc::new(key)))
            }
        }
    }

    /// Dial `host:port`, complete the handshake and authenticate, all within
    /// the connect timeout
    async fn connect(
        &self,
        record: &ConnectionRecord,
    ) -> Result<Handle<ClientHandler>, TransportError> {
        let addr = record.address();

        if record.port == 0 {
            return Err(TransportError::ConnectError(format!(
                "failed to connect to {}: invalid port",
                addr
            )));
        }

        let credential = self.resolve_credential(record)?;

        info!("Connecting to SSH server at {}", addr);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            record.host.clone(),
            record.port,
            self.options.host_key_policy.clone(),
        );

        let dial = async {
            let mut handle =
                client::connect(Arc::new(ssh_config), (record.host.as_str(), record.port), handler)
                    .await
                    .map_err(|e| {
                        TransportError::ConnectError(format!("failed to connect to {}: {}", addr, e))
                    })?;

            debug!("SSH handshake completed with {}", addr);

            let result = match credential {
                Credential::Password(password) => {
                    handle
                        .authenticate_password(record.username.as_str(), password.as_str())
                        .await
                }
                Credential::Key(key) => {
                    handle
                        .authenticate_publickey(
                            record.username.as_str(),
                            PrivateKeyWithHashAlg::new(key, None),
                        )
                        .await
                }
            }
            .map_err(|e| {
                TransportError::ConnectError(format!("failed to authenticate to {}: {}", addr, e))
            })?;

            if !result.success() {
                return Err(TransportError::ConnectError(format!(
                    "failed to connect to {}: authentication rejected by server",
                    addr
                )));
            }

            Ok(handle)
        };

        let handle = tokio::time::timeout(self.options.connect_timeout, dial)
            .await
            .map_err(|_| {
                TransportError::ConnectError(format!(
                    "failed to connect to {}: timed out after {}s",
                    addr,
                    self.options.connect_timeout.as_secs_f32()
                ))
            })??;

        info!("SSH authentication successful for {}", addr);
        Ok(handle)
    }

    /// Open a session channel, request a PTY and start the shell
    async fn request_shell(
        &self,
        handle: &Handle<ClientHandler>,
    ) -> Result<Channel<Msg>, TransportError> {
        let pty = &self.options.pty;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::ShellError(format!("Failed to create session: {}", e)))?;

        channel
            .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &pty.modes)
            .await
            .map_err(|e| TransportError::ShellError(format!("Failed to request PTY: {}", e)))?;
        await_reply(&mut channel, "PTY").await?;

        debug!("PTY allocated, requesting shell");

        channel
            .request_shell(true)
            .await
            .map_err(|e| TransportError::ShellError(format!("Failed to start shell: {}", e)))?;
        await_reply(&mut channel, "shell").await?;

        Ok(channel)
    }
}

/// Wait for the server's answer to a `want_reply` channel request
async fn await_reply(channel: &mut Channel<Msg>, what: &str) -> Result<(), TransportError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(TransportError::ShellError(format!(
                    "{} request rejected by server",
                    what
                )))
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(TransportError::ShellError(format!(
                    "channel closed during {} request",
                    what
                )))
            }
            Some(_) => {}
        }
    }
}

#[async_trait]
impl SessionBroker for SshBroker {
    type Control = SshShell;

    async fn open(
        &self,
        record: &ConnectionRecord,
    ) -> Result<ShellSession<SshShell>, TransportError> {
        let handle = self.connect(record).await?;

        let shell = tokio::time::timeout(self.options.connect_timeout, self.request_shell(&handle))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::ShellError(
                    "timed out waiting for the shell to start".to_string(),
                ))
            });

        let channel = match shell {
            Ok(channel) => channel,
            Err(e) => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "Shell unavailable", "en")
                    .await;
                return Err(e);
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Interactive shell started for session {} on {}",
            session_id,
            record.address()
        );

        Ok(spawn_shell_owner(handle, channel, session_id))
    }
}

/// Client handler for russh callbacks
///
/// Applies the configured [`HostKeyPolicy`] to the server's key.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl client::Handler for ClientHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = fingerprint(server_public_key);

        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                debug!(
                    "Host key for {}:{} accepted without verification (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                Ok(true)
            }
            policy if policy.allows(&fingerprint) => {
                info!(
                    "Host key verified for {}:{} (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                Ok(true)
            }
            _ => {
                warn!(
                    "Host key for {}:{} is not pinned (fingerprint: {}), rejecting",
                    self.host, self.port, fingerprint
                );
                Err(TransportError::ConnectError(format!(
                    "host key verification failed for {}:{}: fingerprint {} is not trusted",
                    self.host, self.port, fingerprint
                )))
            }
        }
    }
}
