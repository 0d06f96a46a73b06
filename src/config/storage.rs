//! Connection Storage
//!
//! Read-only lookup of stored connection records from a JSON file.
//! Location: `$CONNECTIONS_FILE`, else `<config dir>/shellgate/connections.json`.
//!
//! ```json
//! {
//!   "version": 1,
//!   "connections": [
//!     { "id": "1", "name": "web", "owner": "42", "host": "10.0.0.5",
//!       "port": 22, "username": "deploy", "auth_type": "password",
//!       "secret": "<output of `shellgate encrypt`>" }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::bridge::{ChannelRequest, ConnectionResolver};
use crate::ssh::ConnectionRecord;

/// Current connection file format version
pub const CONNECTIONS_VERSION: u32 = 1;

/// Connection storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("Connection not found")]
    NotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connections file version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Default connections file path
pub fn connections_file() -> Result<PathBuf, StorageError> {
    dirs::config_dir()
        .map(|dir| dir.join("shellgate").join("connections.json"))
        .ok_or(StorageError::NoConfigDir)
}

/// One stored connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConnection {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Caller identity allowed to use this connection; `None` means any caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(flatten)]
    pub record: ConnectionRecord,
}

/// On-disk layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsFile {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub connections: Vec<StoredConnection>,
}

impl Default for ConnectionsFile {
    fn default() -> Self {
        Self {
            version: CONNECTIONS_VERSION,
            connections: Vec::new(),
        }
    }
}

fn default_version() -> u32 {
    CONNECTIONS_VERSION
}

/// JSON-file-backed connection store
///
/// The file is re-read on every lookup so edits apply without a restart.
pub struct ConnectionStore {
    path: PathBuf,
}

impl ConnectionStore {
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the connections file
    /// Returns an empty store if the file doesn't exist
    pub async fn load(&self) -> Result<ConnectionsFile, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Connections file {:?} not found", self.path);
                return Ok(ConnectionsFile::default());
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let file: ConnectionsFile = serde_json::from_str(&contents)?;
        if file.version > CONNECTIONS_VERSION {
            return Err(StorageError::VersionTooNew {
                found: file.version,
                supported: CONNECTIONS_VERSION,
            });
        }

        Ok(file)
    }

    /// Look up a connection visible to `user_id`
    ///
    /// A connection owned by someone else is reported as not found.
    pub async fn get(
        &self,
        id: &str,
        user_id: Option<&str>,
    ) -> Result<ConnectionRecord, StorageError> {
        let file = self.load().await?;

        file.connections
            .into_iter()
            .find(|c| c.id == id)
            .filter(|c| match c.owner.as_deref() {
                None => true,
                Some(owner) => user_id == Some(owner),
            })
            .map(|c| c.record)
            .ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl ConnectionResolver for ConnectionStore {
    async fn resolve(&self, request: &ChannelRequest) -> Result<ConnectionRecord, StorageError> {
        self.get(&request.connection_id, request.user_id.as_deref())
            .await
    }
}
