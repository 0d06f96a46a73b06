//! Configuration Management Module
//!
//! Process settings from the environment, the credential vault, and the
//! read-only connection store.

pub mod settings;
pub mod storage;
pub mod vault;

pub use settings::{ConfigError, ServerConfig};
pub use storage::{connections_file, ConnectionStore, ConnectionsFile, StorageError, StoredConnection};
pub use vault::{SecretBlob, Vault, VaultError};
