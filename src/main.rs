//! Shellgate server binary
//!
//! ```text
//! shellgate [serve]              serve WebSocket sessions until Ctrl-C
//! shellgate encrypt              read a secret on stdin, print its vault blob
//! shellgate probe <id> [user]    dial and authenticate a stored connection
//! ```

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use shellgate::bridge::{BridgeServer, Relay, RelayConfig};
use shellgate::config::settings::{encryption_key, ENV_HOST_KEY_FINGERPRINTS};
use shellgate::config::{ConnectionStore, ServerConfig, Vault};
use shellgate::ssh::{HostKeyPolicy, SshBroker};
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: shellgate [serve | encrypt | probe <connection-id> [user-id]]";

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if matches!(args.get(1).map(String::as_str), Some("--version" | "-V")) {
        println!("shellgate {}", VERSION);
        return ExitCode::SUCCESS;
    }

    shellgate::init_logging();

    match args.get(1).map(String::as_str) {
        None | Some("serve") => serve().await,
        Some("encrypt") => encrypt(),
        Some("probe") => match args.get(2) {
            Some(id) => probe(id, args.get(3).map(String::as_str)).await,
            None => {
                eprintln!("{}", USAGE);
                ExitCode::from(2)
            }
        },
        Some(other) => {
            eprintln!("unknown command: {}\n{}", other, USAGE);
            ExitCode::from(2)
        }
    }
}

/// Build the broker from process configuration
fn broker(config: &ServerConfig) -> Option<SshBroker> {
    let vault = match config.vault() {
        Ok(vault) => vault,
        Err(e) => {
            error!("Failed to initialize vault: {}", e);
            return None;
        }
    };

    let options = config.broker_options();
    if options.host_key_policy == HostKeyPolicy::AcceptAny {
        warn!(
            "Server host keys are not verified; set {} to pin fingerprints",
            ENV_HOST_KEY_FINGERPRINTS
        );
    }

    Some(SshBroker::new(Arc::new(vault), options))
}

fn load_config() -> Option<ServerConfig> {
    match ServerConfig::from_env() {
        Ok(config) => Some(config),
        Err(e) => {
            error!("Configuration error: {}", e);
            None
        }
    }
}

async fn serve() -> ExitCode {
    let Some(config) = load_config() else {
        return ExitCode::FAILURE;
    };
    let Some(broker) = broker(&config) else {
        return ExitCode::FAILURE;
    };

    let relay = Arc::new(Relay::new(
        broker,
        RelayConfig {
            idle_timeout: config.idle_timeout,
        },
    ));
    let store = Arc::new(ConnectionStore::with_path(config.connections_file.clone()));
    info!("Using connections file {:?}", store.path());

    let server = match BridgeServer::bind(&config.listen_addr).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind {}: {}", config.listen_addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("shellgate {} starting", VERSION);

    tokio::select! {
        _ = server.serve(relay, store) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {}", e);
                return ExitCode::FAILURE;
            }
            info!("Shutting down");
        }
    }

    ExitCode::SUCCESS
}

fn encrypt() -> ExitCode {
    let key = match encryption_key(|name| std::env::var(name).ok()) {
        Ok(key) => key,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let vault = match Vault::new(&key) {
        Ok(vault) => vault,
        Err(e) => {
            error!("Failed to initialize vault: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut secret = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut secret) {
        error!("Failed to read secret from stdin: {}", e);
        return ExitCode::FAILURE;
    }
    let secret = secret
        .strip_suffix('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s))
        .unwrap_or(secret.as_str());

    match vault.encrypt(secret) {
        Ok(blob) => {
            println!("{}", blob);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Encryption failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn probe(id: &str, user_id: Option<&str>) -> ExitCode {
    let Some(config) = load_config() else {
        return ExitCode::FAILURE;
    };
    let Some(broker) = broker(&config) else {
        return ExitCode::FAILURE;
    };

    let store = ConnectionStore::with_path(config.connections_file.clone());
    let record = match store.get(id, user_id).await {
        Ok(record) => record,
        Err(e) => {
            error!("Connection {}: {}", id, e);
            return ExitCode::FAILURE;
        }
    };

    match broker.probe(&record).await {
        Ok(()) => {
            println!("Connection successful: {}", record.target());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("Connection failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
