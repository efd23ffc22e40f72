//! KYRO Hub server binary.

use std::process;
use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use tokio::net::TcpListener;

use kyro_hub::config::{self, HubConfig};
use kyro_hub::hub::Hub;
use kyro_hub::server::HubServer;
use kyro_hub::store::memory::MemoryStore;
use kyro_hub::store::sqlite::SqliteStore;
use kyro_hub::store::DocumentStore;

/// Exit codes: 0 clean, 1 fatal config, 2 store unreachable at startup.
const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match HubConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("invalid configuration: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };
    if config.token_signing_key == config::DEV_SIGNING_KEY {
        warn!("TOKEN_SIGNING_KEY not set; using the development key");
    }

    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => {
            error!("document store unreachable: {:#}", e);
            process::exit(EXIT_STORE);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind port {}: {}", config.port, e);
            process::exit(EXIT_CONFIG);
        }
    };

    let hub = Hub::new(config, store);
    let server = HubServer::new(hub);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(());
        }
    });

    if let Err(e) = server.run(listener).await {
        error!("server error: {}", e);
        process::exit(EXIT_CONFIG);
    }
    info!("KYRO Hub stopped");
}

fn open_store(config: &HubConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    if config.docstore_url == "memory:" {
        info!("using the in-memory document store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = config
        .docstore_url
        .strip_prefix("sqlite://")
        .unwrap_or(&config.docstore_url);
    let store = SqliteStore::open(path)
        .with_context(|| format!("opening document store at {}", config.docstore_url))?;
    Ok(Arc::new(store))
}
