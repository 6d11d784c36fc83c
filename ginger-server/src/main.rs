//! ginger relay server.
//!
//! ```text
//! ginger-server [--owner-rights] [BIND_ADDR] [STORAGE_PATH]
//! ```
//!
//! Without a storage path documents live in memory and vanish on exit.
//! `--owner-rights` limits changes to the creator of each document.
//! `RUST_LOG` controls verbosity.

use ginger_sync::server::{RightsPolicy, ServerConfig, SocketServer};
use log::{error, info};
use std::path::PathBuf;

fn config_from_args(args: impl Iterator<Item = String>) -> ServerConfig {
    let mut config = ServerConfig::default();
    let (flags, positional): (Vec<String>, Vec<String>) = args.partition(|arg| arg.starts_with("--"));
    if flags.iter().any(|flag| flag == "--owner-rights") {
        config.rights = RightsPolicy::Owner;
    }
    let mut positional = positional.into_iter();
    if let Some(addr) = positional.next() {
        config.bind_addr = addr;
    }
    config.storage_path = positional.next().map(PathBuf::from);
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_args(std::env::args().skip(1));
    info!("Starting ginger server on {}...", config.bind_addr);
    match &config.storage_path {
        Some(path) => info!("storage: {}", path.display()),
        None => info!("storage: in-memory"),
    }

    let server = match SocketServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to open storage: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run().await {
        error!("server stopped: {e}");
        std::process::exit(1);
    }
}
