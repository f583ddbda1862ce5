//! Collaboration server binary.
//!
//! Configuration comes from the environment:
//!
//! - `COLLAB_BIND` — bind address (default `127.0.0.1:8000`)
//! - `COLLAB_DATA_DIR` — data directory for session backing files
//!   (unset = in-memory only)
//! - `COLLAB_GREETING` — greeting banner
//! - `COLLAB_INLINE_PAYLOAD` — set to `1` to stream changed bytes
//!   inline with each watch event

use std::path::PathBuf;

use collab_mem::{CollabServer, ServerConfig};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("COLLAB_BIND") {
        config.bind_addr = addr;
    }
    if let Some(dir) = std::env::var_os("COLLAB_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if let Ok(greeting) = std::env::var("COLLAB_GREETING") {
        config.greeting = greeting;
    }
    if let Ok(flag) = std::env::var("COLLAB_INLINE_PAYLOAD") {
        config.inline_payload = flag == "1";
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let server = CollabServer::new(config_from_env());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for shutdown signal: {e}");
        }
        log::info!("shutdown signal received");
    };

    if let Err(e) = server.run_until(shutdown).await {
        log::error!("server error: {e}");
        std::process::exit(1);
    }
}
