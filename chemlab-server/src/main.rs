//! Standalone collaboration server binary.
//!
//! Configuration comes from the environment:
//! - `CHEMLAB_BIND` — listen address (default `127.0.0.1:8000`)
//! - `CHEMLAB_ROOM_GRACE_SECS` — how long an empty room survives
//!   before teardown (default 30; 0 destroys immediately)
//! - `RUST_LOG` — standard env_logger filter

use chemlab_collab::server::{CollabServer, ServerConfig};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Ignoring unparseable {key}={raw:?}");
                default
            }
        },
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("CHEMLAB_BIND") {
        config.bind_addr = bind;
    }
    config.empty_room_grace_secs =
        env_or("CHEMLAB_ROOM_GRACE_SECS", config.empty_room_grace_secs);

    let server = CollabServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Server failed: {e}");
        std::process::exit(1);
    }
}
