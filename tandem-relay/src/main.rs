//! Tandem signaling relay.
//!
//! Environment:
//! - `TANDEM_RELAY_ADDR` — bind address (default `127.0.0.1:4444`)
//! - `TANDEM_ROOM_CAPACITY` — members per room (default 64)
//! - `RUST_LOG` — log filter, e.g. `info` or `tandem_collab=debug`

use log::{error, info, warn};
use tandem_collab::relay::{RelayConfig, RelayServer};

fn config_from_env() -> RelayConfig {
    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("TANDEM_RELAY_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(raw) = std::env::var("TANDEM_ROOM_CAPACITY") {
        match raw.parse() {
            Ok(capacity) => config.max_members_per_room = capacity,
            Err(e) => warn!("Ignoring TANDEM_ROOM_CAPACITY={raw:?}: {e}"),
        }
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    info!("Starting Tandem relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} frames, {} rejected joins",
                stats.total_connections, stats.total_frames, stats.rejected_joins
            );
        }
    }
}
