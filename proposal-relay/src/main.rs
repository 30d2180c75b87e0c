//! Standalone relay for proposal-collab sessions.
//!
//! Configured through `PROPOSAL_RELAY_ADDR`, `PROPOSAL_RELAY_MAX_SUBSCRIBERS`
//! and `PROPOSAL_RELAY_BROADCAST_CAPACITY`; logging through `RUST_LOG`.

use log::{error, info};
use proposal_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };
    info!(
        "Starting relay on {} (max {} subscribers per channel)",
        config.bind_addr, config.max_subscribers_per_channel
    );

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
