use quill_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("QUILL_RELAY_ADDR").ok())
        .unwrap_or_else(|| RelayConfig::default().bind_addr);

    log::info!("Starting quill relay on {bind_addr}...");

    let relay = RelayServer::new(RelayConfig {
        bind_addr,
        ..RelayConfig::default()
    });
    if let Err(e) = relay.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
