use log::info;
use scribe_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting Scribe server (max {} clients per room, history {} ops)",
        config.max_clients_per_room, config.history_limit
    );

    SyncServer::new(config).run().await
}
