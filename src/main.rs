use std::{error::Error, path::Path, sync::Arc};

use log::{error, info};
use tokio::{net::TcpListener, select};

use tileworld::{config::ServerConfig, server::Server, world::World};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let config = ServerConfig::load_or_create(Path::new("config.toml"))?;
    let seed = config.seed.unwrap_or_else(rand::random);
    let world = World::open(&config.world_dir, &config.world_name, seed)?
        .with_chunk_cache(config.chunk_cache);
    info!(
        "Opened world '{}' with seed {}",
        world.meta().name,
        world.seed()
    );

    let config = Arc::new(config);
    let listener = TcpListener::bind(&config.bind).await?;
    let server = Server::start(config, world)?;

    select! {
        result = server.listen(listener) => {
            if let Err(e) = result {
                error!("Listener failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
    }

    server.shutdown().await;
    Ok(())
}
