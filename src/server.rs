use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use dashmap::DashMap;
use log::{debug, error, info};
use tokio::net::TcpListener;

use crate::{
    client,
    config::ServerConfig,
    game::{Game, GameEvent},
    world::World,
};

/// Registry of live connections, shared with every connection task. World
/// state lives on the world thread and is only reached through `submit`.
pub struct ServerHandler {
    pub config: Arc<ServerConfig>,
    events: flume::Sender<GameEvent>,
    clients: DashMap<u32, SocketAddr>,
    id_counter: AtomicU32,
}

impl ServerHandler {
    pub fn new(config: Arc<ServerConfig>, events: flume::Sender<GameEvent>) -> Arc<ServerHandler> {
        Arc::new(ServerHandler {
            config,
            events,
            clients: DashMap::new(),
            id_counter: AtomicU32::new(1),
        })
    }

    pub fn new_id(&self) -> u32 {
        self.id_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_client(&self, id: u32, addr: SocketAddr) {
        self.clients.insert(id, addr);
    }

    pub fn remove_client(&self, id: u32) {
        self.clients.remove(&id);
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Hands an event to the world thread. False once it has stopped.
    pub fn submit(&self, event: GameEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// The world thread plus the handler connection tasks share.
pub struct Server {
    handler: Arc<ServerHandler>,
    game: Option<JoinHandle<()>>,
}

impl Server {
    pub fn start(config: Arc<ServerConfig>, world: World) -> io::Result<Server> {
        let (tx, rx) = flume::unbounded();
        let game = Game::new(config.clone(), world).start(rx)?;
        Ok(Server {
            handler: ServerHandler::new(config, tx),
            game: Some(game),
        })
    }

    pub fn handler(&self) -> Arc<ServerHandler> {
        self.handler.clone()
    }

    /// Accepts connections until the listener fails.
    pub async fn listen(&self, listener: TcpListener) -> io::Result<()> {
        info!("Listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("Accepted connection from {}", addr);
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
            }

            let handler = self.handler.clone();
            tokio::spawn(async move {
                client::handle_tcp(handler, stream, addr).await;
            });
        }
    }

    /// Stops the world thread, saving every player and closing the world.
    pub async fn shutdown(mut self) {
        self.handler.submit(GameEvent::Shutdown);
        if let Some(game) = self.game.take() {
            match tokio::task::spawn_blocking(move || game.join()).await {
                Ok(Ok(())) => info!("World thread stopped"),
                _ => error!("World thread panicked"),
            }
        }
    }
}
