use std::{
    collections::HashMap,
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use flume::{Receiver, RecvTimeoutError};
use log::{debug, error, info, trace, warn};
use stopwatch::Stopwatch;
use tokio::sync::mpsc;

use crate::{
    config::ServerConfig,
    error::StorageError,
    model::{Entity, Player, Vec2d},
    net::{handshake::Identity, Packet},
    sync::{self, EditOutcome, Viewer, ViewerState},
    utils::chat_packet,
    world::{chunk::VirtualChunk, gen::WorldGenerator, ChunkPos, TilePos, TileType, World},
};

pub type Outbound = mpsc::UnboundedSender<Packet>;

#[derive(Debug)]
pub enum GameEvent {
    Join {
        id: u32,
        identity: Identity,
        tx: Outbound,
    },
    Packet {
        id: u32,
        packet: Packet,
    },
    Leave {
        id: u32,
    },
    Shutdown,
}

struct Client {
    viewer: Viewer,
    tx: Outbound,
}

impl Client {
    fn send(&self, packet: Packet) {
        // A closed channel means the connection task is gone and a Leave is on its way.
        if self.tx.send(packet).is_err() {
            trace!("Dropped packet for closed viewer {}", self.viewer.id);
        }
    }
}

/// Owns the world and every viewer. Runs on its own thread so world access
/// is never shared.
pub struct Game {
    config: Arc<ServerConfig>,
    world: World,
    gen: WorldGenerator,
    clients: HashMap<u32, Client>,
    last_gc: Instant,
}

impl Game {
    pub fn new(config: Arc<ServerConfig>, world: World) -> Game {
        let gen = WorldGenerator::new(world.seed(), &config.worldgen);
        Game {
            config,
            world,
            gen,
            clients: HashMap::new(),
            last_gc: Instant::now(),
        }
    }

    pub fn start(self, events: Receiver<GameEvent>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("world".to_string())
            .spawn(move || self.run(events))
    }

    fn run(mut self, events: Receiver<GameEvent>) {
        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        info!("World thread started, tick is {:?}", tick);

        loop {
            let deadline = Instant::now() + tick;
            loop {
                match events.recv_deadline(deadline) {
                    Ok(GameEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        self.shutdown();
                        return;
                    }
                    Ok(event) => self.handle_event(event),
                    Err(RecvTimeoutError::Timeout) => break,
                }
            }

            let sw = Stopwatch::start_new();
            self.tick();
            if sw.elapsed() > tick {
                warn!("Tick took {}ms", sw.elapsed_ms());
            } else {
                trace!("Tick took {}ms", sw.elapsed_ms());
            }
        }
    }

    pub fn handle_event(&mut self, event: GameEvent) {
        match event {
            GameEvent::Join { id, identity, tx } => self.join(id, identity, tx),
            GameEvent::Packet { id, packet } => self.handle_packet(id, packet),
            GameEvent::Leave { id } => self.leave(id),
            GameEvent::Shutdown => self.shutdown(),
        }
    }

    /// Flushes pending writes and runs the section GC when it is due.
    pub fn tick(&mut self) {
        if let Err(e) = self.world.flush_dirty() {
            error!("Failed to flush world: {}", e);
        }

        let interval = Duration::from_secs(self.config.gc_interval_secs);
        if self.last_gc.elapsed() >= interval {
            self.collect_sections();
            self.last_gc = Instant::now();
        }
    }

    /// Closes every open section that no viewer tracks a chunk in.
    pub fn collect_sections(&mut self) -> usize {
        let referenced = sync::referenced_sections(self.clients.values().map(|c| &c.viewer));
        let unused = sync::unreferenced_sections(self.world.open_sections(), &referenced);
        for pos in &unused {
            if let Err(e) = self.world.close_section(*pos) {
                error!("Failed to close section {:?}: {}", pos, e);
            }
        }
        if !unused.is_empty() {
            debug!("Section GC closed {} sections", unused.len());
        }
        unused.len()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn viewer(&self, id: u32) -> Option<&Viewer> {
        self.clients.get(&id).map(|c| &c.viewer)
    }

    fn join(&mut self, id: u32, identity: Identity, tx: Outbound) {
        if self
            .clients
            .values()
            .any(|c| c.viewer.player.uuid == identity.uuid)
        {
            warn!("{} ({}) is already connected", identity.name, identity.uuid);
            let _ = tx.send(Packet::disconnect("already connected"));
            return;
        }

        let mut player = Player::new(identity.uuid, identity.name);
        let saved = match self.world.load_player(&player.uuid) {
            Ok(Some(data)) => {
                player.apply_data(&data);
                TilePos::checked_from_pos(data.position.x, data.position.y).is_some()
            }
            Ok(None) => false,
            Err(e) => {
                error!("Failed to load player {}: {}", player.username, e);
                false
            }
        };
        if !saved {
            match self.world.find_spawn(&mut self.gen) {
                Ok(spawn) => player.set_pos(Vec2d::new(spawn.x as f64 + 0.5, spawn.y as f64)),
                Err(e) => error!("Failed to find spawn for {}: {}", player.username, e),
            }
        }

        info!(
            "{} joined as viewer {} at ({:.1}, {:.1})",
            player.username, id, player.position.x, player.position.y
        );
        let client = Client {
            viewer: Viewer::new(id, player),
            tx,
        };
        let pos = client.viewer.player.position;
        let vel = client.viewer.player.velocity;
        client.send(Packet::PlayerPosition { x: pos.x, y: pos.y });
        if vel != Vec2d::default() {
            client.send(Packet::AddVelocity { x: vel.x, y: vel.y });
        }

        let joined = format!("{} joined the game", client.viewer.player.username);
        self.clients.insert(id, client);
        self.sync_window(id);
        self.broadcast(chat_packet(joined));
    }

    fn leave(&mut self, id: u32) {
        let mut client = match self.clients.remove(&id) {
            Some(client) => client,
            None => return,
        };
        client.viewer.disconnect();

        let player = &client.viewer.player;
        if let Err(e) = self.world.save_player(&player.uuid, &player.to_data()) {
            error!("Failed to save player {}: {}", player.username, e);
        }
        info!("{} left", player.username);
        self.broadcast(chat_packet(format!("{} left the game", player.username)));
    }

    fn shutdown(&mut self) {
        info!("Shutting down world with {} viewers", self.clients.len());
        for (_, client) in self.clients.drain() {
            let player = &client.viewer.player;
            if let Err(e) = self.world.save_player(&player.uuid, &player.to_data()) {
                error!("Failed to save player {}: {}", player.username, e);
            }
            let _ = client.tx.send(Packet::disconnect("server closed"));
        }
        if let Err(e) = self.world.close() {
            error!("Failed to close world: {}", e);
        }
    }

    fn handle_packet(&mut self, id: u32, packet: Packet) {
        let client = match self.clients.get_mut(&id) {
            Some(client) => client,
            None => {
                trace!("Dropping {} from unknown viewer {}", packet.name(), id);
                return;
            }
        };

        match packet {
            Packet::PlayerPosition { x, y } => {
                if TilePos::checked_from_pos(x, y).is_none() {
                    warn!("Viewer {} moved outside the world to ({}, {})", id, x, y);
                    let pos = client.viewer.player.position;
                    client.send(Packet::PlayerPosition { x: pos.x, y: pos.y });
                    return;
                }
                client.viewer.player.set_pos(Vec2d::new(x, y));
                self.sync_window(id);
            }
            Packet::AddVelocity { x, y } => {
                if x.is_finite() && y.is_finite() {
                    let vel = &mut client.viewer.player.velocity;
                    vel.x += x;
                    vel.y += y;
                }
            }
            Packet::ChunkUpdate { chunk, x, y, tile } => {
                if !chunk.in_world() {
                    debug!("Viewer {} edited outside the world at {:?}", id, chunk);
                    return;
                }
                let origin = chunk.origin();
                let target = TilePos::new(origin.x + x as i32, origin.y + y as i32);
                self.edit(id, target, tile);
            }
            Packet::Chat { message, .. } => {
                let message = message.trim();
                if message.is_empty() {
                    return;
                }
                info!("<{}> {}", client.viewer.player.username, message);
                let line = format!("<{}> {}", client.viewer.player.username, message);
                self.broadcast(chat_packet(line));
            }
            other => debug!("Viewer {} sent unhandled {}", id, other.name()),
        }
    }

    /// Validates an edit from viewer `id`. Rejected edits send the
    /// authoritative tile back to the editor only.
    fn edit(&mut self, id: u32, target: TilePos, tile: TileType) {
        let outcome = match self.clients.get(&id) {
            Some(client) => sync::validate_edit(
                &client.viewer.player,
                target,
                tile,
                self.config.reach_sq(),
                self.clients.values().map(|c| c.viewer.player.bounds()),
            ),
            None => return,
        };

        match outcome {
            EditOutcome::Applied => {
                if let Err(e) = self.set_tile(target, tile) {
                    error!("Edit at {:?} by viewer {} failed: {}", target, id, e);
                    self.correct(id, target);
                }
            }
            EditOutcome::Rejected(reason) => {
                debug!("Rejected edit at {:?} by viewer {}: {:?}", target, id, reason);
                self.correct(id, target);
            }
        }
    }

    /// Authority-side tile change, fanned out to every viewer tracking the chunk.
    pub fn set_tile(&mut self, target: TilePos, tile: TileType) -> Result<(), StorageError> {
        let chunk = target.chunk();
        self.world.generated_chunk(chunk, &mut self.gen)?;
        self.world.set_tile(target.x, target.y, tile)?;

        let (x, y) = target.local();
        for client in self.clients.values().filter(|c| c.viewer.tracks(chunk)) {
            client.send(Packet::ChunkUpdate {
                chunk,
                x: x as u8,
                y: y as u8,
                tile,
            });
        }
        Ok(())
    }

    /// Re-sends the stored tile to the editor. Chunks the editor does not
    /// track are left alone so a rejected edit never opens or generates storage.
    fn correct(&mut self, id: u32, target: TilePos) {
        match self.clients.get(&id) {
            Some(client) if client.viewer.tracks(target.chunk()) => {}
            _ => return,
        }
        let tile = match self
            .world
            .generated_tile_at(target.x, target.y, &mut self.gen)
        {
            Ok(tile) => tile,
            Err(e) => {
                error!("Failed to read tile {:?}: {}", target, e);
                return;
            }
        };
        if let Some(client) = self.clients.get(&id) {
            let (x, y) = target.local();
            client.send(Packet::ChunkUpdate {
                chunk: target.chunk(),
                x: x as u8,
                y: y as u8,
                tile,
            });
        }
    }

    /// Sends the chunks entering viewer `id`'s window, nearest first, then
    /// unloads the ones that left it.
    fn sync_window(&mut self, id: u32) {
        let client = match self.clients.get_mut(&id) {
            Some(client) => client,
            None => return,
        };
        let center = client.viewer.player.chunk_pos();
        let change = match client.viewer.update_window(center, self.config.view_dist) {
            Some(change) => change,
            None => return,
        };

        let mut failed = 0;
        for pos in change.load {
            match load_snapshot(&mut self.world, &mut self.gen, pos) {
                Ok(chunk) => {
                    client.send(Packet::Chunk { chunk });
                    client.viewer.mark_loaded(pos);
                }
                Err(e) => {
                    error!("Failed to load chunk {:?} for viewer {}: {}", pos, id, e);
                    failed += 1;
                }
            }
        }
        for pos in change.unload {
            client.send(Packet::ChunkUnload { pos });
        }

        if failed == 0 {
            client.viewer.synchronize();
        }
        trace!("Viewer {} window centered on {:?}", id, center);
    }

    fn broadcast(&self, packet: Packet) {
        let synchronized = self
            .clients
            .values()
            .filter(|c| c.viewer.state() == ViewerState::Synchronized);
        for client in synchronized {
            client.send(packet.clone());
        }
    }
}

fn load_snapshot(
    world: &mut World,
    gen: &mut WorldGenerator,
    pos: ChunkPos,
) -> Result<VirtualChunk, StorageError> {
    let view = world.generated_chunk(pos, gen)?;
    world.snapshot(view)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::world::SectionPos;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_game() -> Game {
        let dir = std::env::temp_dir().join(format!(
            "tileworld_game_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let config = ServerConfig {
            view_dist: 1,
            ..Default::default()
        };
        let world = World::open(&dir, "test", 42).unwrap();
        Game::new(Arc::new(config), world)
    }

    fn join(game: &mut Game, id: u32, name: &str) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        game.handle_event(GameEvent::Join {
            id,
            identity: Identity {
                uuid: Uuid::new_v4(),
                name: name.to_string(),
                encrypted: false,
            },
            tx,
        });
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            out.push(packet);
        }
        out
    }

    fn move_to(game: &mut Game, id: u32, x: f64, y: f64) {
        game.handle_event(GameEvent::Packet {
            id,
            packet: Packet::PlayerPosition { x, y },
        });
    }

    #[test]
    fn join_sends_position_then_window() {
        let mut game = temp_game();
        let mut rx = join(&mut game, 1, "alice");
        let packets = drain(&mut rx);

        assert!(matches!(packets[0], Packet::PlayerPosition { .. }));
        let chunks: Vec<ChunkPos> = packets
            .iter()
            .filter_map(|p| match p {
                Packet::Chunk { chunk } => Some(chunk.pos),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 9);

        let viewer = game.viewer(1).unwrap();
        assert_eq!(chunks[0], viewer.player.chunk_pos());
        assert_eq!(viewer.state(), ViewerState::Synchronized);
        assert!(matches!(packets.last(), Some(Packet::Chat { .. })));
    }

    #[test]
    fn moving_across_a_chunk_streams_the_difference() {
        let mut game = temp_game();
        let mut rx = join(&mut game, 1, "alice");
        move_to(&mut game, 1, 8.0, 8.0);
        drain(&mut rx);

        move_to(&mut game, 1, 24.0, 8.0);
        let packets = drain(&mut rx);
        let loads = packets.iter().filter(|p| matches!(p, Packet::Chunk { .. })).count();
        let unloads: Vec<&Packet> = packets
            .iter()
            .filter(|p| matches!(p, Packet::ChunkUnload { .. }))
            .collect();
        assert_eq!(loads, 3);
        assert_eq!(unloads.len(), 3);
        assert!(unloads
            .iter()
            .all(|p| matches!(p, Packet::ChunkUnload { pos } if pos.x == -1)));

        // Same chunk again: nothing to do.
        move_to(&mut game, 1, 25.0, 9.0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn edits_apply_or_get_corrected() {
        let mut game = temp_game();
        let mut rx = join(&mut game, 1, "alice");
        let mut other = join(&mut game, 2, "bob");
        move_to(&mut game, 1, 136.5, 136.0);
        move_to(&mut game, 2, 137.5, 136.0);
        drain(&mut rx);
        drain(&mut other);

        let target = TilePos::new(140, 136);
        game.handle_event(GameEvent::Packet {
            id: 1,
            packet: Packet::ChunkUpdate {
                chunk: target.chunk(),
                x: target.local().0 as u8,
                y: target.local().1 as u8,
                tile: TileType::Bricks,
            },
        });
        let update = Packet::ChunkUpdate {
            chunk: target.chunk(),
            x: target.local().0 as u8,
            y: target.local().1 as u8,
            tile: TileType::Bricks,
        };
        assert_eq!(drain(&mut rx), vec![update.clone()]);
        assert_eq!(drain(&mut other), vec![update]);

        // Out of reach: only the editor hears back, with the stored tile.
        let far = TilePos::new(150, 136);
        game.handle_event(GameEvent::Packet {
            id: 1,
            packet: Packet::ChunkUpdate {
                chunk: far.chunk(),
                x: far.local().0 as u8,
                y: far.local().1 as u8,
                tile: TileType::Bricks,
            },
        });
        let echoed = drain(&mut rx);
        assert_eq!(echoed.len(), 1);
        assert!(matches!(
            echoed[0],
            Packet::ChunkUpdate { tile, .. } if tile != TileType::Bricks
        ));
        assert!(drain(&mut other).is_empty());

        // Placing inside bob is refused.
        let inside = TilePos::new(137, 136);
        game.handle_event(GameEvent::Packet {
            id: 1,
            packet: Packet::ChunkUpdate {
                chunk: inside.chunk(),
                x: inside.local().0 as u8,
                y: inside.local().1 as u8,
                tile: TileType::Stone,
            },
        });
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(drain(&mut other).is_empty());
    }

    #[test]
    fn positions_outside_the_world_are_refused() {
        let mut game = temp_game();
        let mut rx = join(&mut game, 1, "alice");
        drain(&mut rx);
        let before = game.viewer(1).unwrap().player.position;

        move_to(&mut game, 1, 1e10, 0.0);
        move_to(&mut game, 1, 0.0, -1e300);
        assert_eq!(game.viewer(1).unwrap().player.position, before);
        let packets = drain(&mut rx);
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| *p
            == Packet::PlayerPosition {
                x: before.x,
                y: before.y
            }));

        game.handle_event(GameEvent::Packet {
            id: 1,
            packet: Packet::ChunkUpdate {
                chunk: ChunkPos::new(i32::MAX, i32::MIN),
                x: 15,
                y: 15,
                tile: TileType::Stone,
            },
        });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn saved_position_outside_the_world_falls_back_to_spawn() {
        let mut game = temp_game();
        let uuid = Uuid::new_v4();
        let data = crate::model::PlayerData {
            name: "dave".to_string(),
            position: Vec2d::new(1e10, 5.0),
            velocity: Vec2d::default(),
        };
        game.world().save_player(&uuid, &data).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        game.handle_event(GameEvent::Join {
            id: 1,
            identity: Identity {
                uuid,
                name: "dave".to_string(),
                encrypted: false,
            },
            tx,
        });
        let pos = game.viewer(1).unwrap().player.position;
        assert!(TilePos::checked_from_pos(pos.x, pos.y).is_some());
        assert_eq!(game.viewer(1).unwrap().player.tile_pos().x, 0);
    }

    #[test]
    fn rejected_far_edits_leave_storage_alone() {
        let mut game = temp_game();
        let mut rx = join(&mut game, 1, "alice");
        drain(&mut rx);

        let sections_dir = game.world().root().join(crate::world::SECTIONS_DIR);
        let count_files = || std::fs::read_dir(&sections_dir).unwrap().count();
        let files = count_files();
        let mut open: Vec<SectionPos> = game.world().open_sections().collect();
        open.sort_unstable();

        for i in 0..20 {
            game.handle_event(GameEvent::Packet {
                id: 1,
                packet: Packet::ChunkUpdate {
                    chunk: ChunkPos::new(10_000 + 16 * i, 10_000),
                    x: 0,
                    y: 0,
                    tile: TileType::Stone,
                },
            });
        }

        assert!(drain(&mut rx).is_empty());
        assert_eq!(count_files(), files);
        let mut after: Vec<SectionPos> = game.world().open_sections().collect();
        after.sort_unstable();
        assert_eq!(after, open);
    }

    #[test]
    fn gc_closes_only_the_abandoned_section() {
        let mut game = temp_game();
        let mut rx = join(&mut game, 1, "alice");
        move_to(&mut game, 1, 136.0, 136.0);
        assert!(game.world().is_section_open(SectionPos::new(0, 0)));

        move_to(&mut game, 1, 648.0, 136.0);
        drain(&mut rx);
        game.collect_sections();

        let open: Vec<SectionPos> = game.world().open_sections().collect();
        assert_eq!(open, vec![SectionPos::new(2, 0)]);
        assert!(!game.world().is_section_open(SectionPos::new(0, 0)));
    }

    #[test]
    fn duplicate_login_is_refused_and_leave_saves() {
        let mut game = temp_game();
        let (tx, _rx) = mpsc::unbounded_channel();
        let identity = Identity {
            uuid: Uuid::new_v4(),
            name: "carol".to_string(),
            encrypted: false,
        };
        game.handle_event(GameEvent::Join {
            id: 1,
            identity: identity.clone(),
            tx,
        });

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        game.handle_event(GameEvent::Join {
            id: 2,
            identity: identity.clone(),
            tx: tx2,
        });
        assert!(matches!(drain(&mut rx2)[..], [Packet::Disconnect { .. }]));
        assert!(game.viewer(2).is_none());

        move_to(&mut game, 1, 3.5, 7.0);
        game.handle_event(GameEvent::Leave { id: 1 });
        let saved = game.world().load_player(&identity.uuid).unwrap().unwrap();
        assert_eq!(saved.position, Vec2d::new(3.5, 7.0));
    }
}
