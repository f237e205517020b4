use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::world::{ChunkPos, TilePos};

pub const PLAYER_WIDTH: f64 = 0.75;
pub const PLAYER_HEIGHT: f64 = 1.8;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2d {
    pub x: f64,
    pub y: f64,
}

impl Vec2d {
    pub fn new(x: f64, y: f64) -> Vec2d {
        Vec2d { x, y }
    }
}

/// Axis-aligned box, `min` inclusive and `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec2d,
    pub max: Vec2d,
}

impl Bounds {
    pub fn of_tile(pos: TilePos) -> Bounds {
        Bounds {
            min: Vec2d::new(pos.x as f64, pos.y as f64),
            max: Vec2d::new(pos.x as f64 + 1.0, pos.y as f64 + 1.0),
        }
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min.x < other.max.x
            && other.min.x < self.max.x
            && self.min.y < other.max.y
            && other.min.y < self.max.y
    }
}

pub trait Entity {
    fn pos(&self) -> Vec2d;

    fn set_pos(&mut self, pos: Vec2d);

    fn size(&self) -> Vec2d;

    fn tile_pos(&self) -> TilePos {
        let pos = self.pos();
        TilePos::from_pos(pos.x, pos.y)
    }

    fn chunk_pos(&self) -> ChunkPos {
        self.tile_pos().chunk()
    }

    /// Feet at `pos`, centered horizontally.
    fn bounds(&self) -> Bounds {
        let pos = self.pos();
        let size = self.size();
        Bounds {
            min: Vec2d::new(pos.x - size.x / 2.0, pos.y),
            max: Vec2d::new(pos.x + size.x / 2.0, pos.y + size.y),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    pub uuid: Uuid,
    pub username: String,
    pub position: Vec2d,
    pub velocity: Vec2d,
}

impl Player {
    pub fn new(uuid: Uuid, username: String) -> Player {
        Player {
            uuid,
            username,
            position: Default::default(),
            velocity: Default::default(),
        }
    }

    pub fn to_data(&self) -> PlayerData {
        PlayerData {
            name: self.username.clone(),
            position: self.position,
            velocity: self.velocity,
        }
    }

    pub fn apply_data(&mut self, data: &PlayerData) {
        self.position = data.position;
        self.velocity = data.velocity;
    }
}

impl Entity for Player {
    fn pos(&self) -> Vec2d {
        self.position
    }

    fn set_pos(&mut self, pos: Vec2d) {
        self.position = pos;
    }

    fn size(&self) -> Vec2d {
        Vec2d::new(PLAYER_WIDTH, PLAYER_HEIGHT)
    }
}

/// What is persisted in `players/<uuid>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerData {
    pub name: String,
    pub position: Vec2d,
    #[serde(default)]
    pub velocity: Vec2d,
}
