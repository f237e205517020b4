use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TileType {
    Air = 0,
    Stone = 1,
    Dirt = 2,
    Grass = 3,
    Wood = 4,
    Planks = 5,
    Leaves = 6,
    Torch = 7,
    Sand = 8,
    Bricks = 9,
}

impl TileType {
    pub const ALL: [TileType; 10] = [
        TileType::Air,
        TileType::Stone,
        TileType::Dirt,
        TileType::Grass,
        TileType::Wood,
        TileType::Planks,
        TileType::Leaves,
        TileType::Torch,
        TileType::Sand,
        TileType::Bricks,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Tiles a player can stand on and that block placement volumes.
    pub fn is_solid(self) -> bool {
        !matches!(self, TileType::Air | TileType::Torch)
    }

    pub fn is_air(self) -> bool {
        self == TileType::Air
    }
}

/// Unknown ids come from newer peers or corrupted records and read as air.
impl From<u8> for TileType {
    fn from(id: u8) -> Self {
        match id {
            1 => TileType::Stone,
            2 => TileType::Dirt,
            3 => TileType::Grass,
            4 => TileType::Wood,
            5 => TileType::Planks,
            6 => TileType::Leaves,
            7 => TileType::Torch,
            8 => TileType::Sand,
            9 => TileType::Bricks,
            _ => TileType::Air,
        }
    }
}

impl Default for TileType {
    fn default() -> Self {
        TileType::Air
    }
}
