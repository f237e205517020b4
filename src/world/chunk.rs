use super::{tile::TileType, ChunkPos, SectionPos};

pub const CHUNK_SIZE: usize = 16;
pub const TILE_DATA_BYTES: usize = CHUNK_SIZE * CHUNK_SIZE * 2;
pub const CHUNK_BYTES: usize = 1024;

const GENERATED_FLAG: usize = TILE_DATA_BYTES;

/// One chunk as stored in a section file and as sent over the wire.
///
/// Bytes `0..512` hold two bytes per tile (type, light/flags) at
/// `(x * 16 + y) * 2`. Byte 512 is the generated flag, the rest is reserved.
pub type ChunkRecord = [u8; CHUNK_BYTES];

fn tile_offset(x: usize, y: usize) -> usize {
    assert!(
        x < CHUNK_SIZE && y < CHUNK_SIZE,
        "tile ({}, {}) outside of chunk",
        x,
        y
    );
    (x * CHUNK_SIZE + y) * 2
}

pub fn tile_at(record: &ChunkRecord, x: usize, y: usize) -> TileType {
    TileType::from(record[tile_offset(x, y)])
}

pub fn set_tile(record: &mut ChunkRecord, x: usize, y: usize, tile: TileType) {
    record[tile_offset(x, y)] = tile.id();
}

pub fn light_at(record: &ChunkRecord, x: usize, y: usize) -> u8 {
    record[tile_offset(x, y) + 1]
}

pub fn set_light(record: &mut ChunkRecord, x: usize, y: usize, light: u8) {
    record[tile_offset(x, y) + 1] = light;
}

pub fn has_generated(record: &ChunkRecord) -> bool {
    record[GENERATED_FLAG] != 0
}

pub fn mark_generated(record: &mut ChunkRecord) {
    record[GENERATED_FLAG] = 1;
}

/// Index of a chunk inside an open section.
///
/// A view never owns bytes; the world store resolves it against the section
/// it was handed out by and refuses it once that section has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkView {
    pub(crate) section_id: u64,
    pub(crate) section: SectionPos,
    pub(crate) offset: usize,
    pub(crate) pos: ChunkPos,
}

impl ChunkView {
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn section(&self) -> SectionPos {
        self.section
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// A chunk with its own copy of the record, as received from the network.
#[derive(Clone, PartialEq, Eq)]
pub struct VirtualChunk {
    pub pos: ChunkPos,
    data: Box<ChunkRecord>,
}

impl VirtualChunk {
    pub fn new(pos: ChunkPos) -> VirtualChunk {
        VirtualChunk {
            pos,
            data: Box::new([0; CHUNK_BYTES]),
        }
    }

    pub fn from_record(pos: ChunkPos, record: &ChunkRecord) -> VirtualChunk {
        VirtualChunk {
            pos,
            data: Box::new(*record),
        }
    }

    /// Copies `bytes` if it is exactly one chunk record long.
    pub fn from_bytes(pos: ChunkPos, bytes: &[u8]) -> Option<VirtualChunk> {
        let record: &ChunkRecord = bytes.try_into().ok()?;
        Some(Self::from_record(pos, record))
    }

    pub fn record(&self) -> &ChunkRecord {
        &self.data
    }

    pub fn record_mut(&mut self) -> &mut ChunkRecord {
        &mut self.data
    }

    pub fn tile_at(&self, x: usize, y: usize) -> TileType {
        tile_at(&self.data, x, y)
    }

    pub fn set_tile(&mut self, x: usize, y: usize, tile: TileType) {
        set_tile(&mut self.data, x, y, tile)
    }

    pub fn has_generated(&self) -> bool {
        has_generated(&self.data)
    }
}

impl std::fmt::Debug for VirtualChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualChunk")
            .field("pos", &self.pos)
            .field("generated", &self.has_generated())
            .finish()
    }
}
