pub mod chunk;
pub mod gen;
pub mod math;
pub mod meta;
pub mod section;
pub mod tile;

use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use log::{debug, error, info, trace, warn};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::StorageError, model::PlayerData};

use self::{
    chunk::{ChunkRecord, ChunkView, VirtualChunk, CHUNK_BYTES},
    gen::WorldGenerator,
    meta::WorldMeta,
    section::{Section, DEFAULT_VIEW_CACHE},
};

pub use self::tile::TileType;

pub const SECTIONS_DIR: &str = "sections";

/// Tiles must lie strictly inside `±WORLD_LIMIT` on both axes. Keeps every
/// chunk, section and view-window computation well inside `i32`.
pub const WORLD_LIMIT: i32 = 1 << 26;

const SPAWN_PROBE_STEP: i32 = 16;
const SPAWN_SEARCH_LIMIT: i32 = 1 << 14;

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

impl TilePos {
    pub fn new(x: i32, y: i32) -> TilePos {
        TilePos { x, y }
    }

    pub fn from_pos(x: f64, y: f64) -> TilePos {
        TilePos::new(x.floor() as i32, y.floor() as i32)
    }

    /// The tile containing `(x, y)`, or `None` if that lies outside the world.
    pub fn checked_from_pos(x: f64, y: f64) -> Option<TilePos> {
        let limit = WORLD_LIMIT as f64;
        if x.is_finite() && y.is_finite() && x.abs() < limit && y.abs() < limit {
            Some(TilePos::from_pos(x, y))
        } else {
            None
        }
    }

    pub fn in_world(&self) -> bool {
        self.x.unsigned_abs() < WORLD_LIMIT as u32 && self.y.unsigned_abs() < WORLD_LIMIT as u32
    }

    pub fn chunk(&self) -> ChunkPos {
        ChunkPos::from_tile(self.x, self.y)
    }

    /// Position inside its chunk.
    pub fn local(&self) -> (usize, usize) {
        ((self.x & 0x0f) as usize, (self.y & 0x0f) as usize)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
}

impl ChunkPos {
    pub fn new(x: i32, y: i32) -> ChunkPos {
        ChunkPos { x, y }
    }

    pub fn from_tile(x: i32, y: i32) -> ChunkPos {
        ChunkPos::new(x >> 4, y >> 4)
    }

    pub fn offset(&self, dx: i32, dy: i32) -> ChunkPos {
        ChunkPos::new(self.x + dx, self.y + dy)
    }

    /// Wraps for chunks outside the world.
    pub fn origin(&self) -> TilePos {
        TilePos::new(self.x.wrapping_shl(4), self.y.wrapping_shl(4))
    }

    pub fn in_world(&self) -> bool {
        let limit = (WORLD_LIMIT >> 4) as u32;
        self.x.unsigned_abs() < limit && self.y.unsigned_abs() < limit
    }

    pub fn section(&self) -> SectionPos {
        SectionPos::new(self.x >> 4, self.y >> 4)
    }

    /// Position inside its section.
    pub fn local(&self) -> (usize, usize) {
        ((self.x & 0x0f) as usize, (self.y & 0x0f) as usize)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct SectionPos {
    pub x: i32,
    pub y: i32,
}

impl SectionPos {
    pub fn new(x: i32, y: i32) -> SectionPos {
        SectionPos { x, y }
    }

    pub fn chunk_at(&self, local_x: usize, local_y: usize) -> ChunkPos {
        ChunkPos::new(
            (self.x << 4) + local_x as i32,
            (self.y << 4) + local_y as i32,
        )
    }
}

/// The world store: every open section, the world metadata and player files.
///
/// All mutation goes through `&mut World`, so a chunk is generated at most
/// once without any further locking as long as one owner holds the store.
pub struct World {
    root: PathBuf,
    meta: WorldMeta,
    sections: HashMap<SectionPos, Section>,
    dirty: HashSet<SectionPos>,
    next_section_id: u64,
    chunk_cache: usize,
}

impl World {
    pub fn open(root: impl AsRef<Path>, name: &str, seed: u64) -> Result<World, StorageError> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join(SECTIONS_DIR), root.join(meta::PLAYERS_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        }
        let meta = WorldMeta::load_or_create(&root, name, seed)?;

        Ok(World {
            root,
            meta,
            sections: HashMap::new(),
            dirty: HashSet::new(),
            next_section_id: 1,
            chunk_cache: DEFAULT_VIEW_CACHE,
        })
    }

    pub fn with_chunk_cache(mut self, capacity: usize) -> World {
        self.chunk_cache = capacity.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &WorldMeta {
        &self.meta
    }

    pub fn seed(&self) -> u64 {
        self.meta.seed
    }

    fn section_mut(&mut self, pos: SectionPos) -> Result<&mut Section, StorageError> {
        match self.sections.entry(pos) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let dir = self.root.join(SECTIONS_DIR);
                let section = Section::open(&dir, pos, self.next_section_id, self.chunk_cache)?;
                self.next_section_id += 1;
                Ok(e.insert(section))
            }
        }
    }

    pub fn is_section_open(&self, pos: SectionPos) -> bool {
        self.sections.contains_key(&pos)
    }

    pub fn open_sections(&self) -> impl Iterator<Item = SectionPos> + '_ {
        self.sections.keys().copied()
    }

    /// A view of the chunk at `pos`, opening its section if necessary.
    pub fn chunk(&mut self, pos: ChunkPos) -> Result<ChunkView, StorageError> {
        let (local_x, local_y) = pos.local();
        Ok(self.section_mut(pos.section())?.chunk(local_x, local_y))
    }

    pub fn record(&self, view: ChunkView) -> Result<&ChunkRecord, StorageError> {
        self.sections
            .get(&view.section)
            .ok_or(StorageError::StaleView(view.pos))?
            .record(view)
    }

    pub fn record_mut(&mut self, view: ChunkView) -> Result<&mut ChunkRecord, StorageError> {
        let section = self
            .sections
            .get_mut(&view.section)
            .ok_or(StorageError::StaleView(view.pos))?;
        self.dirty.insert(view.section);
        section.record_mut(view)
    }

    /// A copy of the chunk's record, detached from its section.
    pub fn snapshot(&self, view: ChunkView) -> Result<VirtualChunk, StorageError> {
        Ok(VirtualChunk::from_record(view.pos, self.record(view)?))
    }

    pub fn tile_at(&mut self, x: i32, y: i32) -> Result<TileType, StorageError> {
        let pos = TilePos::new(x, y);
        let view = self.chunk(pos.chunk())?;
        let (lx, ly) = pos.local();
        Ok(chunk::tile_at(self.record(view)?, lx, ly))
    }

    /// Writes the tile without generating its chunk first.
    pub fn set_tile(&mut self, x: i32, y: i32, tile: TileType) -> Result<(), StorageError> {
        let pos = TilePos::new(x, y);
        let view = self.chunk(pos.chunk())?;
        let (lx, ly) = pos.local();
        chunk::set_tile(self.record_mut(view)?, lx, ly, tile);
        Ok(())
    }

    /// The chunk at `pos`, running the generator over it if it has never been generated.
    pub fn generated_chunk(
        &mut self,
        pos: ChunkPos,
        gen: &mut WorldGenerator,
    ) -> Result<ChunkView, StorageError> {
        let view = self.chunk(pos)?;
        if chunk::has_generated(self.record(view)?) {
            return Ok(view);
        }

        let record = self.record_mut(view)?;
        gen.generate(pos, record);
        chunk::mark_generated(record);
        trace!("Generated chunk {:?}", pos);
        Ok(view)
    }

    pub fn generated_tile_at(
        &mut self,
        x: i32,
        y: i32,
        gen: &mut WorldGenerator,
    ) -> Result<TileType, StorageError> {
        let pos = TilePos::new(x, y);
        let view = self.generated_chunk(pos.chunk(), gen)?;
        let (lx, ly) = pos.local();
        Ok(chunk::tile_at(self.record(view)?, lx, ly))
    }

    /// Overwrites the stored chunk with a record received from elsewhere.
    pub fn store_chunk(&mut self, chunk: &VirtualChunk) -> Result<ChunkView, StorageError> {
        let view = self.chunk(chunk.pos)?;
        self.record_mut(view)?.copy_from_slice(chunk.record());
        Ok(view)
    }

    /// Regenerates `pos` into a scratch record and compares it with the stored
    /// one. Only meaningful for chunks nobody has edited since generation;
    /// chunks that were never generated pass trivially.
    pub fn verify_generation(
        &mut self,
        pos: ChunkPos,
        gen: &mut WorldGenerator,
    ) -> Result<(), StorageError> {
        let view = self.chunk(pos)?;
        let stored = self.record(view)?;
        if !chunk::has_generated(stored) {
            return Ok(());
        }

        let mut fresh = [0u8; CHUNK_BYTES];
        gen.generate(pos, &mut fresh);
        chunk::mark_generated(&mut fresh);
        if fresh[..] != stored[..] {
            return Err(StorageError::GenerationDeterminismViolation { chunk: pos });
        }
        Ok(())
    }

    /// The cached spawn, or the first standing spot on the `x = 0` column.
    ///
    /// Probes in 16-tile steps from the origin until a step brackets the
    /// solid/air boundary, then walks up one tile at a time to the exact spot.
    pub fn find_spawn(&mut self, gen: &mut WorldGenerator) -> Result<TilePos, StorageError> {
        if let Some(spawn) = self.meta.spawn {
            return Ok(spawn);
        }

        let x = 0;
        let mut lo;
        let mut hi;
        if self.generated_tile_at(x, 0, gen)?.is_solid() {
            lo = 0;
            hi = SPAWN_PROBE_STEP;
            while self.generated_tile_at(x, hi, gen)?.is_solid() && hi < SPAWN_SEARCH_LIMIT {
                lo = hi;
                hi += SPAWN_PROBE_STEP;
            }
        } else {
            hi = 0;
            lo = -SPAWN_PROBE_STEP;
            while !self.generated_tile_at(x, lo, gen)?.is_solid() && lo > -SPAWN_SEARCH_LIMIT {
                hi = lo;
                lo -= SPAWN_PROBE_STEP;
            }
        }
        trace!("Spawn bracket at x={}: {}..{}", x, lo, hi);

        let mut y = lo;
        let spawn = loop {
            if y >= SPAWN_SEARCH_LIMIT {
                warn!("No spawn found below y={}, using origin", SPAWN_SEARCH_LIMIT);
                break TilePos::new(x, 0);
            }
            if self.generated_tile_at(x, y, gen)?.is_solid()
                && self.generated_tile_at(x, y + 1, gen)?.is_air()
                && self.generated_tile_at(x, y + 2, gen)?.is_air()
            {
                break TilePos::new(x, y + 1);
            }
            y += 1;
        };

        info!("World spawn is at {:?}", spawn);
        self.meta.spawn = Some(spawn);
        self.meta.save(&self.root)?;
        Ok(spawn)
    }

    /// Flushes sections written since the last call. Failures are logged and
    /// the first one is returned after every section has been tried.
    pub fn flush_dirty(&mut self) -> Result<(), StorageError> {
        let mut first_err = None;
        for pos in self.dirty.drain() {
            if let Some(section) = self.sections.get(&pos) {
                if let Err(e) = section.flush() {
                    error!("Failed to flush section {:?}: {}", pos, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn close_section(&mut self, pos: SectionPos) -> Result<(), StorageError> {
        self.dirty.remove(&pos);
        match self.sections.remove(&pos) {
            Some(mut section) => {
                debug!("Closing section {:?}", pos);
                section.close()
            }
            None => Ok(()),
        }
    }

    pub fn load_player(&self, uuid: &Uuid) -> Result<Option<PlayerData>, StorageError> {
        meta::load_player(&self.root, uuid)
    }

    pub fn save_player(&self, uuid: &Uuid, data: &PlayerData) -> Result<(), StorageError> {
        meta::save_player(&self.root, uuid, data)
    }

    /// Persists metadata and closes every section, even if some of them fail.
    pub fn close(&mut self) -> Result<(), StorageError> {
        let mut first_err = self.meta.save(&self.root).err();
        if let Some(e) = &first_err {
            error!("Failed to save world metadata: {}", e);
        }

        let open: Vec<SectionPos> = self.sections.keys().copied().collect();
        for pos in open {
            if let Err(e) = self.close_section(pos) {
                error!("Failed to close section {:?}: {}", pos, e);
                first_err.get_or_insert(e);
            }
        }
        self.dirty.clear();
        info!("Closed world '{}'", self.meta.name);
        first_err.map_or(Ok(()), Err)
    }
}
