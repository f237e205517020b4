use std::collections::HashMap;

use log::debug;
use noise::{NoiseFn, Seedable, SuperSimplex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::WorldGenConfig;

use super::{
    chunk::{self, ChunkRecord, CHUNK_SIZE},
    tile::TileType,
    ChunkPos,
};

const HEIGHT_CACHE_LIMIT: usize = 1 << 16;

const SALT_SURFACE: u32 = 1;
const SALT_CAVES: u32 = 2;
const SALT_ISLAND_TOP: u32 = 3;
const SALT_ISLAND_THICKNESS: u32 = 4;
const SALT_TREES: u32 = 5;

fn noise_seed(seed: u64, salt: u32) -> u32 {
    ((seed ^ (seed >> 32)) as u32).wrapping_add(salt.wrapping_mul(0x9E37_79B9))
}

/// Per-chunk RNG that only depends on the world seed and the coordinates.
fn chunk_rng(seed: u64, x: i32, y: i32, salt: u32) -> ChaCha8Rng {
    let coords = ((x as u32 as u64) << 32) | (y as u32 as u64);
    ChaCha8Rng::seed_from_u64(seed ^ coords ^ (salt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Parameters of a 1-D fractal height function.
#[derive(Debug, Clone)]
pub struct HeightmapDef {
    pub salt: u32,
    pub base: f64,
    pub amplitude: f64,
    pub scale: f64,
    pub octaves: i32,
    pub falloff: f64,
    pub lacunarity: f64,
}

/// Memoized `x -> height`, the same value for every row and every chunk of a column.
pub struct Heightmap {
    def: HeightmapDef,
    noise: SuperSimplex,
    cache: HashMap<i32, i32>,
}

impl Heightmap {
    pub fn new(seed: u64, def: HeightmapDef) -> Heightmap {
        Heightmap {
            noise: SuperSimplex::new().set_seed(noise_seed(seed, def.salt)),
            def,
            cache: HashMap::new(),
        }
    }

    pub fn height_at(&mut self, x: i32) -> i32 {
        if let Some(height) = self.cache.get(&x) {
            return *height;
        }
        if self.cache.len() >= HEIGHT_CACHE_LIMIT {
            self.cache.clear();
        }

        let height = (self.def.base + self.sample_fractal(x) * self.def.amplitude).floor() as i32;
        self.cache.insert(x, height);
        height
    }

    fn sample_fractal(&self, x: i32) -> f64 {
        let mut result = 0.0;
        let mut denom = 0.0;
        let mut scale = self.def.scale;
        let mut amplitude = 1.0;

        for _ in 0..self.def.octaves.max(1) {
            result += amplitude * self.noise.get([x as f64 * scale, 0.5]);
            denom += amplitude;
            scale *= self.def.lacunarity;
            amplitude *= self.def.falloff;
        }

        result / denom
    }
}

fn surface_def(config: &WorldGenConfig) -> HeightmapDef {
    HeightmapDef {
        salt: SALT_SURFACE,
        base: config.surface_height,
        amplitude: config.surface_amplitude,
        scale: config.surface_scale,
        octaves: config.octaves,
        falloff: config.falloff,
        lacunarity: config.lacunarity,
    }
}

/// Grass on top, a band of dirt, stone below.
pub struct GroundPhase {
    surface: Heightmap,
    dirt_depth: i32,
}

impl GroundPhase {
    pub fn new(seed: u64, config: &WorldGenConfig) -> GroundPhase {
        GroundPhase {
            surface: Heightmap::new(seed, surface_def(config)),
            dirt_depth: config.dirt_depth,
        }
    }

    fn generate_chunk(&mut self, pos: ChunkPos, record: &mut ChunkRecord) {
        let origin = pos.origin();
        for lx in 0..CHUNK_SIZE {
            let height = self.surface.height_at(origin.x.wrapping_add(lx as i32));
            for ly in 0..CHUNK_SIZE {
                let y = origin.y.wrapping_add(ly as i32);
                let tile = if y > height {
                    TileType::Air
                } else if y == height {
                    TileType::Grass
                } else if y > height - self.dirt_depth {
                    TileType::Dirt
                } else {
                    TileType::Stone
                };
                chunk::set_tile(record, lx, ly, tile);
            }
        }
    }
}

/// Carves air pockets below `depth` tiles under the surface.
pub struct CavePhase {
    seed: u64,
    surface: Heightmap,
    noise: SuperSimplex,
    scale: f64,
    threshold: f64,
    jitter: f64,
    depth: i32,
}

impl CavePhase {
    pub fn new(seed: u64, config: &WorldGenConfig) -> CavePhase {
        CavePhase {
            seed,
            surface: Heightmap::new(seed, surface_def(config)),
            noise: SuperSimplex::new().set_seed(noise_seed(seed, SALT_CAVES)),
            scale: config.cave_scale,
            threshold: config.cave_threshold,
            jitter: config.cave_jitter.abs(),
            depth: config.cave_depth.max(1),
        }
    }

    fn generate_chunk(&mut self, pos: ChunkPos, record: &mut ChunkRecord) {
        let mut rng = chunk_rng(self.seed, pos.x, pos.y, SALT_CAVES);
        let threshold = if self.jitter > 0.0 {
            self.threshold + rng.gen_range(-self.jitter..=self.jitter)
        } else {
            self.threshold
        };

        let origin = pos.origin();
        for lx in 0..CHUNK_SIZE {
            let x = origin.x.wrapping_add(lx as i32);
            let ceiling = self.surface.height_at(x) - self.depth;
            for ly in 0..CHUNK_SIZE {
                let y = origin.y.wrapping_add(ly as i32);
                if y >= ceiling {
                    continue;
                }
                let n = self.noise.get([x as f64 * self.scale, y as f64 * self.scale]);
                if n > threshold {
                    chunk::set_tile(record, lx, ly, TileType::Air);
                }
            }
        }
    }
}

/// Floating terrain in an altitude band, only where it clears the ground.
pub struct SkyIslandPhase {
    surface: Heightmap,
    top: Heightmap,
    thickness: Heightmap,
    clearance: i32,
}

impl SkyIslandPhase {
    pub fn new(seed: u64, config: &WorldGenConfig) -> SkyIslandPhase {
        let top = HeightmapDef {
            salt: SALT_ISLAND_TOP,
            base: config.island_base,
            amplitude: config.island_amplitude,
            scale: config.island_scale,
            octaves: 2,
            falloff: config.falloff,
            lacunarity: config.lacunarity,
        };
        // Negative thickness means no island in that column.
        let thickness = HeightmapDef {
            salt: SALT_ISLAND_THICKNESS,
            base: -config.island_thickness * 0.5,
            amplitude: config.island_thickness * 1.5,
            scale: config.island_scale * 1.7,
            octaves: 2,
            falloff: config.falloff,
            lacunarity: config.lacunarity,
        };
        SkyIslandPhase {
            surface: Heightmap::new(seed, surface_def(config)),
            top: Heightmap::new(seed, top),
            thickness: Heightmap::new(seed, thickness),
            clearance: config.island_clearance,
        }
    }

    fn generate_chunk(&mut self, pos: ChunkPos, record: &mut ChunkRecord) {
        let origin = pos.origin();
        for lx in 0..CHUNK_SIZE {
            let x = origin.x.wrapping_add(lx as i32);
            let thickness = self.thickness.height_at(x);
            if thickness <= 0 {
                continue;
            }
            let top = self.top.height_at(x);
            let bottom = top - thickness;
            if bottom <= self.surface.height_at(x) + self.clearance {
                continue;
            }

            for ly in 0..CHUNK_SIZE {
                let y = origin.y.wrapping_add(ly as i32);
                if y <= bottom || y > top {
                    continue;
                }
                let tile = if y == top {
                    TileType::Grass
                } else if y > top - 3 {
                    TileType::Dirt
                } else {
                    TileType::Stone
                };
                chunk::set_tile(record, lx, ly, tile);
            }
        }
    }
}

/// Tree template as `(dx, dy, tile)` from the root tile above the grass.
fn tree_template(height: i32) -> Vec<(i32, i32, TileType)> {
    let mut tiles = Vec::new();
    for dy in 0..height {
        tiles.push((0, dy, TileType::Wood));
    }
    for dy in height - 2..=height + 1 {
        let r = if dy > height { 1 } else { 2 };
        for dx in -r..=r {
            if dx != 0 || dy >= height {
                tiles.push((dx, dy, TileType::Leaves));
            }
        }
    }
    tiles
}

/// Places trees on the ground surface. A tree may be rooted in a neighboring
/// chunk column; only the part inside the current chunk is written, and only
/// into air.
pub struct DecorationPhase {
    seed: u64,
    surface: Heightmap,
    coarse: SuperSimplex,
    scale: f64,
    threshold: f64,
    template: Vec<(i32, i32, TileType)>,
}

impl DecorationPhase {
    pub fn new(seed: u64, config: &WorldGenConfig) -> DecorationPhase {
        DecorationPhase {
            seed,
            surface: Heightmap::new(seed, surface_def(config)),
            coarse: SuperSimplex::new().set_seed(noise_seed(seed, SALT_TREES)),
            scale: config.tree_scale,
            threshold: config.tree_threshold,
            template: tree_template(config.tree_height.max(3)),
        }
    }

    /// Absolute x of every tree rooted in chunk column `cx`.
    fn tree_roots(&self, cx: i32) -> Vec<i32> {
        let gate = self.coarse.get([cx as f64 * self.scale, 0.5]);
        if gate <= self.threshold {
            return Vec::new();
        }
        let mut rng = chunk_rng(self.seed, cx, 0, SALT_TREES);
        let count = if gate > self.threshold + 0.3 { 2 } else { 1 };
        let mut roots: Vec<i32> = (0..count)
            .map(|_| cx.wrapping_mul(CHUNK_SIZE as i32).wrapping_add(rng.gen_range(2..14)))
            .collect();
        roots.sort_unstable();
        roots.dedup();
        roots
    }

    fn generate_chunk(&mut self, pos: ChunkPos, record: &mut ChunkRecord) {
        let origin = pos.origin();
        let size = CHUNK_SIZE as i32;

        for cx in pos.x.saturating_sub(1)..=pos.x.saturating_add(1) {
            for root_x in self.tree_roots(cx) {
                let root_y = self.surface.height_at(root_x).saturating_add(1);
                for (dx, dy, tile) in &self.template {
                    let lx = root_x.wrapping_add(*dx).wrapping_sub(origin.x);
                    let ly = root_y.wrapping_add(*dy).wrapping_sub(origin.y);
                    if lx < 0 || ly < 0 || lx >= size || ly >= size {
                        continue;
                    }
                    let (lx, ly) = (lx as usize, ly as usize);
                    if chunk::tile_at(record, lx, ly).is_air() {
                        chunk::set_tile(record, lx, ly, *tile);
                    }
                }
            }
        }
    }
}

pub enum Phase {
    Ground(GroundPhase),
    Caves(CavePhase),
    SkyIslands(SkyIslandPhase),
    Decorations(DecorationPhase),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Ground(_) => "ground",
            Phase::Caves(_) => "caves",
            Phase::SkyIslands(_) => "sky_islands",
            Phase::Decorations(_) => "decorations",
        }
    }

    pub fn generate_chunk(&mut self, pos: ChunkPos, record: &mut ChunkRecord) {
        match self {
            Phase::Ground(p) => p.generate_chunk(pos, record),
            Phase::Caves(p) => p.generate_chunk(pos, record),
            Phase::SkyIslands(p) => p.generate_chunk(pos, record),
            Phase::Decorations(p) => p.generate_chunk(pos, record),
        }
    }

    /// Height of the named heightmap at absolute `x`, if this phase has one by that name.
    pub fn height_at(&mut self, x: i32, heightmap: &str) -> Option<i32> {
        match (self, heightmap) {
            (Phase::Ground(p), "surface") => Some(p.surface.height_at(x)),
            (Phase::SkyIslands(p), "island_top") => Some(p.top.height_at(x)),
            (Phase::SkyIslands(p), "island_thickness") => Some(p.thickness.height_at(x)),
            _ => None,
        }
    }
}

pub struct WorldGenerator {
    seed: u64,
    phases: Vec<Phase>,
}

impl WorldGenerator {
    pub fn new(seed: u64, config: &WorldGenConfig) -> WorldGenerator {
        debug!("Using seed {} for world generation", seed);

        WorldGenerator {
            seed,
            phases: vec![
                Phase::Ground(GroundPhase::new(seed, config)),
                Phase::Caves(CavePhase::new(seed, config)),
                Phase::SkyIslands(SkyIslandPhase::new(seed, config)),
                Phase::Decorations(DecorationPhase::new(seed, config)),
            ],
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn phases(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.phases.iter().map(|p| p.name())
    }

    /// Runs every phase in order over `record`. Does not touch the generated flag.
    pub fn generate(&mut self, pos: ChunkPos, record: &mut ChunkRecord) {
        for phase in &mut self.phases {
            phase.generate_chunk(pos, record);
        }
    }

    pub fn height_at(&mut self, x: i32, heightmap: &str) -> Option<i32> {
        self.phases
            .iter_mut()
            .find_map(|phase| phase.height_at(x, heightmap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::chunk::CHUNK_BYTES;

    fn generate(gen: &mut WorldGenerator, pos: ChunkPos) -> ChunkRecord {
        let mut record = [0u8; CHUNK_BYTES];
        gen.generate(pos, &mut record);
        record
    }

    #[test]
    fn generation_is_deterministic() {
        let config = WorldGenConfig::default();
        let mut a = WorldGenerator::new(1337, &config);
        let mut b = WorldGenerator::new(1337, &config);

        // Warm one generator's caches in a different order first.
        generate(&mut a, ChunkPos::new(5, 0));
        generate(&mut a, ChunkPos::new(-1, -2));

        for pos in [
            ChunkPos::new(0, 0),
            ChunkPos::new(-1, -1),
            ChunkPos::new(4, 6),
            ChunkPos::new(-30, 1),
        ] {
            assert_eq!(generate(&mut a, pos)[..], generate(&mut b, pos)[..]);
        }
    }

    #[test]
    fn extreme_coordinates_do_not_overflow() {
        let mut gen = WorldGenerator::new(3, &WorldGenConfig::default());
        for pos in [
            ChunkPos::new(i32::MAX, 0),
            ChunkPos::new(i32::MIN, i32::MAX),
            ChunkPos::new((1 << 27) + 1, -(1 << 27)),
        ] {
            generate(&mut gen, pos);
        }
    }

    #[test]
    fn different_seeds_differ() {
        let config = WorldGenConfig::default();
        let mut a = WorldGenerator::new(1, &config);
        let mut b = WorldGenerator::new(2, &config);
        let differs = (-8..8).any(|cx| {
            let pos = ChunkPos::new(cx, 0);
            generate(&mut a, pos)[..] != generate(&mut b, pos)[..]
        });
        assert!(differs);
    }

    #[test]
    fn ground_follows_the_surface_heightmap() {
        let config = WorldGenConfig::default();
        let mut gen = WorldGenerator::new(99, &config);
        let height = gen.height_at(3, "surface").unwrap();
        let pos = ChunkPos::from_tile(3, height);
        let record = generate(&mut gen, pos);
        let (lx, ly) = (3usize.rem_euclid(16), height.rem_euclid(16) as usize);

        assert_eq!(chunk::tile_at(&record, lx, ly), TileType::Grass);
        if ly > 0 {
            assert_eq!(chunk::tile_at(&record, lx, ly - 1), TileType::Dirt);
        }
    }

    #[test]
    fn deep_chunks_are_mostly_stone() {
        let config = WorldGenConfig::default();
        let mut gen = WorldGenerator::new(3, &config);
        let record = generate(&mut gen, ChunkPos::new(0, -20));
        let solid = (0..16)
            .flat_map(|x| (0..16).map(move |y| (x, y)))
            .filter(|(x, y)| chunk::tile_at(&record, *x, *y) == TileType::Stone)
            .count();
        let air = (0..16)
            .flat_map(|x| (0..16).map(move |y| (x, y)))
            .filter(|(x, y)| chunk::tile_at(&record, *x, *y) == TileType::Air)
            .count();
        assert_eq!(solid + air, 256);
        assert!(solid > 0);
    }

    #[test]
    fn unknown_heightmap_is_none() {
        let mut gen = WorldGenerator::new(3, &WorldGenConfig::default());
        assert!(gen.height_at(0, "nope").is_none());
        assert!(gen.height_at(0, "island_top").is_some());
    }

    #[test]
    fn tree_template_has_trunk_and_canopy() {
        let template = tree_template(5);
        assert!(template.contains(&(0, 0, TileType::Wood)));
        assert!(template.contains(&(0, 6, TileType::Leaves)));
        assert!(template.contains(&(-2, 3, TileType::Leaves)));
        assert!(!template.contains(&(0, 3, TileType::Leaves)));
    }

    #[test]
    fn phases_run_in_fixed_order() {
        let gen = WorldGenerator::new(0, &WorldGenConfig::default());
        let names: Vec<_> = gen.phases().collect();
        assert_eq!(names, vec!["ground", "caves", "sky_islands", "decorations"]);
    }
}
