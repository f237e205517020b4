use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use indoc::indoc;
use log::info;
use serde_derive::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG: &str = indoc! {r#"
    bind = "0.0.0.0:7777"
    world_dir = "world"
    world_name = "world"
    # seed = 1234
    view_dist = 4
    offline = true
    tick_ms = 50
    gc_interval_secs = 10
    keep_alive_secs = 5
    timeout_secs = 30
    handshake_timeout_secs = 5
    reach = 8.0
    chunk_cache = 8

    [worldgen]
    surface_height = 0.0
    surface_amplitude = 24.0
    surface_scale = 0.008
    octaves = 4
    falloff = 0.5
    lacunarity = 2.0
    dirt_depth = 4
    cave_depth = 10
    cave_scale = 0.06
    cave_threshold = 0.45
    cave_jitter = 0.03
    island_base = 96.0
    island_amplitude = 8.0
    island_scale = 0.02
    island_thickness = 12.0
    island_clearance = 16
    tree_scale = 0.37
    tree_threshold = 0.1
    tree_height = 5
"#};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub world_dir: PathBuf,
    pub world_name: String,
    pub seed: Option<u64>,
    pub view_dist: i32,
    pub offline: bool,
    pub tick_ms: u64,
    pub gc_interval_secs: u64,
    pub keep_alive_secs: u64,
    pub timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub reach: f64,
    pub chunk_cache: usize,
    pub worldgen: WorldGenConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:7777".to_string(),
            world_dir: PathBuf::from("world"),
            world_name: "world".to_string(),
            seed: None,
            view_dist: 4,
            offline: true,
            tick_ms: 50,
            gc_interval_secs: 10,
            keep_alive_secs: 5,
            timeout_secs: 30,
            handshake_timeout_secs: 5,
            reach: 8.0,
            chunk_cache: 8,
            worldgen: WorldGenConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads `path`, writing the default config there first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<ServerConfig, ConfigError> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No config at {}, writing defaults", path.display());
                fs::write(path, DEFAULT_CONFIG).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                DEFAULT_CONFIG.to_string()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(data: &str) -> Result<ServerConfig, toml::de::Error> {
        toml::from_str::<ServerConfig>(data)
    }

    /// Reach is compared against squared distances.
    pub fn reach_sq(&self) -> f64 {
        self.reach * self.reach
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorldGenConfig {
    pub surface_height: f64,
    pub surface_amplitude: f64,
    pub surface_scale: f64,
    pub octaves: i32,
    pub falloff: f64,
    pub lacunarity: f64,
    pub dirt_depth: i32,
    pub cave_depth: i32,
    pub cave_scale: f64,
    pub cave_threshold: f64,
    pub cave_jitter: f64,
    pub island_base: f64,
    pub island_amplitude: f64,
    pub island_scale: f64,
    pub island_thickness: f64,
    pub island_clearance: i32,
    pub tree_scale: f64,
    pub tree_threshold: f64,
    pub tree_height: i32,
}

impl Default for WorldGenConfig {
    fn default() -> Self {
        WorldGenConfig {
            surface_height: 0.0,
            surface_amplitude: 24.0,
            surface_scale: 0.008,
            octaves: 4,
            falloff: 0.5,
            lacunarity: 2.0,
            dirt_depth: 4,
            cave_depth: 10,
            cave_scale: 0.06,
            cave_threshold: 0.45,
            cave_jitter: 0.03,
            island_base: 96.0,
            island_amplitude: 8.0,
            island_scale: 0.02,
            island_thickness: 12.0,
            island_clearance: 16,
            tree_scale: 0.37,
            tree_threshold: 0.1,
            tree_height: 5,
        }
    }
}
