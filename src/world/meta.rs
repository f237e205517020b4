use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::info;
use serde::{de::DeserializeOwned, Serialize};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::StorageError, model::PlayerData};

use super::TilePos;

pub const META_FILE: &str = "meta.json";
pub const PLAYERS_DIR: &str = "players";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldMeta {
    pub name: String,
    pub seed: u64,
    #[serde(default)]
    pub spawn: Option<TilePos>,
}

impl WorldMeta {
    /// Loads `meta.json` under `root`, or writes a fresh one with `name` and `seed`.
    pub fn load_or_create(root: &Path, name: &str, seed: u64) -> Result<WorldMeta, StorageError> {
        let path = root.join(META_FILE);
        match read_json::<WorldMeta>(&path)? {
            Some(meta) => {
                info!("Loaded world '{}' with seed {}", meta.name, meta.seed);
                Ok(meta)
            }
            None => {
                let meta = WorldMeta {
                    name: name.to_string(),
                    seed,
                    spawn: None,
                };
                meta.save(root)?;
                info!("Created world '{}' with seed {}", meta.name, meta.seed);
                Ok(meta)
            }
        }
    }

    pub fn save(&self, root: &Path) -> Result<(), StorageError> {
        write_json(&root.join(META_FILE), self)
    }
}

pub fn player_path(root: &Path, uuid: &Uuid) -> PathBuf {
    root.join(PLAYERS_DIR).join(format!("{}.json", uuid))
}

pub fn load_player(root: &Path, uuid: &Uuid) -> Result<Option<PlayerData>, StorageError> {
    read_json(&player_path(root, uuid))
}

pub fn save_player(root: &Path, uuid: &Uuid, data: &PlayerData) -> Result<(), StorageError> {
    write_json(&player_path(root, uuid), data)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| StorageError::Metadata {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes next to the target and renames over it so a crash never leaves half a file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).map_err(|e| StorageError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Vec2d;

    fn temp_dir() -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("test_meta_{id}"));
        fs::create_dir_all(dir.join(PLAYERS_DIR)).unwrap();
        dir
    }

    #[test]
    fn existing_seed_wins() {
        let dir = temp_dir();
        let created = WorldMeta::load_or_create(&dir, "alpha", 42).unwrap();
        assert_eq!(created.seed, 42);
        let loaded = WorldMeta::load_or_create(&dir, "beta", 7).unwrap();
        assert_eq!(loaded.seed, 42);
        assert_eq!(loaded.name, "alpha");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn spawn_is_persisted() {
        let dir = temp_dir();
        let mut meta = WorldMeta::load_or_create(&dir, "w", 1).unwrap();
        meta.spawn = Some(TilePos::new(0, 17));
        meta.save(&dir).unwrap();
        let loaded = WorldMeta::load_or_create(&dir, "w", 1).unwrap();
        assert_eq!(loaded.spawn, Some(TilePos::new(0, 17)));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn player_files_round_trip() {
        let dir = temp_dir();
        let uuid = Uuid::from_u128(0x1234);
        assert_eq!(load_player(&dir, &uuid).unwrap(), None);

        let data = PlayerData {
            name: "steve".to_string(),
            position: Vec2d::new(1.5, -2.0),
            velocity: Vec2d::new(0.0, 3.0),
        };
        save_player(&dir, &uuid, &data).unwrap();
        assert_eq!(load_player(&dir, &uuid).unwrap(), Some(data));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_metadata_is_reported() {
        let dir = temp_dir();
        fs::write(dir.join(META_FILE), b"{ not json").unwrap();
        assert!(matches!(
            WorldMeta::load_or_create(&dir, "w", 1),
            Err(StorageError::Metadata { .. })
        ));
        fs::remove_dir_all(&dir).ok();
    }
}
