use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use log::{debug, trace};
use memmap2::{MmapMut, MmapOptions};

use crate::error::StorageError;

use super::{
    chunk::{ChunkRecord, ChunkView, CHUNK_BYTES},
    SectionPos,
};

pub const SECTION_SIZE: usize = 16;
pub const SECTION_HEADER_BYTES: usize = 32;
pub const SECTION_BYTES: usize = SECTION_HEADER_BYTES + SECTION_SIZE * SECTION_SIZE * CHUNK_BYTES;

pub const DEFAULT_VIEW_CACHE: usize = 8;

pub fn section_file_name(pos: SectionPos) -> String {
    format!("section_{}_{}.dat", pos.x, pos.y)
}

pub fn chunk_offset(local_x: usize, local_y: usize) -> usize {
    assert!(local_x < SECTION_SIZE && local_y < SECTION_SIZE);
    SECTION_HEADER_BYTES + (local_x * SECTION_SIZE + local_y) * CHUNK_BYTES
}

/// Most-recently-used first. Dropping an entry never touches the mapped bytes.
struct ViewCache {
    capacity: usize,
    entries: VecDeque<(usize, ChunkView)>,
}

impl ViewCache {
    fn new(capacity: usize) -> ViewCache {
        ViewCache {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    fn get(&mut self, index: usize) -> Option<ChunkView> {
        let at = self.entries.iter().position(|(i, _)| *i == index)?;
        let entry = self.entries.remove(at)?;
        self.entries.push_front(entry);
        Some(entry.1)
    }

    fn insert(&mut self, index: usize, view: ChunkView) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front((index, view));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One memory-mapped section file holding 16x16 chunk records.
pub struct Section {
    id: u64,
    pos: SectionPos,
    path: PathBuf,
    file: Option<File>,
    map: Option<MmapMut>,
    views: ViewCache,
}

impl Section {
    /// Opens the section file under `dir`, creating and zero-padding it to
    /// `SECTION_BYTES` first if needed.
    pub fn open(dir: &Path, pos: SectionPos, id: u64, cache: usize) -> Result<Section, StorageError> {
        let path = dir.join(section_file_name(pos));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let len = file
            .metadata()
            .map_err(|e| StorageError::io(&path, e))?
            .len();
        if len < SECTION_BYTES as u64 {
            file.set_len(SECTION_BYTES as u64)
                .map_err(|e| StorageError::io(&path, e))?;
        }

        // SAFETY: the file is at least SECTION_BYTES long and only this process maps it.
        let map = unsafe { MmapOptions::new().len(SECTION_BYTES).map_mut(&file) }
            .map_err(|e| StorageError::io(&path, e))?;

        debug!("Opened section {:?} at {}", pos, path.display());
        Ok(Section {
            id,
            pos,
            path,
            file: Some(file),
            map: Some(map),
            views: ViewCache::new(cache),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pos(&self) -> SectionPos {
        self.pos
    }

    pub fn is_open(&self) -> bool {
        self.map.is_some()
    }

    pub fn chunk(&mut self, local_x: usize, local_y: usize) -> ChunkView {
        let index = local_x * SECTION_SIZE + local_y;
        if let Some(view) = self.views.get(index) {
            return view;
        }

        let view = ChunkView {
            section_id: self.id,
            section: self.pos,
            offset: chunk_offset(local_x, local_y),
            pos: self.pos.chunk_at(local_x, local_y),
        };
        self.views.insert(index, view);
        view
    }

    pub fn record(&self, view: ChunkView) -> Result<&ChunkRecord, StorageError> {
        let map = self.checked_map(view)?;
        Ok((&map[view.offset..view.offset + CHUNK_BYTES])
            .try_into()
            .expect("chunk slice has record length"))
    }

    pub fn record_mut(&mut self, view: ChunkView) -> Result<&mut ChunkRecord, StorageError> {
        if view.section_id != self.id {
            return Err(StorageError::StaleView(view.pos));
        }
        let map = self
            .map
            .as_mut()
            .ok_or(StorageError::StaleView(view.pos))?;
        Ok((&mut map[view.offset..view.offset + CHUNK_BYTES])
            .try_into()
            .expect("chunk slice has record length"))
    }

    fn checked_map(&self, view: ChunkView) -> Result<&MmapMut, StorageError> {
        if view.section_id != self.id {
            return Err(StorageError::StaleView(view.pos));
        }
        self.map.as_ref().ok_or(StorageError::StaleView(view.pos))
    }

    pub fn header(&self) -> Option<&[u8]> {
        self.map.as_ref().map(|m| &m[..SECTION_HEADER_BYTES])
    }

    /// Pushes dirty pages to disk. A closed section has nothing to flush.
    pub fn flush(&self) -> Result<(), StorageError> {
        match &self.map {
            Some(map) => map.flush().map_err(|e| StorageError::io(&self.path, e)),
            None => Ok(()),
        }
    }

    /// Flushes, unmaps and closes the file. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), StorageError> {
        self.views.clear();
        let flushed = self.flush();
        if self.map.take().is_some() {
            trace!("Closed section {:?}", self.pos);
        }
        self.file.take();
        flushed
    }
}

impl Drop for Section {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                log::warn!("Failed to flush section {:?} on drop: {}", self.pos, e);
            }
        }
    }
}
