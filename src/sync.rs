use std::collections::HashSet;

use crate::{
    model::{Bounds, Entity, Player},
    world::{math, ChunkPos, SectionPos, TilePos, TileType},
};

/// Lifecycle of a viewer on the world thread. The handshake before it is
/// owned by the connection task, so a viewer starts out authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    Authenticated,
    Synchronized,
    Disconnecting,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct WindowChange {
    /// Spiral order, nearest first.
    pub load: Vec<ChunkPos>,
    pub unload: Vec<ChunkPos>,
}

/// Authority-side record of one viewer and the chunks it has been sent.
#[derive(Debug)]
pub struct Viewer {
    pub id: u32,
    pub player: Player,
    state: ViewerState,
    center: Option<ChunkPos>,
    tracked: HashSet<ChunkPos>,
}

impl Viewer {
    pub fn new(id: u32, player: Player) -> Viewer {
        Viewer {
            id,
            player,
            state: ViewerState::Authenticated,
            center: None,
            tracked: HashSet::new(),
        }
    }

    pub fn state(&self) -> ViewerState {
        self.state
    }

    pub fn tracks(&self, pos: ChunkPos) -> bool {
        self.tracked.contains(&pos)
    }

    pub fn tracked(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.tracked.iter().copied()
    }

    /// Diffs the window around `center` against the tracked set. Returns
    /// `None` when already synchronized around the same chunk. Unloaded
    /// chunks are dropped here; loaded ones are tracked once `mark_loaded`
    /// confirms they were sent.
    pub fn update_window(&mut self, center: ChunkPos, view_dist: i32) -> Option<WindowChange> {
        if self.state == ViewerState::Disconnecting {
            return None;
        }
        if self.state == ViewerState::Synchronized && self.center == Some(center) {
            return None;
        }
        self.center = Some(center);

        let window = math::spiral(center, view_dist);
        let wanted: HashSet<ChunkPos> = window.iter().copied().collect();
        let load: Vec<ChunkPos> = window
            .into_iter()
            .filter(|pos| !self.tracked.contains(pos))
            .collect();
        let mut unload: Vec<ChunkPos> = self
            .tracked
            .iter()
            .filter(|pos| !wanted.contains(pos))
            .copied()
            .collect();
        unload.sort_unstable();

        for pos in &unload {
            self.tracked.remove(pos);
        }
        Some(WindowChange { load, unload })
    }

    pub fn mark_loaded(&mut self, pos: ChunkPos) {
        self.tracked.insert(pos);
    }

    pub fn synchronize(&mut self) {
        if self.state == ViewerState::Authenticated {
            self.state = ViewerState::Synchronized;
        }
    }

    pub fn disconnect(&mut self) {
        self.state = ViewerState::Disconnecting;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OutOfReach,
    Obstructed,
}

/// A rejected edit is a normal result: the editor gets the real tile back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Applied,
    Rejected(RejectReason),
}

/// Inclusive: a tile exactly `reach_sq` away is reachable.
pub fn within_reach(player: &Player, target: TilePos, reach_sq: f64) -> bool {
    let pos = player.pos();
    math::dist_sq(pos.x, pos.y, target.x as f64, target.y as f64) <= reach_sq
}

/// Breaking only checks reach. Placing also requires the tile to be free of
/// every occupant's bounding box.
pub fn validate_edit(
    editor: &Player,
    target: TilePos,
    tile: TileType,
    reach_sq: f64,
    mut occupants: impl Iterator<Item = Bounds>,
) -> EditOutcome {
    if !within_reach(editor, target, reach_sq) {
        return EditOutcome::Rejected(RejectReason::OutOfReach);
    }

    if !tile.is_air() {
        let tile_bounds = Bounds::of_tile(target);
        if occupants.any(|b| b.intersects(&tile_bounds)) {
            return EditOutcome::Rejected(RejectReason::Obstructed);
        }
    }
    EditOutcome::Applied
}

/// Every section holding at least one tracked chunk of any viewer.
pub fn referenced_sections<'a>(viewers: impl Iterator<Item = &'a Viewer>) -> HashSet<SectionPos> {
    viewers
        .flat_map(|viewer| viewer.tracked().map(|pos| pos.section()))
        .collect()
}

/// Open sections that no viewer references any more.
pub fn unreferenced_sections(
    open: impl Iterator<Item = SectionPos>,
    referenced: &HashSet<SectionPos>,
) -> Vec<SectionPos> {
    let mut out: Vec<SectionPos> = open.filter(|pos| !referenced.contains(pos)).collect();
    out.sort_unstable();
    out
}
