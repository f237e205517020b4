use super::ChunkPos;

/// Chunks of the square window of side `2 * r + 1` around `center`, center first,
/// then each ring walked clockwise from its top-left corner.
pub fn spiral(center: ChunkPos, r: i32) -> Vec<ChunkPos> {
    let side = (2 * r + 1).max(1) as usize;
    let mut out = Vec::with_capacity(side * side);
    out.push(center);

    for ring in 1..=r {
        for dx in -ring..ring {
            out.push(center.offset(dx, ring));
        }
        for dy in (-ring + 1..=ring).rev() {
            out.push(center.offset(ring, dy));
        }
        for dx in (-ring + 1..=ring).rev() {
            out.push(center.offset(dx, -ring));
        }
        for dy in -ring..ring {
            out.push(center.offset(-ring, dy));
        }
    }
    out
}

pub fn dist_sq(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let dx = ax - bx;
    let dy = ay - by;
    dx * dx + dy * dy
}
