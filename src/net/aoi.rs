//! Area of Interest (AOI) broadcasting
//!
//! Visibility is decided on a coarse bucket grid: a position falls into
//! bucket `(x / 9, y / 9)` and two positions see each other iff they share a
//! region and their buckets differ by at most one on each axis.
//!
//! Every function here is called with the affected region's lock held, so
//! the notifications it queues are ordered with the mutation that caused
//! them. Queuing is a non-blocking push into per-connection outboxes.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::game::constants::aoi::{BUCKETS_PER_AXIS, BUCKET_SIZE};
use crate::game::constants::grid;
use crate::game::index_allocator::{CharIndex, NpcIndex};
use crate::game::region::RegionGrid;
use crate::game::world::World;
use crate::net::protocol::{ServerPacket, TileCoord};
use crate::util::position::{Heading, Position};

// ============================================================================
// Outbox
// ============================================================================

/// Destination for server packets addressed by character index
pub trait Outbox: Send + Sync {
    /// Queue a packet for one character's connection. Never blocks.
    fn send(&self, to: CharIndex, packet: ServerPacket);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullOutbox;

impl Outbox for NullOutbox {
    fn send(&self, _to: CharIndex, _packet: ServerPacket) {}
}

/// Keeps every packet in memory, in send order
#[derive(Debug, Default)]
pub struct RecordingOutbox {
    sent: Mutex<Vec<(CharIndex, ServerPacket)>>,
}

impl RecordingOutbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take everything recorded so far
    pub fn drain(&self) -> Vec<(CharIndex, ServerPacket)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Take the packets addressed to one character
    pub fn drain_for(&self, to: CharIndex) -> Vec<ServerPacket> {
        let mut sent = self.sent.lock();
        let (mine, rest): (Vec<_>, Vec<_>) = sent.drain(..).partition(|(t, _)| *t == to);
        *sent = rest;
        mine.into_iter().map(|(_, p)| p).collect()
    }
}

impl Outbox for RecordingOutbox {
    fn send(&self, to: CharIndex, packet: ServerPacket) {
        self.sent.lock().push((to, packet));
    }
}

// ============================================================================
// Bucket math
// ============================================================================

/// Coarse visibility cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bucket {
    pub x: u8,
    pub y: u8,
}

#[inline(always)]
pub fn bucket_of(pos: &Position) -> Bucket {
    Bucket {
        x: pos.x / BUCKET_SIZE,
        y: pos.y / BUCKET_SIZE,
    }
}

/// Whether `a` and `b` are mutually visible
#[inline]
pub fn in_range(a: &Position, b: &Position) -> bool {
    if a.region != b.region {
        return false;
    }
    let ba = bucket_of(a);
    let bb = bucket_of(b);
    ba.x.abs_diff(bb.x) <= 1 && ba.y.abs_diff(bb.y) <= 1
}

/// How an observer's view of a mover changes across one relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Visible before and after
    Stay,
    Enter,
    Leave,
    /// Visible neither before nor after
    Unseen,
}

#[inline]
pub fn transition(observer: &Position, from: &Position, to: &Position) -> Transition {
    match (in_range(observer, from), in_range(observer, to)) {
        (true, true) => Transition::Stay,
        (false, true) => Transition::Enter,
        (true, false) => Transition::Leave,
        (false, false) => Transition::Unseen,
    }
}

/// Every tile visible from `center`: its bucket and the ring around it
fn visible_tiles(center: &Position) -> impl Iterator<Item = (u8, u8)> {
    let b = bucket_of(center);
    let bucket_lo = |c: u8| c.saturating_sub(1);
    let bucket_hi = |c: u8| (c + 1).min(BUCKETS_PER_AXIS - 1);
    let x_lo = bucket_lo(b.x) * BUCKET_SIZE;
    let y_lo = bucket_lo(b.y) * BUCKET_SIZE;
    let x_hi = ((bucket_hi(b.x) + 1) * BUCKET_SIZE).min(grid::WIDTH as u8);
    let y_hi = ((bucket_hi(b.y) + 1) * BUCKET_SIZE).min(grid::HEIGHT as u8);
    (y_lo..y_hi).flat_map(move |y| (x_lo..x_hi).map(move |x| (x, y)))
}

/// Tiles visible from `to` that were not visible from `from`
fn newly_visible_tiles(from: &Position, to: &Position) -> impl Iterator<Item = (u8, u8)> {
    let from = *from;
    let region = to.region;
    visible_tiles(to).filter(move |&(x, y)| !in_range(&from, &Position::new(region, x, y)))
}

/// Counts of notifications queued by one movement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveNotifications {
    pub moves: usize,
    pub enters: usize,
    pub leaves: usize,
}

// ============================================================================
// Broadcasts
// ============================================================================

/// Characters in the region that can see `center`
pub fn observers(grid: &RegionGrid, center: &Position) -> SmallVec<[CharIndex; 16]> {
    grid.characters
        .iter()
        .filter(|(_, pos)| in_range(pos, center))
        .map(|(ci, _)| *ci)
        .collect()
}

/// Send `packet` to every character that can see `center`
pub fn broadcast_area(
    world: &World,
    grid: &RegionGrid,
    center: &Position,
    packet: &ServerPacket,
    except: Option<CharIndex>,
) {
    for ci in observers(grid, center) {
        if Some(ci) != except {
            world.outbox().send(ci, packet.clone());
        }
    }
}

/// A character stepped (or was moved within its region) from `from` to `to`
///
/// Observers that keep seeing the mover get a move; observers entering or
/// leaving range get a create or remove, and the mover gets the mirror
/// notification about them. NPCs and ground objects entering the mover's
/// range are sent to the mover.
pub fn character_moved(
    world: &World,
    grid: &RegionGrid,
    mover: CharIndex,
    from: &Position,
    to: &Position,
    heading: Heading,
) -> MoveNotifications {
    let outbox = world.outbox();
    let mut counts = MoveNotifications::default();
    let mover_view = world.character_packet(mover, to);

    for (&other, other_pos) in grid.characters.iter() {
        if other == mover {
            continue;
        }
        match transition(other_pos, from, to) {
            Transition::Stay => {
                outbox.send(
                    other,
                    ServerPacket::CharacterMove {
                        index: mover,
                        at: TileCoord::from(*to),
                        heading,
                    },
                );
                counts.moves += 1;
            }
            Transition::Enter => {
                if let Some(view) = &mover_view {
                    outbox.send(other, view.clone());
                }
                if let Some(view) = world.character_packet(other, other_pos) {
                    outbox.send(mover, view);
                }
                counts.enters += 1;
            }
            Transition::Leave => {
                outbox.send(other, ServerPacket::CharacterRemove { index: mover });
                outbox.send(mover, ServerPacket::CharacterRemove { index: other });
                counts.leaves += 1;
            }
            Transition::Unseen => {}
        }
    }

    for (&npc, npc_pos) in grid.npcs.iter() {
        match transition(npc_pos, from, to) {
            Transition::Enter => {
                if let Some(view) = world.npc_packet(npc, npc_pos) {
                    outbox.send(mover, view);
                }
            }
            Transition::Leave => outbox.send(mover, ServerPacket::NpcRemove { index: npc }),
            Transition::Stay | Transition::Unseen => {}
        }
    }

    if bucket_of(from) != bucket_of(to) {
        // Objects out of view are forgotten so a later resync can't leave ghosts
        for (x, y) in newly_visible_tiles(to, from) {
            if grid.tile(x, y).object.is_some() {
                outbox.send(
                    mover,
                    ServerPacket::ObjectRemove {
                        at: TileCoord::new(x, y),
                    },
                );
            }
        }
        for (x, y) in newly_visible_tiles(from, to) {
            if let Some(packet) = world.object_packet(grid, Position::new(to.region, x, y)) {
                outbox.send(mover, packet);
            }
        }
    }

    counts
}

/// An NPC moved within one region
pub fn npc_moved(
    world: &World,
    grid: &RegionGrid,
    npc: NpcIndex,
    from: &Position,
    to: &Position,
    heading: Heading,
) {
    let outbox = world.outbox();
    let mut view = None;
    for (&ci, pos) in grid.characters.iter() {
        match transition(pos, from, to) {
            Transition::Stay => outbox.send(
                ci,
                ServerPacket::NpcMove {
                    index: npc,
                    at: TileCoord::from(*to),
                    heading,
                },
            ),
            Transition::Enter => {
                if view.is_none() {
                    view = world.npc_packet(npc, to);
                }
                if let Some(view) = &view {
                    outbox.send(ci, view.clone());
                }
            }
            Transition::Leave => outbox.send(ci, ServerPacket::NpcRemove { index: npc }),
            Transition::Unseen => {}
        }
    }
}

/// A character showed up at `at` (login, teleport arrival, region change)
pub fn character_appeared(world: &World, grid: &RegionGrid, ci: CharIndex, at: &Position) {
    if let Some(view) = world.character_packet(ci, at) {
        broadcast_area(world, grid, at, &view, Some(ci));
    }
}

pub fn character_disappeared(world: &World, grid: &RegionGrid, ci: CharIndex, at: &Position) {
    broadcast_area(
        world,
        grid,
        at,
        &ServerPacket::CharacterRemove { index: ci },
        Some(ci),
    );
}

pub fn npc_appeared(world: &World, grid: &RegionGrid, npc: NpcIndex, at: &Position) {
    if let Some(view) = world.npc_packet(npc, at) {
        broadcast_area(world, grid, at, &view, None);
    }
}

pub fn npc_disappeared(world: &World, grid: &RegionGrid, npc: NpcIndex, at: &Position) {
    broadcast_area(world, grid, at, &ServerPacket::NpcRemove { index: npc }, None);
}

/// Full resync for one character: everything currently in its range
///
/// Entities come from the region indices, which stay authoritative even
/// when a teleport overwrote a tile slot. Reserved for login, teleport and
/// region changes.
pub fn send_area_state(world: &World, grid: &RegionGrid, ci: CharIndex) {
    let Some(&center) = grid.characters.get(&ci) else {
        return;
    };
    let outbox = world.outbox();

    if let Some(own) = world.character_packet(ci, &center) {
        outbox.send(ci, own);
    }
    for (&other, pos) in grid.characters.iter() {
        if other == ci || !in_range(&center, pos) {
            continue;
        }
        if let Some(view) = world.character_packet(other, pos) {
            outbox.send(ci, view);
        }
    }
    for (&npc, pos) in grid.npcs.iter() {
        if !in_range(&center, pos) {
            continue;
        }
        if let Some(view) = world.npc_packet(npc, pos) {
            outbox.send(ci, view);
        }
    }
    for (x, y) in visible_tiles(&center) {
        if let Some(packet) = world.object_packet(grid, Position::new(center.region, x, y)) {
            outbox.send(ci, packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: u8, y: u8) -> Position {
        Position::new(1, x, y)
    }

    #[test]
    fn test_bucket_of() {
        assert_eq!(bucket_of(&p(0, 0)), Bucket { x: 0, y: 0 });
        assert_eq!(bucket_of(&p(8, 9)), Bucket { x: 0, y: 1 });
        assert_eq!(bucket_of(&p(99, 99)), Bucket { x: 11, y: 11 });
    }

    #[test]
    fn test_in_range_neighborhood() {
        let center = p(13, 13); // bucket (1, 1)
        assert!(in_range(&center, &p(0, 0)));
        assert!(in_range(&center, &p(26, 26)));
        assert!(!in_range(&center, &p(27, 13)));
        assert!(!in_range(&center, &Position::new(2, 13, 13)));
    }

    #[test]
    fn test_in_range_symmetric() {
        let points = [p(0, 0), p(9, 17), p(26, 8), p(50, 50), p(45, 58), p(99, 0)];
        for a in &points {
            for b in &points {
                assert_eq!(in_range(a, b), in_range(b, a), "{:?} {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_transition() {
        let observer = p(13, 13);
        assert_eq!(transition(&observer, &p(20, 13), &p(21, 13)), Transition::Stay);
        assert_eq!(transition(&observer, &p(26, 13), &p(27, 13)), Transition::Leave);
        assert_eq!(transition(&observer, &p(27, 13), &p(26, 13)), Transition::Enter);
        assert_eq!(transition(&observer, &p(60, 13), &p(61, 13)), Transition::Unseen);
    }

    #[test]
    fn test_newly_visible_tiles() {
        // Crossing from bucket x=1 to x=2 reveals bucket column x=3
        let tiles: Vec<_> = newly_visible_tiles(&p(17, 13), &p(18, 13)).collect();
        assert_eq!(tiles.len(), 9 * 27);
        assert!(tiles.iter().all(|(x, _)| (27..36).contains(x)));

        // Same bucket reveals nothing
        assert_eq!(newly_visible_tiles(&p(10, 10), &p(11, 10)).count(), 0);
    }

    #[test]
    fn test_recording_outbox_drain_for() {
        let outbox = RecordingOutbox::new();
        outbox.send(1, ServerPacket::Pong { timestamp: 1 });
        outbox.send(2, ServerPacket::Pong { timestamp: 2 });
        outbox.send(1, ServerPacket::Pong { timestamp: 3 });

        assert_eq!(outbox.drain_for(1).len(), 2);
        assert_eq!(outbox.drain().len(), 1);
    }
}
