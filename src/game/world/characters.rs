//! Character placement and movement

use crate::game::character::Character;
use crate::game::entity_table::Shared;
use crate::game::index_allocator::CharIndex;
use crate::game::region::RegionGrid;
use crate::net::aoi;
use crate::net::protocol::ServerPacket;
use crate::util::position::{Heading, Position, RegionId};

use super::{nearest_free_in, RegionLocks, Walker, World, WorldError, MAX_LOCK_ATTEMPTS};

/// Why a step was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveRejection {
    OutOfBounds,
    Blocked,
    /// Navigable water without a boat
    Water,
    /// Dry land while sailing
    Land,
    Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved {
        to: Position,
        /// The destination was an exit and the character was transferred
        via_exit: bool,
    },
    Rejected {
        at: Position,
        reason: MoveRejection,
    },
}

impl MoveOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, MoveOutcome::Moved { .. })
    }

    /// Where the character stands after the attempt
    pub fn position(&self) -> Position {
        match self {
            MoveOutcome::Moved { to, .. } => *to,
            MoveOutcome::Rejected { at, .. } => *at,
        }
    }
}

fn unlink_character(grid: &mut RegionGrid, ci: CharIndex) -> Option<Position> {
    let old = grid.characters.remove(&ci)?;
    let tile = grid.tile_at_mut(&old);
    if tile.character == Some(ci) {
        tile.character = None;
    }
    Some(old)
}

fn link_character(grid: &mut RegionGrid, ci: CharIndex, pos: Position) {
    grid.tile_at_mut(&pos).character = Some(ci);
    grid.characters.insert(ci, pos);
}

impl World {
    /// Register a character and give it an index. It is not placed yet.
    pub fn add_character(
        &self,
        mut character: Character,
    ) -> Result<(CharIndex, Shared<Character>), WorldError> {
        let ci = self.char_indices.assign()?;
        character.index = ci;
        let handle = self.characters.insert(ci, character);
        Ok((ci, handle))
    }

    /// Drop a character from the table and recycle its index
    ///
    /// The character must already be removed from its region.
    pub fn release_character(&self, ci: CharIndex) -> Option<Shared<Character>> {
        let handle = self.characters.remove(ci)?;
        self.char_indices.free(ci);
        Some(handle)
    }

    pub fn character_position(&self, ci: CharIndex) -> Option<Position> {
        self.characters.get(ci).map(|h| h.lock().position)
    }

    fn handle(&self, ci: CharIndex) -> Result<Shared<Character>, WorldError> {
        self.characters.get(ci).ok_or(WorldError::UnknownCharacter(ci))
    }

    /// Teleport placement at exactly `pos`
    ///
    /// Removes the character from wherever it was, displaces an NPC standing
    /// on the destination and overwrites (with a warning) another character's
    /// tile slot. The character gets a region change and a full area resync.
    pub fn place_character(&self, ci: CharIndex, pos: Position) -> Result<Position, WorldError> {
        self.place_inner(ci, pos, false)
    }

    /// Teleport placement at the nearest free tile around `pos`
    pub fn teleport_character(&self, ci: CharIndex, pos: Position) -> Result<Position, WorldError> {
        self.place_inner(ci, pos, true)
    }

    fn place_inner(
        &self,
        ci: CharIndex,
        target: Position,
        find_free: bool,
    ) -> Result<Position, WorldError> {
        if !target.in_grid() {
            return Err(WorldError::InvalidPosition(target));
        }
        let dst_region = self.region(target.region)?;
        let handle = self.handle(ci)?;

        for _ in 0..MAX_LOCK_ATTEMPTS {
            let (mirror_region, sailing) = {
                let c = handle.lock();
                (c.position.region, c.flags.sailing)
            };
            // A saved position in a region that is no longer loaded
            let src_id = if self.region(mirror_region).is_ok() {
                mirror_region
            } else {
                target.region
            };
            let mut locks = self.lock_pair(src_id, target.region)?;
            if handle.lock().position.region != mirror_region {
                continue;
            }
            let walker = Walker::Character { sailing };

            let (old, placed) = match &mut locks {
                RegionLocks::Same(grid) => {
                    let old = unlink_character(grid, ci);
                    if let Some(old) = &old {
                        aoi::character_disappeared(self, grid, ci, old);
                    }
                    let pos = self.resolve_target(grid, target, walker, find_free);
                    self.settle_character(grid, &handle, ci, pos);
                    (old, pos)
                }
                RegionLocks::Split { src, dst } => {
                    let old = unlink_character(src, ci);
                    if let Some(old) = &old {
                        aoi::character_disappeared(self, src, ci, old);
                    }
                    let pos = self.resolve_target(dst, target, walker, find_free);
                    self.settle_character(dst, &handle, ci, pos);
                    (old, pos)
                }
            };

            let grid: &RegionGrid = match &locks {
                RegionLocks::Same(grid) => &**grid,
                RegionLocks::Split { dst, .. } => &**dst,
            };
            aoi::character_appeared(self, grid, ci, &placed);
            self.send(
                ci,
                ServerPacket::ChangeRegion {
                    region: dst_region.id,
                    name: dst_region.name.clone(),
                },
            );
            aoi::send_area_state(self, grid, ci);

            tracing::debug!(
                "Character {} placed at {:?} (from {:?})",
                ci,
                placed,
                old
            );
            return Ok(placed);
        }
        Err(WorldError::Contended(ci))
    }

    fn resolve_target(
        &self,
        grid: &RegionGrid,
        target: Position,
        walker: Walker,
        find_free: bool,
    ) -> Position {
        if find_free {
            nearest_free_in(grid, &target, walker).unwrap_or(target)
        } else {
            target
        }
    }

    /// Occupy `pos` in a locked grid, clearing whatever stood in the way
    fn settle_character(
        &self,
        grid: &mut RegionGrid,
        handle: &Shared<Character>,
        ci: CharIndex,
        pos: Position,
    ) {
        let tile = grid.tile_at(&pos);
        let (npc, other) = (tile.npc, tile.character);
        if let Some(npc) = npc {
            self.displace_npc(grid, npc, pos);
        }
        if let Some(other) = other.filter(|other| *other != ci) {
            tracing::warn!(
                "Character {} placed on {:?} over character {}; overwriting tile slot",
                ci,
                pos,
                other
            );
        }
        link_character(grid, ci, pos);
        handle.lock().position = pos;
    }

    /// Take a character off the map. Returns where it stood.
    pub fn remove_character(&self, ci: CharIndex) -> Result<Option<Position>, WorldError> {
        let handle = self.handle(ci)?;
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let region_id = handle.lock().position.region;
            let Ok(region) = self.region(region_id) else {
                return Ok(None);
            };
            let mut grid = region.write();
            match unlink_character(&mut grid, ci) {
                Some(old) => {
                    aoi::character_disappeared(self, &grid, ci, &old);
                    return Ok(Some(old));
                }
                None if handle.lock().position.region == region_id => return Ok(None),
                None => continue,
            }
        }
        Err(WorldError::Contended(ci))
    }

    /// One step in `heading`
    ///
    /// Either relocates the character atomically or leaves it untouched.
    /// Stepping onto an exit transfers the character afterwards.
    pub fn move_character(&self, ci: CharIndex, heading: Heading) -> Result<MoveOutcome, WorldError> {
        let handle = self.handle(ci)?;
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let (region_id, sailing) = {
                let c = handle.lock();
                (c.position.region, c.flags.sailing)
            };
            let region = self.region(region_id)?;
            let mut grid = region.write();
            let Some(&from) = grid.characters.get(&ci) else {
                if handle.lock().position.region != region_id {
                    continue;
                }
                return Err(WorldError::NotPlaced(ci));
            };

            let to = match check_step(&grid, &from, heading, sailing) {
                Ok(to) => to,
                Err(reason) => return Ok(MoveOutcome::Rejected { at: from, reason }),
            };

            unlink_character(&mut grid, ci);
            link_character(&mut grid, ci, to);
            {
                let mut c = handle.lock();
                c.position = to;
                c.heading = heading;
            }
            aoi::character_moved(self, &grid, ci, &from, &to, heading);

            let exit = grid.tile_at(&to).exit;
            drop(grid);

            if let Some(exit) = exit {
                let landed = self.teleport_character(ci, exit)?;
                return Ok(MoveOutcome::Moved {
                    to: landed,
                    via_exit: true,
                });
            }
            return Ok(MoveOutcome::Moved {
                to,
                via_exit: false,
            });
        }
        Err(WorldError::Contended(ci))
    }

    /// Face a new direction and show it to the area
    pub fn turn_character(&self, ci: CharIndex, heading: Heading) -> Result<(), WorldError> {
        let handle = self.handle(ci)?;
        let (pos, packet) = {
            let mut c = handle.lock();
            c.heading = heading;
            (c.position, self.character_change_packet(&c))
        };
        self.broadcast_area(&pos, &packet, Some(ci));
        Ok(())
    }

    /// Re-broadcast a character's appearance to everyone around it, itself included
    pub fn refresh_character(&self, ci: CharIndex) -> Result<(), WorldError> {
        let handle = self.handle(ci)?;
        let (pos, packet) = {
            let c = handle.lock();
            (c.position, self.character_change_packet(&c))
        };
        self.broadcast_area(&pos, &packet, None);
        Ok(())
    }

    /// Region the character is currently in
    pub fn character_region(&self, ci: CharIndex) -> Result<RegionId, WorldError> {
        Ok(self.handle(ci)?.lock().position.region)
    }
}

fn check_step(
    grid: &RegionGrid,
    from: &Position,
    heading: Heading,
    sailing: bool,
) -> Result<Position, MoveRejection> {
    let to = from
        .step(heading)
        .filter(Position::in_playable_area)
        .ok_or(MoveRejection::OutOfBounds)?;
    let tile = grid.tile_at(&to);
    if tile.blocked {
        return Err(MoveRejection::Blocked);
    }
    match (tile.is_navigable_water(), sailing) {
        (true, false) => return Err(MoveRejection::Water),
        (false, true) => return Err(MoveRejection::Land),
        _ => {}
    }
    if tile.is_occupied() {
        return Err(MoveRejection::Occupied);
    }
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::game::character::Archetype;
    use crate::net::protocol::TileCoord;

    fn p(x: u8, y: u8) -> Position {
        Position::new(1, x, y)
    }

    #[test]
    fn test_place_character_sets_tile_and_index() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Aldric", p(10, 10));

        assert_eq!(world.occupants(&p(10, 10)).0, Some(ci));
        assert_eq!(world.character_position(ci), Some(p(10, 10)));
        assert!(world.region(2).unwrap().read().characters.get(&ci).is_none());
    }

    #[test]
    fn test_place_in_other_region_unlinks_old() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Aldric", p(10, 10));
        world.place_character(ci, Position::new(2, 40, 40)).unwrap();

        assert_eq!(world.occupants(&p(10, 10)).0, None);
        assert!(world.region(1).unwrap().read().characters.get(&ci).is_none());
        assert_eq!(
            world.region(2).unwrap().read().characters.get(&ci),
            Some(&Position::new(2, 40, 40))
        );
    }

    #[test]
    fn test_move_north_end_to_end() {
        let (world, outbox) = world();
        let mover = spawn_character(&world, "Mover", p(10, 10));
        let observer = spawn_character(&world, "Watcher", p(12, 12));
        outbox.drain();

        let outcome = world.move_character(mover, Heading::North).unwrap();
        assert_eq!(
            outcome,
            MoveOutcome::Moved {
                to: p(10, 9),
                via_exit: false
            }
        );
        let c = world.characters.get(mover).unwrap();
        assert_eq!(c.lock().heading, Heading::North);
        assert_eq!(c.lock().position, p(10, 9));

        let seen = outbox.drain_for(observer);
        assert_eq!(
            seen,
            vec![ServerPacket::CharacterMove {
                index: mover,
                at: TileCoord::new(10, 9),
                heading: Heading::North,
            }]
        );
    }

    #[test]
    fn test_move_into_blocked_tile_fails() {
        let (world, _) = world_with(|town, _| town.tile_mut(10, 9).blocked = true);
        let ci = spawn_character(&world, "Aldric", p(10, 10));

        let outcome = world.move_character(ci, Heading::North).unwrap();
        assert_eq!(
            outcome,
            MoveOutcome::Rejected {
                at: p(10, 10),
                reason: MoveRejection::Blocked
            }
        );
        assert_eq!(world.character_position(ci), Some(p(10, 10)));
        assert_eq!(world.occupants(&p(10, 10)).0, Some(ci));
    }

    #[test]
    fn test_water_needs_sailing() {
        let (world, _) = world_with(|town, _| {
            town.tile_mut(10, 9).water = true;
            town.tile_mut(10, 8).water = true;
            town.tile_mut(10, 8).bridge = true;
        });
        let ci = spawn_character(&world, "Aldric", p(10, 10));

        let outcome = world.move_character(ci, Heading::North).unwrap();
        assert!(matches!(
            outcome,
            MoveOutcome::Rejected {
                reason: MoveRejection::Water,
                ..
            }
        ));

        world.characters.get(ci).unwrap().lock().flags.sailing = true;
        assert!(world.move_character(ci, Heading::North).unwrap().is_moved());

        // Bridge over water counts as land
        let outcome = world.move_character(ci, Heading::North).unwrap();
        assert!(matches!(
            outcome,
            MoveOutcome::Rejected {
                reason: MoveRejection::Land,
                ..
            }
        ));
    }

    #[test]
    fn test_move_outside_playable_area() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Edge", p(8, 50));
        let outcome = world.move_character(ci, Heading::West).unwrap();
        assert!(matches!(
            outcome,
            MoveOutcome::Rejected {
                reason: MoveRejection::OutOfBounds,
                ..
            }
        ));
    }

    #[test]
    fn test_move_into_occupied_tile_fails() {
        let (world, _) = world();
        let a = spawn_character(&world, "Aaa", p(10, 10));
        spawn_character(&world, "Bbb", p(10, 9));
        let outcome = world.move_character(a, Heading::North).unwrap();
        assert!(matches!(
            outcome,
            MoveOutcome::Rejected {
                reason: MoveRejection::Occupied,
                ..
            }
        ));
    }

    #[test]
    fn test_leaving_range_sends_one_remove_then_nothing() {
        let (world, outbox) = world();
        // Observer in bucket (1, 1); mover walks east from bucket (2, 1) to (3, 1)
        let observer = spawn_character(&world, "Watcher", p(13, 13));
        let mover = spawn_character(&world, "Walker", p(26, 13));
        outbox.drain();

        world.move_character(mover, Heading::East).unwrap();
        world.move_character(mover, Heading::East).unwrap();

        let seen = outbox.drain_for(observer);
        assert_eq!(seen, vec![ServerPacket::CharacterRemove { index: mover }]);
        let mover_seen = outbox.drain_for(mover);
        assert!(mover_seen.contains(&ServerPacket::CharacterRemove { index: observer }));
    }

    #[test]
    fn test_entering_range_is_symmetric() {
        let (world, outbox) = world();
        let observer = spawn_character(&world, "Watcher", p(13, 13));
        let mover = spawn_character(&world, "Walker", p(27, 13));
        outbox.drain();

        world.move_character(mover, Heading::West).unwrap();

        let seen = outbox.drain_for(observer);
        assert!(matches!(
            seen.as_slice(),
            [ServerPacket::CharacterCreate(view)] if view.index == mover
        ));
        let mover_seen = outbox.drain_for(mover);
        assert!(mover_seen.iter().any(
            |p| matches!(p, ServerPacket::CharacterCreate(view) if view.index == observer)
        ));
    }

    #[test]
    fn test_exit_transfers_character() {
        let (world, outbox) = world_with(|town, _| {
            town.tile_mut(10, 9).exit = Some(Position::new(2, 50, 50));
        });
        let ci = spawn_character(&world, "Traveler", p(10, 10));
        outbox.drain();

        let outcome = world.move_character(ci, Heading::North).unwrap();
        assert_eq!(
            outcome,
            MoveOutcome::Moved {
                to: Position::new(2, 50, 50),
                via_exit: true
            }
        );
        assert_eq!(world.occupants(&p(10, 9)).0, None);
        let sent = outbox.drain_for(ci);
        assert!(sent.contains(&ServerPacket::ChangeRegion {
            region: 2,
            name: "Field".into()
        }));
    }

    #[test]
    fn test_teleport_onto_character_overwrites_slot_only() {
        let (world, _) = world();
        let a = spawn_character(&world, "Aaa", p(20, 20));
        let b = spawn_character(&world, "Bbb", p(30, 30));
        world.place_character(b, p(20, 20)).unwrap();

        assert_eq!(world.occupants(&p(20, 20)).0, Some(b));
        // `a` keeps its index entry
        let region = world.region(1).unwrap().read();
        assert_eq!(region.characters.get(&a), Some(&p(20, 20)));
        assert_eq!(region.characters.get(&b), Some(&p(20, 20)));
    }

    #[test]
    fn test_teleport_finds_free_tile() {
        let (world, _) = world();
        spawn_character(&world, "Aaa", p(20, 20));
        let b = spawn_character(&world, "Bbb", p(30, 30));
        let landed = world.teleport_character(b, p(20, 20)).unwrap();
        assert_eq!(landed.distance(&p(20, 20)), 1);
    }

    #[test]
    fn test_remove_and_release() {
        let (world, outbox) = world();
        let observer = spawn_character(&world, "Watcher", p(13, 13));
        let ci = spawn_character(&world, "Leaver", p(14, 13));
        outbox.drain();

        assert_eq!(world.remove_character(ci).unwrap(), Some(p(14, 13)));
        assert_eq!(world.remove_character(ci).unwrap(), None);
        assert!(world.release_character(ci).is_some());
        assert!(world.release_character(ci).is_none());

        assert_eq!(
            outbox.drain_for(observer),
            vec![ServerPacket::CharacterRemove { index: ci }]
        );
        assert_eq!(world.occupants(&p(14, 13)).0, None);
    }

    #[test]
    fn test_login_resync_lists_neighbors() {
        let (world, outbox) = world();
        let other = spawn_character(&world, "Other", p(12, 12));
        outbox.drain();
        let c = Character::new("New", Archetype::Mage, 1, 1, 1, p(10, 10));
        let (ci, _) = world.add_character(c).unwrap();
        world.place_character(ci, p(10, 10)).unwrap();

        let sent = outbox.drain_for(ci);
        assert!(matches!(sent[0], ServerPacket::ChangeRegion { region: 1, .. }));
        assert!(sent
            .iter()
            .any(|p| matches!(p, ServerPacket::CharacterCreate(v) if v.index == other)));
        assert!(sent
            .iter()
            .any(|p| matches!(p, ServerPacket::CharacterCreate(v) if v.index == ci)));
        assert!(matches!(
            outbox.drain_for(other).as_slice(),
            [ServerPacket::CharacterCreate(v)] if v.index == ci
        ));
    }

    #[test]
    fn test_resync_lists_character_under_overwritten_slot() {
        let (world, outbox) = world();
        let a = spawn_character(&world, "Aaa", p(20, 20));
        let b = spawn_character(&world, "Bbb", p(30, 30));
        world.place_character(b, p(20, 20)).unwrap();
        outbox.drain();

        let c = spawn_character(&world, "Ccc", p(22, 22));
        let sent = outbox.drain_for(c);
        for index in [a, b] {
            assert!(sent
                .iter()
                .any(|pk| matches!(pk, ServerPacket::CharacterCreate(v) if v.index == index)));
        }
    }

    #[test]
    fn test_objects_leaving_view_are_removed() {
        let (world, outbox) = world();
        world
            .place_object(p(10, 50), crate::game::tile::GroundObject { def_id: 1, amount: 1 })
            .unwrap();
        world
            .place_object(p(40, 50), crate::game::tile::GroundObject { def_id: 9, amount: 1 })
            .unwrap();
        let ci = spawn_character(&world, "Walker", p(26, 50));
        outbox.drain();

        // Bucket column 1 drops out of view, column 4 comes in
        assert!(world.move_character(ci, Heading::East).unwrap().is_moved());
        let sent = outbox.drain_for(ci);
        assert!(sent.contains(&ServerPacket::ObjectRemove {
            at: TileCoord::new(10, 50)
        }));
        assert!(sent
            .iter()
            .any(|pk| matches!(pk, ServerPacket::ObjectCreate { at, .. } if *at == TileCoord::new(40, 50))));
        assert!(!sent
            .iter()
            .any(|pk| matches!(pk, ServerPacket::ObjectRemove { at } if *at == TileCoord::new(40, 50))));
    }
}
