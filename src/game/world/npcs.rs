//! NPC placement and movement

use rand::Rng;

use crate::game::constants::{grid, spawn};
use crate::game::definitions::NpcDef;
use crate::game::index_allocator::NpcIndex;
use crate::game::npc::WorldNpc;
use crate::game::region::RegionGrid;
use crate::net::aoi;
use crate::net::protocol::ServerPacket;
use crate::util::position::{Heading, Position, RegionId};

use super::{nearest_free_in, nearest_matching, RegionLocks, Walker, World, WorldError, MAX_LOCK_ATTEMPTS};

fn unlink_npc(grid: &mut RegionGrid, ni: NpcIndex) -> Option<Position> {
    let old = grid.npcs.remove(&ni)?;
    let tile = grid.tile_at_mut(&old);
    if tile.npc == Some(ni) {
        tile.npc = None;
    }
    Some(old)
}

fn link_npc(grid: &mut RegionGrid, ni: NpcIndex, pos: Position) {
    grid.tile_at_mut(&pos).npc = Some(ni);
    grid.npcs.insert(ni, pos);
}

impl World {
    fn npc_def(&self, def_id: u16) -> Result<&NpcDef, WorldError> {
        self.definitions()
            .npc(def_id)
            .ok_or(WorldError::UnknownNpcDef(def_id))
    }

    pub fn npc_position(&self, ni: NpcIndex) -> Option<Position> {
        self.npcs.get(ni).map(|h| h.lock().position)
    }

    /// Walker profile for a live NPC
    fn npc_walker(&self, ni: NpcIndex) -> Walker {
        let aquatic = self
            .npcs
            .get(ni)
            .and_then(|h| self.definitions().npc(h.lock().def_id).map(|d| d.aquatic))
            .unwrap_or(false);
        Walker::Npc { aquatic }
    }

    /// Create an NPC on a tile of an already locked grid
    fn spawn_locked(
        &self,
        grid: &mut RegionGrid,
        def: &NpcDef,
        pos: Position,
    ) -> Result<NpcIndex, WorldError> {
        let ni = self.npc_indices.assign()?;
        self.npcs.insert(ni, WorldNpc::from_def(def, ni, pos));
        link_npc(grid, ni, pos);
        aoi::npc_appeared(self, grid, ni, &pos);
        tracing::debug!("Spawned NPC {} ({}) at {:?}", ni, def.name, pos);
        Ok(ni)
    }

    /// Spawn exactly on `pos`
    pub fn spawn_npc(&self, def_id: u16, pos: Position) -> Result<NpcIndex, WorldError> {
        let def = self.npc_def(def_id)?;
        if !pos.in_playable_area() {
            return Err(WorldError::InvalidPosition(pos));
        }
        let mut grid = self.region(pos.region)?.write();
        let walker = Walker::Npc {
            aquatic: def.aquatic,
        };
        if !walker.can_stand(grid.tile_at(&pos)) {
            return Err(WorldError::TileUnavailable(pos));
        }
        self.spawn_locked(&mut grid, def, pos)
    }

    /// Spawn on the free tile closest to `pos`
    pub fn spawn_npc_near(&self, def_id: u16, pos: Position) -> Result<NpcIndex, WorldError> {
        let def = self.npc_def(def_id)?;
        let mut grid = self.region(pos.region)?.write();
        let walker = Walker::Npc {
            aquatic: def.aquatic,
        };
        let at = nearest_free_in(&grid, &pos, walker).ok_or(WorldError::NoFreeTile(pos.region))?;
        self.spawn_locked(&mut grid, def, at)
    }

    /// Spawn on a random legal tile of `region`
    pub fn spawn_npc_in_region<R: Rng + ?Sized>(
        &self,
        def_id: u16,
        region: RegionId,
        rng: &mut R,
    ) -> Result<NpcIndex, WorldError> {
        let def = self.npc_def(def_id)?;
        let mut grid = self.region(region)?.write();
        let walker = Walker::Npc {
            aquatic: def.aquatic,
        };
        for _ in 0..spawn::MAX_SPAWN_ATTEMPTS {
            let pos = Position::new(
                region,
                rng.gen_range(grid::MIN_X..=grid::MAX_X),
                rng.gen_range(grid::MIN_Y..=grid::MAX_Y),
            );
            if walker.can_stand(grid.tile_at(&pos)) {
                return self.spawn_locked(&mut grid, def, pos);
            }
        }
        Err(WorldError::NoFreeTile(region))
    }

    /// Spawn every NPC listed on region tiles. Returns how many were placed.
    pub fn spawn_static_npcs(&self) -> usize {
        let mut spawned = 0;
        for id in self.region_ids() {
            let spawns: Vec<(Position, u16)> = match self.region(id) {
                Ok(region) => region
                    .read()
                    .tiles()
                    .filter_map(|(x, y, t)| t.npc_spawn.map(|def| (Position::new(id, x, y), def)))
                    .collect(),
                Err(_) => continue,
            };
            for (pos, def_id) in spawns {
                match self.spawn_npc(def_id, pos) {
                    Ok(_) => spawned += 1,
                    Err(e) => tracing::warn!("Map spawn of NPC {} at {:?} failed: {}", def_id, pos, e),
                }
            }
        }
        spawned
    }

    /// Unlink, broadcast and drop an NPC while its grid is locked
    fn despawn_locked(&self, grid: &mut RegionGrid, ni: NpcIndex) {
        if let Some(old) = unlink_npc(grid, ni) {
            aoi::npc_disappeared(self, grid, ni, &old);
        }
        self.forget_npc(ni);
    }

    /// Drop a no-longer-placed NPC from the table and its owner's pet list
    fn forget_npc(&self, ni: NpcIndex) {
        let Some(handle) = self.npcs.remove(ni) else {
            return;
        };
        self.npc_indices.free(ni);
        let owner = handle.lock().owner;
        if let Some(pet_owner) = owner.and_then(|ci| self.characters.get(ci)) {
            pet_owner.lock().pets.retain(|pet| *pet != ni);
        }
    }

    /// Take an NPC off the map without freeing its index
    pub fn remove_npc(&self, ni: NpcIndex) -> Result<Option<Position>, WorldError> {
        let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let region_id = handle.lock().position.region;
            let Ok(region) = self.region(region_id) else {
                return Ok(None);
            };
            let mut grid = region.write();
            match unlink_npc(&mut grid, ni) {
                Some(old) => {
                    aoi::npc_disappeared(self, &grid, ni, &old);
                    return Ok(Some(old));
                }
                None if handle.lock().position.region == region_id => return Ok(None),
                None => continue,
            }
        }
        Err(WorldError::Contended(ni))
    }

    /// Remove an NPC from the world entirely and recycle its index
    pub fn despawn_npc(&self, ni: NpcIndex) -> Result<(), WorldError> {
        self.remove_npc(ni)?;
        self.forget_npc(ni);
        Ok(())
    }

    /// Make room on `pos` by moving its NPC to the closest free tile
    ///
    /// Despawns the NPC when nothing is free nearby.
    pub(crate) fn displace_npc(&self, grid: &mut RegionGrid, ni: NpcIndex, pos: Position) {
        let walker = self.npc_walker(ni);
        let target = nearest_matching(&pos, |p| *p != pos && walker.can_stand(grid.tile_at(p)));
        match (target, self.npcs.get(ni)) {
            (Some(to), Some(handle)) => {
                unlink_npc(grid, ni);
                link_npc(grid, ni, to);
                let heading = {
                    let mut npc = handle.lock();
                    npc.position = to;
                    npc.heading
                };
                aoi::npc_moved(self, grid, ni, &pos, &to, heading);
                tracing::debug!("NPC {} displaced from {:?} to {:?}", ni, pos, to);
            }
            _ => {
                tracing::debug!("NPC {} on {:?} has nowhere to go; despawning", ni, pos);
                self.despawn_locked(grid, ni);
            }
        }
    }

    /// One step in `heading`. Returns false when the destination is not legal.
    pub fn move_npc(&self, ni: NpcIndex, heading: Heading) -> Result<bool, WorldError> {
        let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        let walker = self.npc_walker(ni);
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let region_id = handle.lock().position.region;
            let mut grid = self.region(region_id)?.write();
            let Some(&from) = grid.npcs.get(&ni) else {
                if handle.lock().position.region != region_id {
                    continue;
                }
                return Err(WorldError::NotPlaced(ni));
            };
            let Some(to) = from.step(heading).filter(Position::in_playable_area) else {
                return Ok(false);
            };
            if !walker.can_stand(grid.tile_at(&to)) {
                return Ok(false);
            }

            unlink_npc(&mut grid, ni);
            link_npc(&mut grid, ni, to);
            {
                let mut npc = handle.lock();
                npc.position = to;
                npc.heading = heading;
            }
            aoi::npc_moved(self, &grid, ni, &from, &to, heading);
            return Ok(true);
        }
        Err(WorldError::Contended(ni))
    }

    /// Relocate an NPC to the free tile closest to `pos`, possibly in another region
    pub fn place_npc_near(&self, ni: NpcIndex, pos: Position) -> Result<Position, WorldError> {
        let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        let walker = self.npc_walker(ni);
        self.region(pos.region)?;
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let mirror = handle.lock().position.region;
            let src_id = if self.region(mirror).is_ok() { mirror } else { pos.region };
            let mut locks = self.lock_pair(src_id, pos.region)?;
            if handle.lock().position.region != mirror {
                continue;
            }
            let placed = match &mut locks {
                RegionLocks::Same(grid) => {
                    let to = nearest_free_in(grid, &pos, walker)
                        .ok_or(WorldError::NoFreeTile(pos.region))?;
                    if let Some(old) = unlink_npc(grid, ni) {
                        aoi::npc_disappeared(self, grid, ni, &old);
                    }
                    link_npc(grid, ni, to);
                    handle.lock().position = to;
                    aoi::npc_appeared(self, grid, ni, &to);
                    to
                }
                RegionLocks::Split { src, dst } => {
                    let to = nearest_free_in(dst, &pos, walker)
                        .ok_or(WorldError::NoFreeTile(pos.region))?;
                    if let Some(old) = unlink_npc(src, ni) {
                        aoi::npc_disappeared(self, src, ni, &old);
                    }
                    link_npc(dst, ni, to);
                    handle.lock().position = to;
                    aoi::npc_appeared(self, dst, ni, &to);
                    to
                }
            };
            return Ok(placed);
        }
        Err(WorldError::Contended(ni))
    }

    pub fn turn_npc(&self, ni: NpcIndex, heading: Heading) -> Result<(), WorldError> {
        let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        let pos = {
            let mut npc = handle.lock();
            npc.heading = heading;
            npc.position
        };
        self.broadcast_area(&pos, &ServerPacket::NpcHeading { index: ni, heading }, None);
        Ok(())
    }
}
