//! Ground objects

use crate::game::constants::character::MAX_STACK;
use crate::game::tile::{GroundObject, Tile, Trigger};
use crate::net::aoi;
use crate::net::protocol::{ServerPacket, TileCoord};
use crate::util::position::Position;

use super::{nearest_matching, World, WorldError};

/// Tiles that can hold a dropped object
fn can_hold_object(tile: &Tile) -> bool {
    !tile.blocked
        && !tile.is_navigable_water()
        && tile.object.is_none()
        && tile.trigger != Trigger::InvalidPosition
}

impl World {
    pub fn object_at(&self, pos: &Position) -> Option<GroundObject> {
        self.tile(pos).ok().and_then(|t| t.object)
    }

    /// Put an object on exactly `pos`
    pub fn place_object(&self, pos: Position, object: GroundObject) -> Result<(), WorldError> {
        if !pos.in_grid() {
            return Err(WorldError::InvalidPosition(pos));
        }
        let mut grid = self.region(pos.region)?.write();
        let tile = grid.tile_at_mut(&pos);
        if tile.blocked || tile.object.is_some() {
            return Err(WorldError::TileUnavailable(pos));
        }
        tile.object = Some(object);
        if let Some(packet) = self.object_packet(&grid, pos) {
            aoi::broadcast_area(self, &grid, &pos, &packet, None);
        }
        Ok(())
    }

    /// Clear `pos`, returning what lay there
    pub fn remove_object(&self, pos: &Position) -> Result<Option<GroundObject>, WorldError> {
        self.take_object(pos, u16::MAX)
    }

    /// Take up to `max` units from the stack on `pos`
    ///
    /// The tile is cleared (and the area told) once the stack runs out.
    pub fn take_object(&self, pos: &Position, max: u16) -> Result<Option<GroundObject>, WorldError> {
        if !pos.in_grid() {
            return Err(WorldError::InvalidPosition(*pos));
        }
        let mut grid = self.region(pos.region)?.write();
        let tile = grid.tile_at_mut(pos);
        let Some(ground) = tile.object.as_mut() else {
            return Ok(None);
        };
        let taken = ground.amount.min(max);
        ground.amount -= taken;
        let def_id = ground.def_id;
        if ground.amount == 0 {
            tile.object = None;
            aoi::broadcast_area(
                self,
                &grid,
                pos,
                &ServerPacket::ObjectRemove {
                    at: TileCoord::from(*pos),
                },
                None,
            );
        }
        Ok(Some(GroundObject {
            def_id,
            amount: taken,
        }))
    }

    /// Drop an object at `pos`, or on the closest tile that can take it
    ///
    /// Stacks onto an identical object already lying on `pos` when it fits.
    pub fn drop_object_near(&self, pos: Position, object: GroundObject) -> Result<Position, WorldError> {
        if !pos.in_grid() {
            return Err(WorldError::InvalidPosition(pos));
        }
        let mut grid = self.region(pos.region)?.write();
        if let Some(ground) = grid.tile_at_mut(&pos).object.as_mut() {
            if ground.def_id == object.def_id
                && u32::from(ground.amount) + u32::from(object.amount) <= u32::from(MAX_STACK)
            {
                ground.amount += object.amount;
                return Ok(pos);
            }
        }
        let at = nearest_matching(&pos, |p| can_hold_object(grid.tile_at(p)))
            .ok_or(WorldError::NoFreeTile(pos.region))?;
        grid.tile_at_mut(&at).object = Some(object);
        if let Some(packet) = self.object_packet(&grid, at) {
            aoi::broadcast_area(self, &grid, &at, &packet, None);
        }
        Ok(at)
    }
}
