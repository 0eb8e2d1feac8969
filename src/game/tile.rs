use serde::{Deserialize, Serialize};

use crate::game::index_allocator::EntityIndex;
use crate::util::position::Position;

/// Terrain trigger attached to a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Trigger {
    #[default]
    None,
    UnderRoof,
    /// NPCs may not enter or spawn here
    NoNpc,
    /// Not a legal standing position for NPCs
    InvalidPosition,
    /// No combat involving characters standing here
    SafeZone,
    /// Fights here never drop items
    Arena,
}

/// An object lying on the ground. Holds the raw definition id only; the
/// definition is looked up on demand so it always reflects current data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundObject {
    pub def_id: u16,
    pub amount: u16,
}

/// One grid cell
///
/// Static fields are persisted in the region cache. Occupant slots hold
/// entity indices and are never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tile {
    pub blocked: bool,
    pub water: bool,
    pub lava: bool,
    /// A walkable layer (bridge, pier) drawn over the water
    pub bridge: bool,
    pub trigger: Trigger,
    /// Walking onto this tile transfers the walker here
    pub exit: Option<Position>,
    /// NPC definition spawned on this tile at world load
    pub npc_spawn: Option<u16>,
    pub object: Option<GroundObject>,
    #[serde(skip)]
    pub character: Option<EntityIndex>,
    #[serde(skip)]
    pub npc: Option<EntityIndex>,
}

impl Tile {
    /// Water that can only be crossed by boat
    #[inline]
    pub fn is_navigable_water(&self) -> bool {
        self.water && !self.bridge
    }

    #[inline]
    pub fn is_occupied(&self) -> bool {
        self.character.is_some() || self.npc.is_some()
    }

    /// Terrain check for a character, ignoring occupancy
    #[inline]
    pub fn walkable_for(&self, sailing: bool) -> bool {
        !self.blocked && self.is_navigable_water() == sailing
    }

    /// Terrain check for an NPC, ignoring occupancy
    #[inline]
    pub fn walkable_for_npc(&self, aquatic: bool) -> bool {
        !self.blocked
            && !self.lava
            && self.is_navigable_water() == aquatic
            && !matches!(self.trigger, Trigger::NoNpc | Trigger::InvalidPosition)
    }

    #[inline]
    pub fn is_safe_zone(&self) -> bool {
        self.trigger == Trigger::SafeZone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_makes_water_walkable() {
        let water = Tile { water: true, ..Default::default() };
        let bridge = Tile { water: true, bridge: true, ..Default::default() };

        assert!(!water.walkable_for(false));
        assert!(water.walkable_for(true));
        assert!(bridge.walkable_for(false));
        assert!(!bridge.walkable_for(true));
    }

    #[test]
    fn test_blocked_is_never_walkable() {
        let tile = Tile { blocked: true, ..Default::default() };
        assert!(!tile.walkable_for(false));
        assert!(!tile.walkable_for_npc(false));
    }

    #[test]
    fn test_npc_triggers() {
        for trigger in [Trigger::NoNpc, Trigger::InvalidPosition] {
            let tile = Tile { trigger, ..Default::default() };
            assert!(tile.walkable_for(false));
            assert!(!tile.walkable_for_npc(false));
        }
        let lava = Tile { lava: true, ..Default::default() };
        assert!(!lava.walkable_for_npc(false));
    }
}
