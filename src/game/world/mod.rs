//! World state store
//!
//! Owns every region and the dense entity tables. Regions hold entity
//! indices plus authoritative positions; the `Character`/`WorldNpc` structs
//! mirror their position and are only updated while the region lock is held.
//!
//! Lock order: region grids by ascending id, then entity tables, then entity
//! mutexes. No code path acquires a region lock while holding an entity
//! mutex.

mod admin;
mod characters;
mod npcs;
mod objects;

pub use admin::{OnlineCharacter, RegionOccupancy, WorldSummary};
pub use characters::{MoveOutcome, MoveRejection};

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLockWriteGuard;

use crate::game::character::{Character, LevelTable};
use crate::game::constants::{grid, spawn};
use crate::game::definitions::DefinitionStore;
use crate::game::entity_table::EntityTable;
use crate::game::index_allocator::{CharIndex, IndexAllocator, IndexError, NpcIndex};
use crate::game::intervals::IntervalConfig;
use crate::game::npc::WorldNpc;
use crate::game::region::{Region, RegionGrid};
use crate::game::respawn_queue::RespawnQueue;
use crate::game::tile::Tile;
use crate::net::aoi::{self, Outbox};
use crate::net::protocol::{CharacterView, Font, NpcView, ServerPacket, StatsView, TileCoord};
use crate::util::position::{Position, RegionId};

/// Retries when an entity changes region between reading its position and
/// locking that region
const MAX_LOCK_ATTEMPTS: usize = 4;

/// Gameplay tunables the store and the engines built on it consult
#[derive(Debug, Clone)]
pub struct WorldSettings {
    pub intervals: IntervalConfig,
    pub levels: LevelTable,
    pub npc_move_interval: Duration,
    pub npc_attack_interval: Duration,
    pub paralysis: Duration,
    pub respawn_delay: Duration,
    pub max_pets: usize,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            intervals: IntervalConfig::default(),
            levels: LevelTable::default(),
            npc_move_interval: Duration::from_millis(600),
            npc_attack_interval: Duration::from_millis(1500),
            paralysis: Duration::from_secs(8),
            respawn_delay: Duration::from_secs(30),
            max_pets: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("Unknown region {0}")]
    UnknownRegion(RegionId),
    #[error("Position {0:?} is outside the grid")]
    InvalidPosition(Position),
    #[error("Character {0} is not live")]
    UnknownCharacter(CharIndex),
    #[error("NPC {0} is not live")]
    UnknownNpc(NpcIndex),
    #[error("Entity {0} is not placed in any region")]
    NotPlaced(u16),
    #[error("Unknown NPC definition {0}")]
    UnknownNpcDef(u16),
    #[error("Tile {0:?} is not available")]
    TileUnavailable(Position),
    #[error("No free tile found in region {0}")]
    NoFreeTile(RegionId),
    #[error("Entity {0} kept changing region while being locked")]
    Contended(u16),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Who is looking for a tile to stand on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walker {
    Character { sailing: bool },
    Npc { aquatic: bool },
}

impl Walker {
    #[inline]
    pub fn can_stand(self, tile: &Tile) -> bool {
        let terrain = match self {
            Walker::Character { sailing } => tile.walkable_for(sailing),
            Walker::Npc { aquatic } => tile.walkable_for_npc(aquatic),
        };
        terrain && !tile.is_occupied()
    }
}

/// Write guards for the one or two regions an operation touches
pub(crate) enum RegionLocks<'a> {
    Same(RwLockWriteGuard<'a, RegionGrid>),
    Split {
        src: RwLockWriteGuard<'a, RegionGrid>,
        dst: RwLockWriteGuard<'a, RegionGrid>,
    },
}

pub struct World {
    regions: HashMap<RegionId, Region>,
    pub characters: EntityTable<Character>,
    pub npcs: EntityTable<WorldNpc>,
    char_indices: IndexAllocator,
    npc_indices: IndexAllocator,
    definitions: Arc<dyn DefinitionStore>,
    outbox: Arc<dyn Outbox>,
    respawns: RespawnQueue,
    settings: WorldSettings,
}

impl World {
    pub fn new(
        regions: Vec<Region>,
        definitions: Arc<dyn DefinitionStore>,
        outbox: Arc<dyn Outbox>,
        settings: WorldSettings,
    ) -> Self {
        let mut by_id = HashMap::with_capacity(regions.len());
        for region in regions {
            if by_id.contains_key(&region.id) {
                tracing::warn!("Duplicate region id {}; keeping the first one", region.id);
                continue;
            }
            by_id.insert(region.id, region);
        }
        Self {
            regions: by_id,
            characters: EntityTable::new(),
            npcs: EntityTable::new(),
            char_indices: IndexAllocator::new(),
            npc_indices: IndexAllocator::new(),
            definitions,
            outbox,
            respawns: RespawnQueue::new(spawn::RESPAWN_QUEUE_CAPACITY),
            settings,
        }
    }

    pub fn region(&self, id: RegionId) -> Result<&Region, WorldError> {
        self.regions.get(&id).ok_or(WorldError::UnknownRegion(id))
    }

    /// Loaded region ids, ascending
    pub fn region_ids(&self) -> Vec<RegionId> {
        let mut ids: Vec<_> = self.regions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[inline]
    pub fn definitions(&self) -> &dyn DefinitionStore {
        self.definitions.as_ref()
    }

    #[inline]
    pub fn outbox(&self) -> &dyn Outbox {
        self.outbox.as_ref()
    }

    #[inline]
    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    #[inline]
    pub fn respawns(&self) -> &RespawnQueue {
        &self.respawns
    }

    pub fn send(&self, to: CharIndex, packet: ServerPacket) {
        self.outbox.send(to, packet);
    }

    pub fn console(&self, to: CharIndex, text: impl Into<String>, font: Font) {
        self.outbox.send(to, ServerPacket::console(text, font));
    }

    /// Lock the grids of `src` and `dst` in ascending id order
    pub(crate) fn lock_pair(
        &self,
        src: RegionId,
        dst: RegionId,
    ) -> Result<RegionLocks<'_>, WorldError> {
        let src_region = self.region(src)?;
        if src == dst {
            return Ok(RegionLocks::Same(src_region.write()));
        }
        let dst_region = self.region(dst)?;
        Ok(if src < dst {
            let src = src_region.write();
            let dst = dst_region.write();
            RegionLocks::Split { src, dst }
        } else {
            let dst = dst_region.write();
            let src = src_region.write();
            RegionLocks::Split { src, dst }
        })
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Create packet for a live character standing at `at`
    pub fn character_packet(&self, ci: CharIndex, at: &Position) -> Option<ServerPacket> {
        let handle = self.characters.get(ci)?;
        let c = handle.lock();
        Some(ServerPacket::CharacterCreate(CharacterView {
            index: ci,
            name: c.name.clone(),
            body: c.appearance.body,
            head: c.appearance.head,
            heading: c.heading,
            at: TileCoord::from(*at),
            weapon: c.appearance.weapon,
            shield: c.appearance.shield,
            helmet: c.appearance.helmet,
            criminal: c.flags.criminal,
            dead: c.flags.dead,
        }))
    }

    /// Appearance-change packet for a live character
    pub fn character_change_packet(&self, c: &Character) -> ServerPacket {
        ServerPacket::CharacterChange {
            index: c.index,
            body: c.appearance.body,
            head: c.appearance.head,
            heading: c.heading,
            weapon: c.appearance.weapon,
            shield: c.appearance.shield,
            helmet: c.appearance.helmet,
        }
    }

    pub fn npc_packet(&self, ni: NpcIndex, at: &Position) -> Option<ServerPacket> {
        let handle = self.npcs.get(ni)?;
        let npc = handle.lock();
        let def = self.definitions.npc(npc.def_id)?;
        Some(ServerPacket::NpcCreate(NpcView {
            index: ni,
            name: def.name.clone(),
            body: def.body,
            head: def.head,
            heading: npc.heading,
            at: TileCoord::from(*at),
        }))
    }

    /// Create packet for whatever object lies at `pos`
    pub fn object_packet(&self, grid: &RegionGrid, pos: Position) -> Option<ServerPacket> {
        let object = grid.tile_at(&pos).object?;
        let def = self.definitions.object(object.def_id)?;
        Some(ServerPacket::ObjectCreate {
            graphic: def.graphic,
            at: TileCoord::from(pos),
        })
    }

    pub fn stats_packet(&self, c: &Character) -> ServerPacket {
        ServerPacket::UpdateStats(StatsView {
            max_hp: c.hp.max,
            hp: c.hp.current,
            max_mana: c.mana.max,
            mana: c.mana.current,
            max_stamina: c.stamina.max,
            stamina: c.stamina.current,
            gold: c.gold,
            level: c.level,
            experience: c.experience,
            next_level: self.settings.levels.next_level(c.level).unwrap_or(0),
        })
    }

    pub fn inventory_slot_packet(&self, c: &Character, slot: usize) -> ServerPacket {
        let entry = c.inventory.get(slot);
        let name = entry
            .and_then(|s| self.definitions.object(s.object))
            .map(|d| d.name.clone())
            .unwrap_or_default();
        ServerPacket::InventorySlot {
            slot: slot as u8,
            object: entry.map_or(0, |s| s.object),
            name,
            amount: entry.map_or(0, |s| s.amount),
            equipped: entry.is_some_and(|s| s.equipped),
        }
    }

    /// Send `packet` to every character that can see `center`
    pub fn broadcast_area(&self, center: &Position, packet: &ServerPacket, except: Option<CharIndex>) {
        if let Ok(region) = self.region(center.region) {
            let grid = region.read();
            aoi::broadcast_area(self, &grid, center, packet, except);
        }
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    fn read_tile<T>(&self, pos: &Position, f: impl FnOnce(&Tile) -> T) -> Result<T, WorldError> {
        if !pos.in_grid() {
            return Err(WorldError::InvalidPosition(*pos));
        }
        let grid = self.region(pos.region)?.read();
        Ok(f(grid.tile_at(pos)))
    }

    pub fn is_safe_zone(&self, pos: &Position) -> bool {
        self.read_tile(pos, Tile::is_safe_zone).unwrap_or(false)
    }

    /// Deaths here keep every item
    pub fn is_arena(&self, pos: &Position) -> bool {
        self.read_tile(pos, |t| t.trigger == crate::game::tile::Trigger::Arena)
            .unwrap_or(false)
    }

    pub fn is_pk_allowed(&self, region: RegionId) -> bool {
        self.region(region).is_ok_and(|r| r.pk_allowed)
    }

    pub fn is_invalid_position(&self, pos: &Position) -> bool {
        self.read_tile(pos, |t| t.trigger == crate::game::tile::Trigger::InvalidPosition)
            .unwrap_or(true)
    }

    /// No character, no NPC and not blocked
    pub fn is_tile_empty(&self, pos: &Position) -> bool {
        self.read_tile(pos, |t| !t.blocked && !t.is_occupied())
            .unwrap_or(false)
    }

    pub fn is_blocked(&self, pos: &Position) -> bool {
        self.read_tile(pos, |t| t.blocked).unwrap_or(true)
    }

    /// Character and NPC standing on `pos`
    pub fn occupants(&self, pos: &Position) -> (Option<CharIndex>, Option<NpcIndex>) {
        self.read_tile(pos, |t| (t.character, t.npc))
            .unwrap_or((None, None))
    }

    /// Copy of a tile's static and occupant data
    pub fn tile(&self, pos: &Position) -> Result<Tile, WorldError> {
        self.read_tile(pos, Tile::clone)
    }

    /// Nearest tile (Manhattan rings) where `walker` can stand
    pub fn nearest_free_tile(&self, origin: &Position, walker: Walker) -> Option<Position> {
        let grid = self.region(origin.region).ok()?.read();
        nearest_free_in(&grid, origin, walker)
    }
}

/// Ring search around `origin` inside the playable area, origin first
pub(crate) fn nearest_free_in(
    grid: &RegionGrid,
    origin: &Position,
    walker: Walker,
) -> Option<Position> {
    nearest_matching(origin, |pos| walker.can_stand(grid.tile_at(pos)))
}

pub(crate) fn nearest_matching(
    origin: &Position,
    mut accept: impl FnMut(&Position) -> bool,
) -> Option<Position> {
    let ox = i16::from(origin.x);
    let oy = i16::from(origin.y);
    for radius in 0..=i16::from(spawn::MAX_NEAREST_FREE_RADIUS) {
        for dx in -radius..=radius {
            let rest = radius - dx.abs();
            let count = if rest == 0 { 1 } else { 2 };
            for dy in [-rest, rest].into_iter().take(count) {
                let (x, y) = (ox + dx, oy + dy);
                if !(i16::from(grid::MIN_X)..=i16::from(grid::MAX_X)).contains(&x)
                    || !(i16::from(grid::MIN_Y)..=i16::from(grid::MAX_Y)).contains(&y)
                {
                    continue;
                }
                let pos = Position::new(origin.region, x as u8, y as u8);
                if accept(&pos) {
                    return Some(pos);
                }
            }
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::game::definitions::{DefinitionFile, Definitions};
    use crate::game::region::RegionData;
    use crate::net::aoi::RecordingOutbox;

    pub const DEFINITIONS: &str = r#"{
        "objects": [
            {"id": 1, "name": "Dagger", "graphic": 100, "kind": "weapon", "min_hit": 2, "max_hit": 4, "anim": 3},
            {"id": 2, "name": "Bow", "graphic": 101, "kind": "weapon", "min_hit": 1, "max_hit": 6, "ranged": true, "anim": 4},
            {"id": 3, "name": "Leather Armor", "graphic": 102, "kind": "armor", "min_def": 1, "max_def": 2, "body": 40},
            {"id": 4, "name": "Red Potion", "graphic": 103, "kind": "potion", "stat": "health", "min": 10, "max": 10},
            {"id": 5, "name": "Boat", "graphic": 104, "kind": "boat", "body": 84},
            {"id": 6, "name": "Gold", "graphic": 105, "kind": "gold"},
            {"id": 7, "name": "Fishing Rod", "graphic": 106, "kind": "tool", "skill": "fishing", "product": 8},
            {"id": 8, "name": "Fish", "graphic": 107, "kind": "food", "hunger": 10},
            {"id": 9, "name": "Apple", "graphic": 108, "kind": "food", "hunger": 20},
            {"id": 10, "name": "Water", "graphic": 109, "kind": "drink", "thirst": 30},
            {"id": 11, "name": "Antidote", "graphic": 110, "kind": "antidote"},
            {"id": 12, "name": "Shield", "graphic": 111, "kind": "shield", "min_def": 1, "max_def": 1, "anim": 2},
            {"id": 13, "name": "Tree", "graphic": 112, "kind": "resource", "skill": "woodcutting", "pickable": false},
            {"id": 14, "name": "Axe", "graphic": 113, "kind": "tool", "skill": "woodcutting", "product": 15},
            {"id": 15, "name": "Wood", "graphic": 114, "kind": "misc"},
            {"id": 16, "name": "Cap", "graphic": 115, "kind": "helmet", "min_def": 0, "max_def": 1, "anim": 5}
        ],
        "npcs": [
            {"id": 1, "name": "Rat", "body": 9, "behavior": "hostile_wander", "max_hp": 20,
             "min_hit": 1, "max_hit": 2, "experience": 40, "respawn": true, "tameable": true,
             "loot": [{"object": 9, "amount": 1, "chance": 100}]},
            {"id": 2, "name": "Guard", "body": 10, "behavior": "guard_criminals", "max_hp": 500,
             "min_hit": 20, "max_hit": 30, "attack_power": 200},
            {"id": 3, "name": "Merchant", "body": 11, "behavior": "static", "max_hp": 100},
            {"id": 4, "name": "Shark", "body": 12, "behavior": "hostile_wander", "max_hp": 50, "aquatic": true}
        ],
        "spells": [
            {"id": 1, "name": "Dart", "mana_cost": 5, "effect": "damage", "min": 4, "max": 4, "targeting": "any", "fx": 3},
            {"id": 2, "name": "Heal", "mana_cost": 5, "effect": "heal", "min": 5, "max": 5, "targeting": "character"},
            {"id": 3, "name": "Hold", "mana_cost": 10, "effect": "paralyze", "targeting": "any"}
        ],
        "cities": [
            {"id": 1, "name": "Haven", "position": {"x": 50, "y": 50, "region": 1}}
        ]
    }"#;

    pub fn definitions() -> Arc<Definitions> {
        let file: DefinitionFile = serde_json::from_str(DEFINITIONS).unwrap();
        Arc::new(Definitions::from_file_data(file).unwrap())
    }

    /// Region 1 (safe town, no PK) and region 2 (PK field), both open ground
    pub fn world_with(
        customize: impl FnOnce(&mut RegionData, &mut RegionData),
    ) -> (World, Arc<RecordingOutbox>) {
        let mut town = RegionData::open(1, "Town", false);
        let mut field = RegionData::open(2, "Field", true);
        customize(&mut town, &mut field);
        let outbox = RecordingOutbox::new();
        let world = World::new(
            vec![
                Region::from_data(town).unwrap(),
                Region::from_data(field).unwrap(),
            ],
            definitions(),
            outbox.clone(),
            WorldSettings::default(),
        );
        (world, outbox)
    }

    pub fn world() -> (World, Arc<RecordingOutbox>) {
        world_with(|_, _| {})
    }

    /// Add a character and place it at `pos`
    pub fn spawn_character(world: &World, name: &str, pos: Position) -> CharIndex {
        let c = Character::new(name, crate::game::character::Archetype::Warrior, 1, 1, 1, pos);
        let (ci, _) = world.add_character(c).unwrap();
        world.place_character(ci, pos).unwrap();
        ci
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_lock_pair_unknown_region() {
        let (world, _) = world();
        assert!(matches!(
            world.lock_pair(1, 9),
            Err(WorldError::UnknownRegion(9))
        ));
    }

    #[test]
    fn test_lock_pair_both_orders() {
        let (world, _) = world();
        assert!(matches!(world.lock_pair(1, 1).unwrap(), RegionLocks::Same(_)));
        assert!(matches!(world.lock_pair(2, 1).unwrap(), RegionLocks::Split { .. }));
        assert!(matches!(world.lock_pair(1, 2).unwrap(), RegionLocks::Split { .. }));
    }

    #[test]
    fn test_predicates() {
        let (world, _) = world_with(|town, _| {
            town.tile_mut(20, 20).blocked = true;
            town.tile_mut(21, 20).trigger = crate::game::tile::Trigger::SafeZone;
            town.tile_mut(22, 20).trigger = crate::game::tile::Trigger::InvalidPosition;
        });
        assert!(world.is_blocked(&Position::new(1, 20, 20)));
        assert!(!world.is_tile_empty(&Position::new(1, 20, 20)));
        assert!(world.is_safe_zone(&Position::new(1, 21, 20)));
        assert!(world.is_invalid_position(&Position::new(1, 22, 20)));
        assert!(!world.is_pk_allowed(1));
        assert!(world.is_pk_allowed(2));
        assert!(!world.is_pk_allowed(9));
        assert!(world.is_blocked(&Position::new(9, 20, 20)));
    }

    #[test]
    fn test_nearest_free_tile_skips_blocked_and_occupied() {
        let (world, _) = world_with(|town, _| {
            town.tile_mut(30, 30).blocked = true;
            town.tile_mut(31, 30).blocked = true;
        });
        let ci = spawn_character(&world, "Occupant", Position::new(1, 30, 31));
        assert_ne!(ci, 0);

        let found = world
            .nearest_free_tile(&Position::new(1, 30, 30), Walker::Character { sailing: false })
            .unwrap();
        assert_eq!(found.distance(&Position::new(1, 30, 30)), 1);
        assert_eq!(found, Position::new(1, 29, 30));
    }

    #[test]
    fn test_nearest_matching_stays_in_playable_area() {
        let origin = Position::new(1, grid::MIN_X, grid::MIN_Y);
        let mut seen = Vec::new();
        nearest_matching(&origin, |p| {
            seen.push(*p);
            false
        });
        assert!(seen.iter().all(Position::in_playable_area));
        assert_eq!(seen[0], origin);
    }
}
