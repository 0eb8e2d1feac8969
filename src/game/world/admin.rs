//! Read-only world summaries for the status endpoint and GM commands

use serde::Serialize;

use crate::game::index_allocator::CharIndex;
use crate::util::position::{Position, RegionId};

use super::World;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegionOccupancy {
    pub id: RegionId,
    pub name: String,
    pub characters: usize,
    pub npcs: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OnlineCharacter {
    pub index: CharIndex,
    pub name: String,
    pub level: u8,
    pub hp: u16,
    pub max_hp: u16,
    pub position: Position,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorldSummary {
    pub regions: Vec<RegionOccupancy>,
    pub characters: usize,
    pub npcs: usize,
    pub pending_respawns: usize,
}

impl World {
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn region_occupancy(&self) -> Vec<RegionOccupancy> {
        self.region_ids()
            .into_iter()
            .filter_map(|id| {
                let region = self.region(id).ok()?;
                let grid = region.read();
                Some(RegionOccupancy {
                    id,
                    name: region.name.clone(),
                    characters: grid.characters.len(),
                    npcs: grid.npcs.len(),
                })
            })
            .collect()
    }

    /// Characters currently on the map, by index
    pub fn online_characters(&self) -> Vec<OnlineCharacter> {
        self.characters
            .entries()
            .into_iter()
            .map(|(index, handle)| {
                let c = handle.lock();
                OnlineCharacter {
                    index,
                    name: c.name.clone(),
                    level: c.level,
                    hp: c.hp.current,
                    max_hp: c.hp.max,
                    position: c.position,
                }
            })
            .collect()
    }

    pub fn find_character(&self, name: &str) -> Option<CharIndex> {
        self.characters
            .entries()
            .into_iter()
            .find(|(_, handle)| handle.lock().name.eq_ignore_ascii_case(name))
            .map(|(index, _)| index)
    }

    pub fn summary(&self) -> WorldSummary {
        WorldSummary {
            regions: self.region_occupancy(),
            characters: self.characters.len(),
            npcs: self.npcs.len(),
            pending_respawns: self.respawns().pending_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_summary_counts() {
        let (world, _) = world();
        spawn_character(&world, "Aaa", Position::new(1, 20, 20));
        let b = spawn_character(&world, "Bbb", Position::new(2, 20, 20));
        world.spawn_npc(1, Position::new(2, 30, 30)).unwrap();

        let summary = world.summary();
        assert_eq!(summary.characters, 2);
        assert_eq!(summary.npcs, 1);
        assert_eq!(
            summary.regions,
            vec![
                RegionOccupancy { id: 1, name: "Town".into(), characters: 1, npcs: 0 },
                RegionOccupancy { id: 2, name: "Field".into(), characters: 1, npcs: 1 },
            ]
        );
        assert_eq!(world.region_count(), 2);
        assert_eq!(world.find_character("bbb"), Some(b));
        assert_eq!(world.online_characters().len(), 2);
    }
}
