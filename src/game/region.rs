//! Regions ("maps"): a fixed 100x100 tile grid plus the live entity indices
//!
//! All structural state sits behind one `RwLock`. Mutations take the write
//! side; visibility scans and predicates take the read side.

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::game::constants::grid;
use crate::game::index_allocator::EntityIndex;
use crate::game::tile::Tile;
use crate::util::position::{Position, RegionId};

/// Static, persistable form of a region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionData {
    pub id: RegionId,
    pub name: String,
    pub pk_allowed: bool,
    pub tiles: Vec<Tile>,
}

impl RegionData {
    /// A region of open ground with no features
    pub fn open(id: RegionId, name: impl Into<String>, pk_allowed: bool) -> Self {
        Self {
            id,
            name: name.into(),
            pk_allowed,
            tiles: vec![Tile::default(); grid::TILE_COUNT],
        }
    }

    pub fn tile_mut(&mut self, x: u8, y: u8) -> &mut Tile {
        &mut self.tiles[tile_offset(x, y)]
    }
}

/// Mutable part of a region, guarded by the region lock
#[derive(Debug)]
pub struct RegionGrid {
    tiles: Vec<Tile>,
    /// Live characters and their authoritative positions
    pub characters: HashMap<EntityIndex, Position>,
    /// Live NPCs and their authoritative positions
    pub npcs: HashMap<EntityIndex, Position>,
}

impl RegionGrid {
    #[inline]
    pub fn tile(&self, x: u8, y: u8) -> &Tile {
        &self.tiles[tile_offset(x, y)]
    }

    #[inline]
    pub fn tile_mut(&mut self, x: u8, y: u8) -> &mut Tile {
        &mut self.tiles[tile_offset(x, y)]
    }

    #[inline]
    pub fn tile_at(&self, pos: &Position) -> &Tile {
        self.tile(pos.x, pos.y)
    }

    #[inline]
    pub fn tile_at_mut(&mut self, pos: &Position) -> &mut Tile {
        self.tile_mut(pos.x, pos.y)
    }

    /// Every tile with its coordinates, row by row
    pub fn tiles(&self) -> impl Iterator<Item = (u8, u8, &Tile)> {
        self.tiles.iter().enumerate().map(|(i, tile)| {
            ((i % grid::WIDTH) as u8, (i / grid::WIDTH) as u8, tile)
        })
    }
}

pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub pk_allowed: bool,
    grid: RwLock<RegionGrid>,
}

impl Region {
    /// Build a live region from its static data
    ///
    /// Occupant slots from the data are discarded; live entities are always
    /// placed through the world store.
    pub fn from_data(data: RegionData) -> Result<Self, RegionDataError> {
        if data.tiles.len() != grid::TILE_COUNT {
            return Err(RegionDataError::WrongTileCount {
                region: data.id,
                found: data.tiles.len(),
            });
        }
        let mut tiles = data.tiles;
        for tile in &mut tiles {
            tile.character = None;
            tile.npc = None;
        }
        Ok(Self {
            id: data.id,
            name: data.name,
            pk_allowed: data.pk_allowed,
            grid: RwLock::new(RegionGrid {
                tiles,
                characters: HashMap::new(),
                npcs: HashMap::new(),
            }),
        })
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, RegionGrid> {
        self.grid.read()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, RegionGrid> {
        self.grid.write()
    }

    /// Static data for the region cache (live occupants excluded)
    pub fn to_data(&self) -> RegionData {
        let grid = self.grid.read();
        let tiles = grid
            .tiles
            .iter()
            .map(|tile| Tile {
                character: None,
                npc: None,
                ..tile.clone()
            })
            .collect();
        RegionData {
            id: self.id,
            name: self.name.clone(),
            pk_allowed: self.pk_allowed,
            tiles,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegionDataError {
    #[error("Region {region} has {found} tiles, expected {}", grid::TILE_COUNT)]
    WrongTileCount { region: RegionId, found: usize },
}

#[inline]
fn tile_offset(x: u8, y: u8) -> usize {
    usize::from(y) * grid::WIDTH + usize::from(x)
}
