use serde::{Deserialize, Serialize};

use crate::game::constants::grid;

/// Region identifier
pub type RegionId = u16;

/// Facing direction of a character or NPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Heading {
    North,
    East,
    South,
    West,
}

impl Heading {
    pub const ALL: [Heading; 4] = [Heading::North, Heading::East, Heading::South, Heading::West];

    /// Grid delta for one step in this direction
    #[inline]
    pub fn delta(self) -> (i16, i16) {
        match self {
            Heading::North => (0, -1),
            Heading::East => (1, 0),
            Heading::South => (0, 1),
            Heading::West => (-1, 0),
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Heading::North => Heading::South,
            Heading::East => Heading::West,
            Heading::South => Heading::North,
            Heading::West => Heading::East,
        }
    }

    /// Wire encoding (1..=4, legacy client convention)
    pub fn to_wire(self) -> u8 {
        match self {
            Heading::North => 1,
            Heading::East => 2,
            Heading::South => 3,
            Heading::West => 4,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Heading::North),
            2 => Some(Heading::East),
            3 => Some(Heading::South),
            4 => Some(Heading::West),
            _ => None,
        }
    }
}

impl Default for Heading {
    fn default() -> Self {
        Heading::South
    }
}

/// Tile position inside a region (0-based coordinates)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: u8,
    pub y: u8,
    pub region: RegionId,
}

impl Position {
    #[inline]
    pub fn new(region: RegionId, x: u8, y: u8) -> Self {
        Self { x, y, region }
    }

    /// Manhattan distance over the grid coordinates
    ///
    /// Region is ignored; callers compare regions separately where it matters.
    #[inline]
    pub fn distance(&self, other: &Position) -> u16 {
        let dx = (i16::from(self.x) - i16::from(other.x)).unsigned_abs();
        let dy = (i16::from(self.y) - i16::from(other.y)).unsigned_abs();
        dx + dy
    }

    #[inline]
    pub fn same_region(&self, other: &Position) -> bool {
        self.region == other.region
    }

    /// Adjacent tile in the given direction, if still on the grid
    pub fn step(&self, heading: Heading) -> Option<Position> {
        let (dx, dy) = heading.delta();
        let x = i16::from(self.x) + dx;
        let y = i16::from(self.y) + dy;
        if x < 0 || y < 0 || x >= grid::WIDTH as i16 || y >= grid::HEIGHT as i16 {
            return None;
        }
        Some(Position::new(self.region, x as u8, y as u8))
    }

    /// Whether the position lies inside the 100x100 grid
    #[inline]
    pub fn in_grid(&self) -> bool {
        usize::from(self.x) < grid::WIDTH && usize::from(self.y) < grid::HEIGHT
    }

    /// Whether the position lies inside the playable sub-rectangle
    #[inline]
    pub fn in_playable_area(&self) -> bool {
        (grid::MIN_X..=grid::MAX_X).contains(&self.x) && (grid::MIN_Y..=grid::MAX_Y).contains(&self.y)
    }

    /// Heading that points from `self` towards `target` along the dominant axis
    pub fn heading_to(&self, target: &Position) -> Option<Heading> {
        let dx = i16::from(target.x) - i16::from(self.x);
        let dy = i16::from(target.y) - i16::from(self.y);
        if dx == 0 && dy == 0 {
            return None;
        }
        if dx.abs() >= dy.abs() {
            Some(if dx > 0 { Heading::East } else { Heading::West })
        } else {
            Some(if dy > 0 { Heading::South } else { Heading::North })
        }
    }

    /// Wire coordinates (1-based)
    #[inline]
    pub fn to_wire(&self) -> (u8, u8) {
        (self.x + 1, self.y + 1)
    }

    /// Build a position from 1-based wire coordinates
    pub fn from_wire(region: RegionId, x: u8, y: u8) -> Option<Position> {
        if x == 0 || y == 0 {
            return None;
        }
        let pos = Position::new(region, x - 1, y - 1);
        pos.in_grid().then_some(pos)
    }
}
