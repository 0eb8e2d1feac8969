//! Live NPC instances

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::game::character::Pool;
use crate::game::definitions::NpcDef;
use crate::game::index_allocator::{CharIndex, NpcIndex};
use crate::util::position::{Heading, Position};

/// Movement and aggression policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NpcBehavior {
    /// Never moves on its own (merchants, bankers)
    #[default]
    Static,
    /// Wanders randomly, never attacks first
    Wander,
    /// Wanders and attacks or pursues any living character
    HostileWander,
    /// Stays put until attacked, then hunts the aggressor
    Defensive,
    /// Attacks criminals on adjacent tiles
    GuardCriminals,
    /// Attacks non-criminals on adjacent tiles
    GuardCitizens,
    /// Never moves, attacks anything adjacent
    ObjectLike,
    /// Tamed pet following its owner
    FollowOwner,
}

impl NpcBehavior {
    pub fn is_guard(self) -> bool {
        matches!(self, NpcBehavior::GuardCriminals | NpcBehavior::GuardCitizens)
    }
}

#[derive(Debug, Clone)]
pub struct WorldNpc {
    pub def_id: u16,
    pub index: NpcIndex,
    pub position: Position,
    /// Where the NPC was first spawned
    pub origin: Position,
    pub heading: Heading,
    pub hp: Pool,
    /// Experience still grantable to attackers
    pub exp_pool: u32,
    pub behavior: NpcBehavior,
    /// Character that attacked it most recently
    pub attacked_by: Option<CharIndex>,
    /// Owner of a tamed NPC
    pub owner: Option<CharIndex>,
    /// NPC a pet is currently fighting
    pub target: Option<NpcIndex>,
    pub poisoned: bool,
    pub paralyzed_until: Option<Instant>,
    pub immobilized_until: Option<Instant>,
    pub last_move: Option<Instant>,
    pub last_attack: Option<Instant>,
    pub last_cast: Option<Instant>,
}

impl WorldNpc {
    pub fn from_def(def: &NpcDef, index: NpcIndex, position: Position) -> Self {
        Self {
            def_id: def.id,
            index,
            position,
            origin: position,
            heading: Heading::default(),
            hp: Pool::full(def.max_hp.max(1)),
            exp_pool: def.experience,
            behavior: def.behavior,
            attacked_by: None,
            owner: None,
            target: None,
            poisoned: false,
            paralyzed_until: None,
            immobilized_until: None,
            last_move: None,
            last_attack: None,
            last_cast: None,
        }
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.hp.is_empty()
    }

    pub fn is_paralyzed(&self, now: Instant) -> bool {
        self.paralyzed_until.is_some_and(|t| t > now)
    }

    pub fn is_rooted(&self, now: Instant) -> bool {
        self.is_paralyzed(now) || self.immobilized_until.is_some_and(|t| t > now)
    }

    /// Drop paralysis and immobilization that have run out
    pub fn expire_effects(&mut self, now: Instant) {
        if self.paralyzed_until.is_some_and(|t| t <= now) {
            self.paralyzed_until = None;
        }
        if self.immobilized_until.is_some_and(|t| t <= now) {
            self.immobilized_until = None;
        }
    }

    pub fn can_move(&self, interval: Duration, now: Instant) -> bool {
        self.last_move
            .map_or(true, |at| now.saturating_duration_since(at) >= interval)
    }

    pub fn can_attack(&self, interval: Duration, now: Instant) -> bool {
        self.last_attack
            .map_or(true, |at| now.saturating_duration_since(at) >= interval)
    }

    /// Take the NPC under a new owner's control
    pub fn tame(&mut self, owner: CharIndex) {
        self.owner = Some(owner);
        self.behavior = NpcBehavior::FollowOwner;
        self.attacked_by = None;
        self.target = None;
    }
}
