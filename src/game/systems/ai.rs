//! NPC behavior
//!
//! Each tick every NPC plans its intents in parallel against a read-only view
//! of the world, then the intents are applied one NPC at a time through the
//! ordinary world and combat operations. Planning never holds a region lock
//! and an entity lock of the same NPC together, and never mutates the grid.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::game::combat::{AttackOutcome, Combatant};
use crate::game::constants::ai::*;
use crate::game::definitions::NpcDef;
use crate::game::entity_table::Shared;
use crate::game::index_allocator::{CharIndex, NpcIndex};
use crate::game::npc::{NpcBehavior, WorldNpc};
use crate::game::region::RegionGrid;
use crate::game::scheduler::PeriodicTask;
use crate::game::world::{World, WorldError};
use crate::net::aoi::in_range;
use crate::util::position::{Heading, Position};

/// One thing an NPC wants to do this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Step in the first heading that is free
    Approach(SmallVec<[Heading; 2]>),
    AttackCharacter(CharIndex),
    AttackNpc(NpcIndex),
    Cast { spell: u16, victim: CharIndex },
    /// Jump next to a distant owner
    Regroup(Position),
    /// Owner is gone; leave the world
    Release,
}

pub type Intents = SmallVec<[Intent; MAX_INTENTS_PER_NPC]>;

/// What planning needs to know about one NPC, copied out of its lock
#[derive(Debug, Clone, Copy)]
struct NpcView {
    index: NpcIndex,
    position: Position,
    behavior: NpcBehavior,
    attacked_by: Option<CharIndex>,
    owner: Option<CharIndex>,
    target: Option<NpcIndex>,
    may_move: bool,
    may_attack: bool,
}

/// A character as seen by a planning NPC
#[derive(Debug, Clone, Copy)]
struct Prey {
    index: CharIndex,
    position: Position,
}

pub struct AiTask {
    period: Duration,
    rng: StdRng,
}

impl AiTask {
    pub fn new(period: Duration, seed: u64) -> Self {
        Self {
            period,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Plan and apply one round. Returns the number of intents applied.
    pub fn run_once(&mut self, world: &World, now: Instant) -> usize {
        let seed: u64 = self.rng.gen();
        let plans: Vec<(NpcIndex, Intents)> = world
            .npcs
            .entries()
            .into_par_iter()
            .filter_map(|(ni, handle)| {
                let mut rng = StdRng::seed_from_u64(seed ^ u64::from(ni).wrapping_mul(0x9E37_79B9_7F4A_7C15));
                let intents = plan(world, &handle, now, &mut rng);
                (!intents.is_empty()).then_some((ni, intents))
            })
            .collect();

        let mut applied = 0;
        for (ni, intents) in plans {
            for intent in intents {
                match apply(world, ni, &intent, now, &mut self.rng) {
                    Ok(()) => applied += 1,
                    // Killed or despawned earlier in this round
                    Err(WorldError::UnknownNpc(_)) => break,
                    Err(e) => {
                        tracing::debug!("NPC {} intent {:?} failed: {}", ni, intent, e);
                    }
                }
            }
        }
        applied
    }
}

impl PeriodicTask for AiTask {
    fn name(&self) -> &'static str {
        "npc_ai"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run(&mut self, world: &World, now: Instant) {
        self.run_once(world, now);
    }
}

/// Decide what one NPC does this tick
fn plan<R: Rng + ?Sized>(world: &World, handle: &Shared<WorldNpc>, now: Instant, rng: &mut R) -> Intents {
    let Some((npc, def)) = snapshot(world, handle, now) else {
        return Intents::new();
    };
    if !npc.may_move && !npc.may_attack {
        return Intents::new();
    }

    match npc.behavior {
        NpcBehavior::Static => Intents::new(),
        NpcBehavior::Wander => wander(&npc, rng),
        NpcBehavior::HostileWander => match nearest_prey(world, &npc, |_, _| true) {
            Some(prey) => engage(&npc, def, prey, rng),
            None => wander(&npc, rng),
        },
        NpcBehavior::Defensive => match npc.attacked_by.and_then(|ci| hunted(world, &npc, ci)) {
            Some(prey) => engage(&npc, def, prey, rng),
            None => Intents::new(),
        },
        NpcBehavior::GuardCriminals => adjacent_prey(world, &npc, |criminal| criminal),
        NpcBehavior::GuardCitizens => adjacent_prey(world, &npc, |criminal| !criminal),
        NpcBehavior::ObjectLike => adjacent_prey(world, &npc, |_| true),
        NpcBehavior::FollowOwner => follow_owner(world, &npc, def, rng),
    }
}

fn snapshot<'w>(
    world: &'w World,
    handle: &Shared<WorldNpc>,
    now: Instant,
) -> Option<(NpcView, &'w NpcDef)> {
    let mut npc = handle.lock();
    npc.expire_effects(now);
    if npc.is_dead() || npc.is_paralyzed(now) {
        return None;
    }
    let def = world.definitions().npc(npc.def_id)?;
    Some((
        NpcView {
            index: npc.index,
            position: npc.position,
            behavior: npc.behavior,
            attacked_by: npc.attacked_by,
            owner: npc.owner,
            target: npc.target,
            may_move: !npc.is_rooted(now) && npc.can_move(world.npc_move_interval(def), now),
            may_attack: npc.can_attack(world.npc_attack_interval(def), now),
        },
        def,
    ))
}

fn wander<R: Rng + ?Sized>(npc: &NpcView, rng: &mut R) -> Intents {
    let mut intents = Intents::new();
    if npc.may_move {
        let heading = Heading::ALL[rng.gen_range(0..Heading::ALL.len())];
        intents.push(Intent::Approach(SmallVec::from_elem(heading, 1)));
    }
    intents
}

/// Headings that bring `from` closer to `to`, dominant axis first
pub fn approach_headings(from: &Position, to: &Position) -> SmallVec<[Heading; 2]> {
    let mut headings = SmallVec::new();
    let dx = i16::from(to.x) - i16::from(from.x);
    let dy = i16::from(to.y) - i16::from(from.y);
    let horizontal = (dx != 0).then(|| if dx > 0 { Heading::East } else { Heading::West });
    let vertical = (dy != 0).then(|| if dy > 0 { Heading::South } else { Heading::North });
    let (first, second) = if dx.abs() >= dy.abs() {
        (horizontal, vertical)
    } else {
        (vertical, horizontal)
    };
    headings.extend(first);
    headings.extend(second);
    headings
}

/// Whether `pos` can be targeted by an NPC standing in `grid`
fn huntable(grid: &RegionGrid, pos: &Position) -> bool {
    !grid.tile_at(pos).is_safe_zone()
}

/// Closest living, non-GM character within the pursuit radius
fn nearest_prey(
    world: &World,
    npc: &NpcView,
    accept: impl Fn(CharIndex, bool) -> bool,
) -> Option<Prey> {
    let region = world.region(npc.position.region).ok()?;
    let grid = region.read();
    if !huntable(&grid, &npc.position) {
        return None;
    }
    let mut best: Option<(u16, Prey)> = None;
    for (&ci, pos) in &grid.characters {
        let distance = npc.position.distance(pos);
        if distance > PURSUE_RADIUS || !in_range(&npc.position, pos) || !huntable(&grid, pos) {
            continue;
        }
        if best.is_some_and(|(d, prey)| (d, prey.index) <= (distance, ci)) {
            continue;
        }
        let Some(handle) = world.characters.get(ci) else {
            continue;
        };
        let (dead, gm, criminal) = {
            let c = handle.lock();
            (c.is_dead(), c.flags.gm, c.flags.criminal)
        };
        if dead || gm || !accept(ci, criminal) {
            continue;
        }
        best = Some((distance, Prey { index: ci, position: *pos }));
    }
    best.map(|(_, prey)| prey)
}

/// A specific character, if it is still a valid target
fn hunted(world: &World, npc: &NpcView, ci: CharIndex) -> Option<Prey> {
    nearest_prey(world, npc, |candidate, _| candidate == ci)
}

/// Attack the first matching character on a cardinal neighbour; never move
fn adjacent_prey(world: &World, npc: &NpcView, accept: impl Fn(bool) -> bool) -> Intents {
    let mut intents = Intents::new();
    if !npc.may_attack {
        return intents;
    }
    let adjacent = nearest_prey(world, npc, |_, criminal| accept(criminal))
        .filter(|prey| npc.position.distance(&prey.position) == 1);
    if let Some(prey) = adjacent {
        intents.push(Intent::AttackCharacter(prey.index));
    }
    intents
}

/// Close in on a character and hit or cast at it
fn engage<R: Rng + ?Sized>(npc: &NpcView, def: &NpcDef, prey: Prey, rng: &mut R) -> Intents {
    let mut intents = Intents::new();
    let distance = npc.position.distance(&prey.position);
    let cast = npc.may_attack
        && !def.spells.is_empty()
        && rng.gen_range(0..100u8) < def.spell_chance;

    if cast {
        let spell = def.spells[rng.gen_range(0..def.spells.len())];
        intents.push(Intent::Cast {
            spell,
            victim: prey.index,
        });
        return intents;
    }
    if distance > 1 && npc.may_move {
        intents.push(Intent::Approach(approach_headings(&npc.position, &prey.position)));
    }
    // One step may be enough to reach melee range
    if npc.may_attack && distance <= 2 {
        intents.push(Intent::AttackCharacter(prey.index));
    }
    intents
}

fn follow_owner<R: Rng + ?Sized>(world: &World, npc: &NpcView, def: &NpcDef, rng: &mut R) -> Intents {
    let mut intents = Intents::new();
    let owner = npc.owner.and_then(|ci| world.characters.get(ci).map(|h| (ci, h)));
    let Some((owner_index, owner_handle)) = owner else {
        intents.push(Intent::Release);
        return intents;
    };
    let (owner_pos, owner_target) = {
        let c = owner_handle.lock();
        (c.position, c.last_target)
    };

    if !owner_pos.same_region(&npc.position) || !in_range(&npc.position, &owner_pos) {
        intents.push(Intent::Regroup(owner_pos));
        return intents;
    }

    let pk = world.is_pk_allowed(npc.position.region);
    let enemy = match (npc.target, owner_target) {
        (Some(target), _) => Some(Combatant::Npc(target)),
        (None, Some(Combatant::Npc(target))) if target != npc.index => Some(Combatant::Npc(target)),
        (None, Some(Combatant::Character(ci))) if pk && ci != owner_index => {
            Some(Combatant::Character(ci))
        }
        _ => None,
    };

    match enemy {
        Some(Combatant::Npc(target)) => {
            if let Some(pos) = world.npc_position(target).filter(|p| p.same_region(&npc.position)) {
                let distance = npc.position.distance(&pos);
                if distance > 1 && npc.may_move {
                    intents.push(Intent::Approach(approach_headings(&npc.position, &pos)));
                }
                if npc.may_attack && distance <= 2 {
                    intents.push(Intent::AttackNpc(target));
                }
                return intents;
            }
        }
        Some(Combatant::Character(ci)) => {
            if let Some(prey) = hunted(world, npc, ci) {
                return engage(npc, def, prey, rng);
            }
        }
        None => {}
    }

    if npc.may_move && npc.position.distance(&owner_pos) > FOLLOW_DISTANCE {
        intents.push(Intent::Approach(approach_headings(&npc.position, &owner_pos)));
    }
    intents
}

fn apply<R: Rng + ?Sized>(
    world: &World,
    ni: NpcIndex,
    intent: &Intent,
    now: Instant,
    rng: &mut R,
) -> Result<(), WorldError> {
    match intent {
        Intent::Approach(headings) => {
            let handle = world.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
            let mut moved = false;
            for heading in headings {
                if world.move_npc(ni, *heading)? {
                    moved = true;
                    break;
                }
            }
            if !moved {
                if let Some(heading) = headings.first() {
                    world.turn_npc(ni, *heading)?;
                }
            }
            handle.lock().last_move = Some(now);
        }
        Intent::AttackCharacter(ci) => {
            if let AttackOutcome::Rejected(reason) = world.npc_attacks(ni, *ci, now, rng)? {
                tracing::trace!("NPC {} attack on {} rejected: {:?}", ni, ci, reason);
            }
        }
        Intent::AttackNpc(target) => {
            let outcome = world.npc_attacks_npc(ni, *target, now, rng)?;
            let target_gone = matches!(outcome, AttackOutcome::Hit { killed: true, .. })
                || !world.npcs.contains(*target);
            if target_gone {
                if let Some(handle) = world.npcs.get(ni) {
                    handle.lock().target = None;
                }
            }
        }
        Intent::Cast { spell, victim } => {
            world.npc_cast_spell(ni, *victim, *spell, now, rng)?;
        }
        Intent::Regroup(near) => {
            let handle = world.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
            world.place_npc_near(ni, *near)?;
            handle.lock().last_move = Some(now);
        }
        Intent::Release => {
            tracing::debug!("Releasing ownerless pet {}", ni);
            world.despawn_npc(ni)?;
        }
    }
    Ok(())
}
