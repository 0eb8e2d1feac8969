//! Passive character upkeep: hunger, thirst, regeneration, poison and
//! effect expiry

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::game::character::{Character, Pool};
use crate::game::constants::regen::*;
use crate::game::index_allocator::CharIndex;
use crate::game::scheduler::PeriodicTask;
use crate::game::world::World;
use crate::net::protocol::{Font, ServerPacket};

/// Advance `counter` and report whether it reached `every`
#[inline]
fn tick(counter: &mut u32, every: u32) -> bool {
    *counter += 1;
    if *counter >= every {
        *counter = 0;
        true
    } else {
        false
    }
}

fn regenerate(pool: &mut Pool, divisor: u16) -> bool {
    if pool.is_full() {
        return false;
    }
    pool.restore((pool.max / divisor).max(1)) > 0
}

/// Result of one upkeep step on a locked character
#[derive(Default)]
struct Upkeep {
    packets: SmallVec<[ServerPacket; 4]>,
    poison: bool,
}

fn upkeep(world: &World, c: &mut Character, now: Instant) -> Upkeep {
    let mut out = Upkeep::default();

    let paralysis_over = c.paralyzed_until.is_some_and(|t| t <= now);
    let immobility_over = c.immobilized_until.is_some_and(|t| t <= now);
    if paralysis_over {
        c.paralyzed_until = None;
    }
    if immobility_over {
        c.immobilized_until = None;
    }
    if (paralysis_over || immobility_over) && !c.is_rooted(now) {
        out.packets.push(ServerPacket::Paralyzed { paralyzed: false });
    }

    if c.is_dead() {
        return out;
    }

    let mut needs_changed = false;
    if tick(&mut c.regen.hunger, HUNGER_TICKS) && c.hunger > 0 {
        c.hunger = c.hunger.saturating_sub(NEED_DECAY);
        needs_changed = true;
    }
    if tick(&mut c.regen.thirst, THIRST_TICKS) && c.thirst > 0 {
        c.thirst = c.thirst.saturating_sub(NEED_DECAY);
        needs_changed = true;
    }
    if needs_changed {
        out.packets.push(ServerPacket::UpdateHungerThirst {
            hunger: c.hunger,
            thirst: c.thirst,
        });
    }

    // Starving characters stop regenerating stamina and HP
    let fed = c.hunger > 0 && c.thirst > 0;
    let mut stats_changed = false;
    if tick(&mut c.regen.stamina, STAMINA_TICKS) && fed {
        stats_changed |= regenerate(&mut c.stamina, STAMINA_DIVISOR);
    }
    if tick(&mut c.regen.hp, HP_TICKS) && fed && !c.flags.poisoned {
        stats_changed |= regenerate(&mut c.hp, HP_DIVISOR);
    }
    if tick(&mut c.regen.mana, MANA_TICKS) {
        stats_changed |= regenerate(&mut c.mana, MANA_DIVISOR);
    }
    if stats_changed {
        out.packets.push(world.stats_packet(c));
    }

    if c.flags.poisoned {
        out.poison = tick(&mut c.regen.poison, POISON_TICKS);
    } else {
        c.regen.poison = 0;
    }
    out
}

pub struct RegenTask {
    period: Duration,
    rng: StdRng,
}

impl RegenTask {
    pub fn new(period: Duration, seed: u64) -> Self {
        Self {
            period,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn run_once(&mut self, world: &World, now: Instant) {
        let mut poisoned: SmallVec<[CharIndex; 16]> = SmallVec::new();
        for (ci, handle) in world.characters.entries() {
            let result = {
                let mut c = handle.lock();
                upkeep(world, &mut c, now)
            };
            for packet in result.packets {
                world.send(ci, packet);
            }
            if result.poison {
                poisoned.push(ci);
            }
        }

        for ci in poisoned {
            let damage = self.rng.gen_range(POISON_DAMAGE_MIN..=POISON_DAMAGE_MAX);
            world.console(ci, "You feel the poison in your veins.", Font::Warning);
            match world.damage_character(ci, damage, None) {
                Ok(true) => tracing::debug!("Character {} died of poison", ci),
                Ok(false) => {}
                Err(e) => tracing::debug!("Poison tick on {} skipped: {}", ci, e),
            }
        }
    }
}

impl PeriodicTask for RegenTask {
    fn name(&self) -> &'static str {
        "regeneration"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run(&mut self, world: &World, now: Instant) {
        self.run_once(world, now);
    }
}
