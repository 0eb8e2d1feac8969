//! Combat resolution
//!
//! The formulas are pure functions over character and NPC data. The engine
//! half snapshots both combatants (never holding two entity locks at once),
//! checks preconditions in a fixed order, rolls, and applies the result
//! through the world store so the area hears about it.

use std::time::Instant;

use rand::Rng;

use crate::game::character::{train, Character};
use crate::game::constants::{aoi, combat};
use crate::game::definitions::{DefinitionStore, NpcDef, ObjectKind};
use crate::game::index_allocator::{CharIndex, NpcIndex};
use crate::game::respawn_queue::RespawnRequest;
use crate::game::tile::GroundObject;
use crate::game::world::{World, WorldError};
use crate::net::aoi::in_range;
use crate::net::protocol::{EntityKind, Font, ServerPacket, TileCoord};
use crate::util::position::Position;

// ============================================================================
// Targets
// ============================================================================

/// A live participant in combat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Combatant {
    Character(CharIndex),
    Npc(NpcIndex),
}

/// What an attack, spell or tool is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Character(CharIndex),
    Npc(NpcIndex),
    /// A tile with nobody on it
    Position(Position),
}

impl TargetKind {
    pub fn combatant(self) -> Option<Combatant> {
        match self {
            TargetKind::Character(ci) => Some(Combatant::Character(ci)),
            TargetKind::Npc(ni) => Some(Combatant::Npc(ni)),
            TargetKind::Position(_) => None,
        }
    }
}

impl World {
    /// Resolve whoever stands on `pos`; characters take precedence
    pub fn target_at(&self, pos: &Position) -> TargetKind {
        match self.occupants(pos) {
            (Some(ci), _) => TargetKind::Character(ci),
            (None, Some(ni)) => TargetKind::Npc(ni),
            (None, None) => TargetKind::Position(*pos),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackRejection {
    AttackerDead,
    Exhausted,
    TooSoon,
    NoTarget,
    TargetDead,
    SelfTarget,
    SafeZone,
    PkForbidden,
    OwnPet,
    NeedsRangedWeapon,
    OutOfRange,
}

impl AttackRejection {
    /// Console text for the attacking player, if any
    pub fn message(self) -> Option<&'static str> {
        match self {
            AttackRejection::AttackerDead => Some("You can't attack while dead."),
            AttackRejection::Exhausted => Some("You are too tired to fight."),
            AttackRejection::TooSoon | AttackRejection::NoTarget => None,
            AttackRejection::TargetDead => Some("Your target is already dead."),
            AttackRejection::SelfTarget => Some("You can't attack yourself."),
            AttackRejection::SafeZone => Some("Fighting is not allowed in a safe zone."),
            AttackRejection::PkForbidden => Some("Player combat is not allowed here."),
            AttackRejection::OwnPet => Some("You can't attack your own pet."),
            AttackRejection::NeedsRangedWeapon => Some("You need a ranged weapon."),
            AttackRejection::OutOfRange => Some("Your target is too far away."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackOutcome {
    Rejected(AttackRejection),
    Missed,
    Hit { damage: u16, killed: bool },
}

// ============================================================================
// Formulas
// ============================================================================

/// Weapon category deciding which skill and weights apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackStyle {
    Melee,
    Ranged,
    Unarmed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offense {
    pub style: AttackStyle,
    pub power: f32,
    /// (min, max) of the wielded weapon
    pub weapon: Option<(u16, u16)>,
    pub strength: u8,
    pub min_hit: u16,
    pub max_hit: u16,
    pub damage_modifier: f32,
}

pub fn level_bonus(level: u8) -> f32 {
    f32::from(level.saturating_sub(combat::LEVEL_BONUS_THRESHOLD)) * combat::LEVEL_BONUS_PER_LEVEL
}

/// Percent chance to hit, clamped to the configured bounds
pub fn hit_chance(power: f32, evasion: f32) -> i32 {
    let raw = combat::BASE_HIT_CHANCE + combat::HIT_CHANCE_SLOPE * (power - evasion);
    (raw.round() as i32).clamp(combat::MIN_HIT_CHANCE, combat::MAX_HIT_CHANCE)
}

/// `roll` is uniform in 1..=100
#[inline]
pub fn roll_hits(chance: i32, roll: i32) -> bool {
    roll <= chance
}

pub fn roll_hit<R: Rng + ?Sized>(chance: i32, rng: &mut R) -> bool {
    roll_hits(chance, rng.gen_range(1..=100))
}

fn weapon_stats(c: &Character, defs: &dyn DefinitionStore) -> Option<(u16, u16, bool, bool)> {
    let object = c.equipped_object(c.equipment.weapon)?;
    match defs.object(object)?.kind {
        ObjectKind::Weapon {
            min_hit,
            max_hit,
            ranged,
            unarmed,
            ..
        } => Some((min_hit, max_hit, ranged, unarmed)),
        _ => None,
    }
}

pub fn has_ranged_weapon(c: &Character, defs: &dyn DefinitionStore) -> bool {
    weapon_stats(c, defs).is_some_and(|(_, _, ranged, _)| ranged)
}

pub fn offense(c: &Character, defs: &dyn DefinitionStore) -> Offense {
    let m = c.archetype.modifiers();
    let weapon = weapon_stats(c, defs);
    let (style, skill, power_modifier, damage_modifier) = match weapon {
        Some((_, _, true, _)) => (AttackStyle::Ranged, c.skills.ranged, m.ranged_power, m.ranged_damage),
        Some((_, _, _, false)) => (AttackStyle::Melee, c.skills.melee, m.melee_power, m.melee_damage),
        _ => (AttackStyle::Unarmed, c.skills.unarmed, m.unarmed_power, m.unarmed_damage),
    };
    let weapon_max = weapon.map_or(0, |(_, max, _, _)| max);
    let power = (f32::from(skill) + f32::from(c.attributes.dexterity) / 2.0) * power_modifier
        + f32::from(weapon_max)
        + level_bonus(c.level);
    Offense {
        style,
        power,
        weapon: weapon.map(|(min, max, _, _)| (min, max)),
        strength: c.attributes.strength,
        min_hit: c.min_hit,
        max_hit: c.max_hit,
        damage_modifier,
    }
}

pub fn evasion(c: &Character, defs: &dyn DefinitionStore) -> f32 {
    let m = c.archetype.modifiers();
    let mut evasion = (f32::from(c.skills.tactics) + f32::from(c.attributes.dexterity) / 2.0)
        * m.evasion
        + level_bonus(c.level);
    let shield = c
        .equipped_object(c.equipment.shield)
        .and_then(|id| defs.object(id))
        .is_some_and(|d| matches!(d.kind, ObjectKind::Shield { .. }));
    if shield {
        evasion += f32::from(c.skills.shield) * m.shield / 2.0;
    }
    evasion
}

fn roll_range<R: Rng + ?Sized>(min: u16, max: u16, rng: &mut R) -> u16 {
    rng.gen_range(min..=max.max(min))
}

/// Damage before the defender's mitigation
pub fn damage_roll<R: Rng + ?Sized>(offense: &Offense, rng: &mut R) -> f32 {
    let (base, weapon_max) = match offense.weapon {
        Some((min, max)) => (roll_range(min, max, rng), max),
        None => (
            roll_range(combat::UNARMED_MIN_HIT, combat::UNARMED_MAX_HIT, rng),
            0,
        ),
    };
    let strength_bonus = f32::from(weapon_max) / 5.0
        * f32::from(offense.strength.saturating_sub(combat::STRENGTH_BONUS_THRESHOLD));
    let own = roll_range(offense.min_hit, offense.max_hit, rng);
    (f32::from(base) + strength_bonus + f32::from(own)) * offense.damage_modifier
}

/// Sum of rolls over worn armor, helmet and shield
pub fn armor_roll<R: Rng + ?Sized>(c: &Character, defs: &dyn DefinitionStore, rng: &mut R) -> u16 {
    [c.equipment.armor, c.equipment.helmet, c.equipment.shield]
        .into_iter()
        .filter_map(|held| c.equipped_object(held))
        .filter_map(|id| defs.object(id))
        .map(|def| match def.kind {
            ObjectKind::Armor { min_def, max_def, .. }
            | ObjectKind::Helmet { min_def, max_def, .. }
            | ObjectKind::Shield { min_def, max_def, .. } => roll_range(min_def, max_def, rng),
            _ => 0,
        })
        .fold(0u16, u16::saturating_add)
}

/// Subtract defense and floor at one
pub fn mitigate(raw: f32, defense: u16) -> u16 {
    (raw - f32::from(defense)).round().clamp(1.0, f32::from(u16::MAX)) as u16
}

/// Experience for taking `dealt` HP off an NPC, capped by what is left
pub fn experience_share(def: &NpcDef, dealt: u16, max_hp: u16, pool: u32) -> u32 {
    let share = u64::from(def.experience) * u64::from(dealt) / u64::from(max_hp.max(1));
    (share.min(u64::from(u32::MAX)) as u32).min(pool)
}

// ============================================================================
// Engine
// ============================================================================

struct AttackerSnapshot {
    position: Position,
    offense: Offense,
    criminal: bool,
    name: String,
}

struct DefenderSnapshot {
    position: Position,
    evasion: f32,
    defense: u16,
    criminal: bool,
    name: String,
}

impl World {
    fn reject(&self, ci: CharIndex, reason: AttackRejection) -> AttackOutcome {
        if let Some(text) = reason.message() {
            self.console(ci, text, Font::Combat);
        }
        AttackOutcome::Rejected(reason)
    }

    pub(crate) fn sound_at(&self, pos: &Position, sound: u16) {
        self.broadcast_area(
            pos,
            &ServerPacket::PlaySound {
                sound,
                at: TileCoord::from(*pos),
            },
            None,
        );
    }

    pub(crate) fn fx_on(&self, target: Combatant, pos: &Position, fx: u16) {
        let (kind, index) = match target {
            Combatant::Character(ci) => (EntityKind::Character, ci),
            Combatant::Npc(ni) => (EntityKind::Npc, ni),
        };
        self.broadcast_area(
            pos,
            &ServerPacket::CreateFx {
                kind,
                index,
                fx,
                loops: 0,
            },
            None,
        );
    }

    /// Melee swing at whatever stands on the faced tile
    pub fn melee_attack<R: Rng + ?Sized>(
        &self,
        ci: CharIndex,
        now: Instant,
        rng: &mut R,
    ) -> Result<AttackOutcome, WorldError> {
        let handle = self.characters.get(ci).ok_or(WorldError::UnknownCharacter(ci))?;
        let (position, heading) = {
            let c = handle.lock();
            (c.position, c.heading)
        };
        let target = position
            .step(heading)
            .map_or(TargetKind::Position(position), |front| self.target_at(&front));
        match target.combatant() {
            Some(target) => self.resolve_attack(ci, target, now, rng),
            None => Ok(AttackOutcome::Rejected(AttackRejection::NoTarget)),
        }
    }

    /// Shot at the occupant of `at` with a ranged weapon
    pub fn ranged_attack<R: Rng + ?Sized>(
        &self,
        ci: CharIndex,
        at: Position,
        now: Instant,
        rng: &mut R,
    ) -> Result<AttackOutcome, WorldError> {
        let handle = self.characters.get(ci).ok_or(WorldError::UnknownCharacter(ci))?;
        let (position, ranged) = {
            let c = handle.lock();
            (c.position, has_ranged_weapon(&c, self.definitions()))
        };
        if !ranged {
            return Ok(self.reject(ci, AttackRejection::NeedsRangedWeapon));
        }
        if !in_range(&position, &at) || position.distance(&at) > aoi::MAX_TARGET_DISTANCE {
            return Ok(self.reject(ci, AttackRejection::OutOfRange));
        }
        match self.target_at(&at).combatant() {
            Some(target) => self.resolve_attack(ci, target, now, rng),
            None => Ok(self.reject(ci, AttackRejection::NoTarget)),
        }
    }

    /// Character attacks a character or NPC
    ///
    /// Preconditions are checked in order and leave no trace on failure.
    /// Timer and stamina are charged whether the swing hits or not.
    pub fn resolve_attack<R: Rng + ?Sized>(
        &self,
        ci: CharIndex,
        target: Combatant,
        now: Instant,
        rng: &mut R,
    ) -> Result<AttackOutcome, WorldError> {
        let handle = self.characters.get(ci).ok_or(WorldError::UnknownCharacter(ci))?;
        let attacker = {
            let c = handle.lock();
            if c.is_dead() {
                Err(AttackRejection::AttackerDead)
            } else if c.stamina.current < combat::MIN_STAMINA {
                Err(AttackRejection::Exhausted)
            } else if !c.timers.can_attack(&self.settings().intervals, now) {
                Err(AttackRejection::TooSoon)
            } else {
                Ok(AttackerSnapshot {
                    position: c.position,
                    offense: offense(&c, self.definitions()),
                    criminal: c.flags.criminal,
                    name: c.name.clone(),
                })
            }
        };
        let attacker = match attacker {
            Ok(a) => a,
            Err(reason) => return Ok(self.reject(ci, reason)),
        };

        let defender = match self.defender_snapshot(ci, target, rng)? {
            Ok(d) => d,
            Err(reason) => return Ok(self.reject(ci, reason)),
        };

        if self.is_safe_zone(&attacker.position) || self.is_safe_zone(&defender.position) {
            return Ok(self.reject(ci, AttackRejection::SafeZone));
        }
        if matches!(target, Combatant::Character(_))
            && !self.is_pk_allowed(defender.position.region)
        {
            return Ok(self.reject(ci, AttackRejection::PkForbidden));
        }

        let chance = hit_chance(attacker.offense.power, defender.evasion);
        let hit = roll_hit(chance, rng);
        let cost = rng.gen_range(combat::STAMINA_COST_MIN..=combat::STAMINA_COST_MAX);
        let stats = {
            let mut c = handle.lock();
            c.timers.update_attack(now);
            c.stamina.drain(cost);
            c.last_target = Some(target);
            self.stats_packet(&c)
        };
        self.send(ci, stats);
        self.sound_at(&attacker.position, combat::SOUND_SWING);

        if !hit {
            self.console(ci, "You missed.", Font::Combat);
            if let Combatant::Character(victim) = target {
                self.console(
                    victim,
                    format!("{} attacked you and missed.", attacker.name),
                    Font::Combat,
                );
            }
            return Ok(AttackOutcome::Missed);
        }

        let damage = mitigate(damage_roll(&attacker.offense, rng), defender.defense);
        self.console(
            ci,
            format!("You hit {} for {}.", defender.name, damage),
            Font::Combat,
        );
        let killed = match target {
            Combatant::Character(victim) => {
                self.console(
                    victim,
                    format!("{} hit you for {}.", attacker.name, damage),
                    Font::Combat,
                );
                if !attacker.criminal && !defender.criminal {
                    self.mark_criminal(ci);
                }
                self.damage_character(victim, damage, Some(Combatant::Character(ci)))?
            }
            Combatant::Npc(ni) => self.damage_npc(ni, damage, Some(ci), now, rng)?,
        };
        self.train_attack_skill(ci, attacker.offense.style, rng);

        Ok(AttackOutcome::Hit { damage, killed })
    }

    fn defender_snapshot<R: Rng + ?Sized>(
        &self,
        attacker: CharIndex,
        target: Combatant,
        rng: &mut R,
    ) -> Result<Result<DefenderSnapshot, AttackRejection>, WorldError> {
        match target {
            Combatant::Character(victim) => {
                if victim == attacker {
                    return Ok(Err(AttackRejection::SelfTarget));
                }
                let handle = self
                    .characters
                    .get(victim)
                    .ok_or(WorldError::UnknownCharacter(victim))?;
                let c = handle.lock();
                if c.is_dead() {
                    return Ok(Err(AttackRejection::TargetDead));
                }
                Ok(Ok(DefenderSnapshot {
                    position: c.position,
                    evasion: evasion(&c, self.definitions()),
                    defense: armor_roll(&c, self.definitions(), rng),
                    criminal: c.flags.criminal,
                    name: c.name.clone(),
                }))
            }
            Combatant::Npc(ni) => {
                let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
                let npc = handle.lock();
                if npc.is_dead() {
                    return Ok(Err(AttackRejection::TargetDead));
                }
                if npc.owner == Some(attacker) {
                    return Ok(Err(AttackRejection::OwnPet));
                }
                let def = self
                    .definitions()
                    .npc(npc.def_id)
                    .ok_or(WorldError::UnknownNpcDef(npc.def_id))?;
                Ok(Ok(DefenderSnapshot {
                    position: npc.position,
                    evasion: f32::from(def.evasion),
                    defense: def.defense,
                    criminal: false,
                    name: def.name.clone(),
                }))
            }
        }
    }

    fn train_attack_skill<R: Rng + ?Sized>(&self, ci: CharIndex, style: AttackStyle, rng: &mut R) {
        // One in ten successful hits trains the skill
        if !rng.gen_ratio(1, 10) {
            return;
        }
        if let Some(handle) = self.characters.get(ci) {
            let mut c = handle.lock();
            let skill = match style {
                AttackStyle::Melee => &mut c.skills.melee,
                AttackStyle::Ranged => &mut c.skills.ranged,
                AttackStyle::Unarmed => &mut c.skills.unarmed,
            };
            train(skill);
        }
    }

    /// Flag a character as criminal and show the change to the area
    pub fn mark_criminal(&self, ci: CharIndex) {
        let Some(handle) = self.characters.get(ci) else {
            return;
        };
        let position = {
            let mut c = handle.lock();
            if c.flags.criminal {
                return;
            }
            c.flags.criminal = true;
            c.position
        };
        self.console(ci, "You are now a criminal!", Font::Warning);
        if let Some(view) = self.character_packet(ci, &position) {
            self.broadcast_area(&position, &view, None);
        }
        tracing::debug!("Character {} marked criminal", ci);
    }

    /// Take HP from a character. Returns true if this blow killed it.
    pub fn damage_character(
        &self,
        victim: CharIndex,
        damage: u16,
        source: Option<Combatant>,
    ) -> Result<bool, WorldError> {
        let handle = self
            .characters
            .get(victim)
            .ok_or(WorldError::UnknownCharacter(victim))?;
        let (position, hp, lethal) = {
            let mut c = handle.lock();
            if c.is_dead() {
                return Ok(false);
            }
            c.hp.drain(damage);
            (c.position, c.hp.current, c.hp.is_empty())
        };
        self.send(victim, ServerPacket::UpdateHp { hp });
        self.fx_on(Combatant::Character(victim), &position, combat::FX_BLOOD);
        self.sound_at(&position, combat::SOUND_HIT);
        if lethal {
            return self.kill_character(victim, source);
        }
        Ok(false)
    }

    /// Death transition for a character; a no-op on the already dead
    ///
    /// Outside safe zones and arenas everything but newbie items falls to the
    /// ground.
    pub fn kill_character(
        &self,
        victim: CharIndex,
        killer: Option<Combatant>,
    ) -> Result<bool, WorldError> {
        let handle = self
            .characters
            .get(victim)
            .ok_or(WorldError::UnknownCharacter(victim))?;
        let position = handle.lock().position;
        let keep_items = self.is_safe_zone(&position) || self.is_arena(&position);

        let (name, was_criminal, drops, slot_packets, stats) = {
            let mut c = handle.lock();
            if c.is_dead() {
                return Ok(false);
            }
            c.become_ghost();
            let mut drops = Vec::new();
            if !keep_items {
                let dropping: Vec<usize> = c
                    .inventory
                    .iter()
                    .filter(|(_, s)| !self.definitions().object(s.object).is_some_and(|d| d.newbie))
                    .map(|(slot, _)| slot)
                    .collect();
                for slot in dropping {
                    if let Some(taken) = c.inventory.take(slot, u16::MAX) {
                        c.equipment.release_slot(slot);
                        drops.push((slot, taken));
                    }
                }
            }
            let slot_packets: Vec<_> = drops
                .iter()
                .map(|(slot, _)| self.inventory_slot_packet(&c, *slot))
                .collect();
            (
                c.name.clone(),
                c.flags.criminal,
                drops,
                slot_packets,
                self.stats_packet(&c),
            )
        };

        for packet in slot_packets {
            self.send(victim, packet);
        }
        self.send(victim, stats);
        for (_, taken) in drops {
            let object = GroundObject {
                def_id: taken.object,
                amount: taken.amount,
            };
            if let Err(e) = self.drop_object_near(position, object) {
                tracing::debug!("Death drop of object {} lost: {}", taken.object, e);
            }
        }
        self.refresh_character(victim)?;
        self.sound_at(&position, combat::SOUND_DEATH);
        self.console(victim, "You are dead.", Font::Warning);

        if let Some(Combatant::Character(ci)) = killer {
            self.console(ci, format!("You killed {}!", name), Font::Combat);
            if !was_criminal {
                self.mark_criminal(ci);
            }
        }
        tracing::info!("Character {} ({}) died, killer {:?}", victim, name, killer);
        Ok(true)
    }

    /// Take HP from an NPC, crediting experience to `attacker`
    pub fn damage_npc<R: Rng + ?Sized>(
        &self,
        ni: NpcIndex,
        damage: u16,
        attacker: Option<CharIndex>,
        now: Instant,
        rng: &mut R,
    ) -> Result<bool, WorldError> {
        let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        let (position, experience, lethal) = {
            let mut npc = handle.lock();
            if npc.is_dead() {
                return Ok(false);
            }
            let def = self
                .definitions()
                .npc(npc.def_id)
                .ok_or(WorldError::UnknownNpcDef(npc.def_id))?;
            let max_hp = npc.hp.max;
            let dealt = npc.hp.drain(damage);
            let mut experience = 0;
            if attacker.is_some() {
                experience = experience_share(def, dealt, max_hp, npc.exp_pool);
                npc.exp_pool -= experience;
            }
            if npc.owner.is_none() {
                if let Some(ci) = attacker {
                    npc.attacked_by = Some(ci);
                }
            }
            let lethal = npc.is_dead();
            if lethal && attacker.is_some() {
                experience += std::mem::take(&mut npc.exp_pool);
            }
            (npc.position, experience, lethal)
        };
        self.fx_on(Combatant::Npc(ni), &position, combat::FX_BLOOD);
        self.sound_at(&position, combat::SOUND_HIT);
        if let Some(ci) = attacker {
            if experience > 0 {
                self.grant_experience(ci, experience);
            }
        }
        if lethal {
            self.kill_npc(ni, attacker, now, rng)?;
        }
        Ok(lethal)
    }

    pub fn grant_experience(&self, ci: CharIndex, amount: u32) {
        let Some(handle) = self.characters.get(ci) else {
            return;
        };
        let (levels, level, stats) = {
            let mut c = handle.lock();
            let levels = c.gain_experience(amount, &self.settings().levels);
            (levels, c.level, self.stats_packet(&c))
        };
        self.send(ci, stats);
        self.console(ci, format!("You gained {} experience.", amount), Font::Info);
        if levels > 0 {
            self.console(ci, format!("You reached level {}!", level), Font::Info);
            tracing::info!("Character {} reached level {}", ci, level);
        }
    }

    /// Remove a dead NPC: gold to the killer, loot to the ground, respawn queued
    pub fn kill_npc<R: Rng + ?Sized>(
        &self,
        ni: NpcIndex,
        killer: Option<CharIndex>,
        now: Instant,
        rng: &mut R,
    ) -> Result<(), WorldError> {
        let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        let (position, def_id) = {
            let npc = handle.lock();
            (npc.position, npc.def_id)
        };
        self.despawn_npc(ni)?;
        self.sound_at(&position, combat::SOUND_DEATH);

        let Some(def) = self.definitions().npc(def_id) else {
            return Ok(());
        };
        if let Some(ci) = killer {
            self.console(ci, format!("You killed the {}!", def.name), Font::Combat);
            if def.gold > 0 {
                if let Some(killer) = self.characters.get(ci) {
                    let stats = {
                        let mut c = killer.lock();
                        c.gold = c.gold.saturating_add(def.gold);
                        self.stats_packet(&c)
                    };
                    self.send(ci, stats);
                }
            }
        }
        for entry in &def.loot {
            if rng.gen_range(1..=100u8) > entry.chance {
                continue;
            }
            let object = GroundObject {
                def_id: entry.object,
                amount: entry.amount.max(1),
            };
            // One object per tile; the first winning roll takes it
            if self.place_object(position, object).is_ok() {
                break;
            }
        }
        if def.respawn {
            let request = RespawnRequest {
                def_id,
                region: position.region,
                due: now + self.settings().respawn_delay,
            };
            if let Err(e) = self.respawns().push(request) {
                tracing::warn!("Dropping respawn of NPC def {}: {}", def_id, e);
            }
        }
        tracing::debug!("NPC {} ({}) died at {:?}", ni, def.name, position);
        Ok(())
    }

    /// NPC melee against a character
    pub fn npc_attacks<R: Rng + ?Sized>(
        &self,
        ni: NpcIndex,
        victim: CharIndex,
        now: Instant,
        rng: &mut R,
    ) -> Result<AttackOutcome, WorldError> {
        let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        let (position, heading, def_id) = {
            let npc = handle.lock();
            (npc.position, npc.heading, npc.def_id)
        };
        let def = self
            .definitions()
            .npc(def_id)
            .ok_or(WorldError::UnknownNpcDef(def_id))?;
        let interval = self.npc_attack_interval(def);
        {
            let npc = handle.lock();
            if npc.is_dead() {
                return Ok(AttackOutcome::Rejected(AttackRejection::AttackerDead));
            }
            if !npc.can_attack(interval, now) {
                return Ok(AttackOutcome::Rejected(AttackRejection::TooSoon));
            }
        }

        let victim_handle = self
            .characters
            .get(victim)
            .ok_or(WorldError::UnknownCharacter(victim))?;
        let (target_pos, target_evasion, armor) = {
            let c = victim_handle.lock();
            if c.is_dead() {
                return Ok(AttackOutcome::Rejected(AttackRejection::TargetDead));
            }
            (
                c.position,
                evasion(&c, self.definitions()),
                armor_roll(&c, self.definitions(), rng),
            )
        };
        if position.distance(&target_pos) != 1 || !position.same_region(&target_pos) {
            return Ok(AttackOutcome::Rejected(AttackRejection::OutOfRange));
        }
        if self.is_safe_zone(&position) || self.is_safe_zone(&target_pos) {
            return Ok(AttackOutcome::Rejected(AttackRejection::SafeZone));
        }

        if let Some(facing) = position.heading_to(&target_pos).filter(|h| *h != heading) {
            self.turn_npc(ni, facing)?;
        }
        handle.lock().last_attack = Some(now);
        self.sound_at(&position, combat::SOUND_SWING);

        let chance = hit_chance(f32::from(def.attack_power), target_evasion);
        if !roll_hit(chance, rng) {
            self.console(victim, format!("The {} missed you.", def.name), Font::Combat);
            return Ok(AttackOutcome::Missed);
        }
        let damage = mitigate(f32::from(roll_range(def.min_hit, def.max_hit, rng)), armor);
        self.console(
            victim,
            format!("The {} hit you for {}.", def.name, damage),
            Font::Combat,
        );
        let killed = self.damage_character(victim, damage, Some(Combatant::Npc(ni)))?;
        Ok(AttackOutcome::Hit { damage, killed })
    }

    /// NPC melee against another NPC (pets and guards)
    pub fn npc_attacks_npc<R: Rng + ?Sized>(
        &self,
        attacker: NpcIndex,
        target: NpcIndex,
        now: Instant,
        rng: &mut R,
    ) -> Result<AttackOutcome, WorldError> {
        if attacker == target {
            return Ok(AttackOutcome::Rejected(AttackRejection::SelfTarget));
        }
        let handle = self.npcs.get(attacker).ok_or(WorldError::UnknownNpc(attacker))?;
        let (position, heading, def_id, owner) = {
            let npc = handle.lock();
            (npc.position, npc.heading, npc.def_id, npc.owner)
        };
        let def = self
            .definitions()
            .npc(def_id)
            .ok_or(WorldError::UnknownNpcDef(def_id))?;
        if !handle.lock().can_attack(self.npc_attack_interval(def), now) {
            return Ok(AttackOutcome::Rejected(AttackRejection::TooSoon));
        }

        let target_handle = self.npcs.get(target).ok_or(WorldError::UnknownNpc(target))?;
        let (target_pos, target_def_id) = {
            let npc = target_handle.lock();
            if npc.is_dead() {
                return Ok(AttackOutcome::Rejected(AttackRejection::TargetDead));
            }
            (npc.position, npc.def_id)
        };
        if position.distance(&target_pos) != 1 || !position.same_region(&target_pos) {
            return Ok(AttackOutcome::Rejected(AttackRejection::OutOfRange));
        }
        let target_def = self
            .definitions()
            .npc(target_def_id)
            .ok_or(WorldError::UnknownNpcDef(target_def_id))?;

        if let Some(facing) = position.heading_to(&target_pos).filter(|h| *h != heading) {
            self.turn_npc(attacker, facing)?;
        }
        handle.lock().last_attack = Some(now);
        self.sound_at(&position, combat::SOUND_SWING);

        let chance = hit_chance(f32::from(def.attack_power), f32::from(target_def.evasion));
        if !roll_hit(chance, rng) {
            return Ok(AttackOutcome::Missed);
        }
        let damage = mitigate(
            f32::from(roll_range(def.min_hit, def.max_hit, rng)),
            target_def.defense,
        );
        // The victim fights back
        target_handle.lock().target = Some(attacker);
        let killed = self.damage_npc(target, damage, None, now, rng)?;
        if killed {
            if let Some(ci) = owner {
                self.console(ci, format!("Your pet killed the {}.", target_def.name), Font::Combat);
            }
        }
        Ok(AttackOutcome::Hit { damage, killed })
    }

    pub fn npc_attack_interval(&self, def: &NpcDef) -> std::time::Duration {
        def.attack_interval_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or(self.settings().npc_attack_interval)
    }

    pub fn npc_move_interval(&self, def: &NpcDef) -> std::time::Duration {
        def.move_interval_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or(self.settings().npc_move_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::test_support::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    const RAT: u16 = 1;

    fn field(x: u8, y: u8) -> Position {
        Position::new(2, x, y)
    }

    /// Strong enough to sit at the hit chance cap against weak targets
    fn make_strong(world: &World, ci: CharIndex) {
        let handle = world.characters.get(ci).unwrap();
        let mut c = handle.lock();
        c.skills.melee = 100;
        c.skills.unarmed = 100;
        c.attributes.strength = 30;
        c.stamina.max = 1000;
        c.stamina.current = 1000;
    }

    fn face(world: &World, ci: CharIndex, heading: crate::util::position::Heading) {
        world.characters.get(ci).unwrap().lock().heading = heading;
    }

    #[test]
    fn test_hit_chance_example() {
        assert_eq!(hit_chance(40.0, 20.0), 58);
        assert!(roll_hits(58, 57));
        assert!(roll_hits(58, 58));
        assert!(!roll_hits(58, 59));
    }

    #[test]
    fn test_hit_chance_clamped_and_monotonic() {
        let mut last = i32::MIN;
        for power in (0..400).map(|p| p as f32) {
            let chance = hit_chance(power, 100.0);
            assert!((10..=90).contains(&chance));
            assert!(chance >= last);
            last = chance;
        }
        assert_eq!(hit_chance(0.0, 1000.0), 10);
        assert_eq!(hit_chance(1000.0, 0.0), 90);
    }

    #[test]
    fn test_level_bonus() {
        assert_eq!(level_bonus(1), 0.0);
        assert_eq!(level_bonus(12), 0.0);
        assert_eq!(level_bonus(14), 5.0);
    }

    #[test]
    fn test_mitigate_floors_at_one() {
        assert_eq!(mitigate(3.0, 10), 1);
        assert_eq!(mitigate(12.4, 2), 10);
    }

    #[test]
    fn test_offense_uses_weapon_category() {
        let defs = definitions();
        let mut c = Character::new("Archer", crate::game::character::Archetype::Hunter, 1, 1, 1, field(10, 10));
        assert_eq!(offense(&c, defs.as_ref()).style, AttackStyle::Unarmed);

        c.inventory.add(2, 1);
        c.equipment.weapon = Some(0);
        let bow = offense(&c, defs.as_ref());
        assert_eq!(bow.style, AttackStyle::Ranged);
        assert_eq!(bow.weapon, Some((1, 6)));
        assert!(has_ranged_weapon(&c, defs.as_ref()));
    }

    #[test]
    fn test_experience_share_capped() {
        let defs = definitions();
        let rat = defs.npc(RAT).unwrap();
        assert_eq!(experience_share(rat, 10, 20, 40), 20);
        assert_eq!(experience_share(rat, 10, 20, 5), 5);
    }

    #[test]
    fn test_attack_interval_rejects_without_hp_change() {
        let (world, _) = world();
        let a = spawn_character(&world, "Aaa", field(20, 20));
        let b = spawn_character(&world, "Bbb", field(20, 19));
        make_strong(&world, a);
        face(&world, a, crate::util::position::Heading::North);
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();

        let first = world.melee_attack(a, now, &mut rng).unwrap();
        assert!(!matches!(first, AttackOutcome::Rejected(_)));
        let hp_a = world.characters.get(a).unwrap().lock().hp.current;
        let hp_b = world.characters.get(b).unwrap().lock().hp.current;

        let second = world
            .melee_attack(a, now + Duration::from_millis(100), &mut rng)
            .unwrap();
        assert_eq!(second, AttackOutcome::Rejected(AttackRejection::TooSoon));
        assert_eq!(world.characters.get(a).unwrap().lock().hp.current, hp_a);
        assert_eq!(world.characters.get(b).unwrap().lock().hp.current, hp_b);
    }

    #[test]
    fn test_pvp_forbidden_in_non_pk_region() {
        let (world, _) = world();
        let a = spawn_character(&world, "Aaa", Position::new(1, 20, 20));
        let b = spawn_character(&world, "Bbb", Position::new(1, 20, 19));
        let mut rng = StdRng::seed_from_u64(2);
        let outcome = world
            .resolve_attack(a, Combatant::Character(b), Instant::now(), &mut rng)
            .unwrap();
        assert_eq!(outcome, AttackOutcome::Rejected(AttackRejection::PkForbidden));
        // Nothing was charged
        let c = world.characters.get(a).unwrap();
        assert!(c.lock().timers.last_attack.is_none());
    }

    #[test]
    fn test_safe_zone_blocks_attack() {
        let (world, _) = world_with(|_, field| {
            field.tile_mut(20, 19).trigger = crate::game::tile::Trigger::SafeZone;
        });
        let a = spawn_character(&world, "Aaa", field(20, 20));
        let b = spawn_character(&world, "Bbb", field(20, 19));
        let mut rng = StdRng::seed_from_u64(3);
        let outcome = world
            .resolve_attack(a, Combatant::Character(b), Instant::now(), &mut rng)
            .unwrap();
        assert_eq!(outcome, AttackOutcome::Rejected(AttackRejection::SafeZone));
    }

    #[test]
    fn test_exhausted_attacker_rejected() {
        let (world, _) = world();
        let a = spawn_character(&world, "Aaa", field(20, 20));
        let ni = world.spawn_npc(RAT, field(20, 19)).unwrap();
        world.characters.get(a).unwrap().lock().stamina.current = 5;
        let mut rng = StdRng::seed_from_u64(4);
        let outcome = world
            .resolve_attack(a, Combatant::Npc(ni), Instant::now(), &mut rng)
            .unwrap();
        assert_eq!(outcome, AttackOutcome::Rejected(AttackRejection::Exhausted));
    }

    #[test]
    fn test_killing_npc_grants_pool_loot_and_respawn() {
        let (world, _) = world();
        let a = spawn_character(&world, "Hunter", field(20, 20));
        let ni = world.spawn_npc(RAT, field(20, 19)).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let now = Instant::now();

        assert!(!world.damage_npc(ni, 5, Some(a), now, &mut rng).unwrap());
        // 5 of 20 HP -> a quarter of 40 experience
        assert_eq!(world.npcs.get(ni).unwrap().lock().exp_pool, 30);
        assert_eq!(world.npcs.get(ni).unwrap().lock().attacked_by, Some(a));

        assert!(world.damage_npc(ni, 50, Some(a), now, &mut rng).unwrap());
        assert!(!world.npcs.contains(ni));
        assert_eq!(world.occupants(&field(20, 19)).1, None);

        let c = world.characters.get(a).unwrap();
        let total = {
            let c = c.lock();
            c.experience
        };
        assert_eq!(total, 40);
        assert_eq!(
            world.object_at(&field(20, 19)),
            Some(GroundObject { def_id: 9, amount: 1 })
        );
        assert_eq!(world.respawns().pending_count(), 1);
        assert!(world.respawns().drain_due(now).is_empty());
        let due = world
            .respawns()
            .drain_due(now + world.settings().respawn_delay);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].region, 2);
    }

    #[test]
    fn test_lethal_damage_kills_once() {
        let (world, outbox) = world();
        let victim = spawn_character(&world, "Victim", field(30, 30));
        {
            let handle = world.characters.get(victim).unwrap();
            let mut c = handle.lock();
            c.inventory.add(1, 1);
            c.equipment.weapon = Some(0);
            c.appearance.weapon = 3;
        }
        outbox.drain();

        assert!(world.damage_character(victim, 500, None).unwrap());
        assert!(!world.damage_character(victim, 500, None).unwrap());
        assert!(!world.kill_character(victim, None).unwrap());

        let handle = world.characters.get(victim).unwrap();
        let c = handle.lock();
        assert!(c.is_dead());
        assert_eq!(c.appearance.body, combat::DEAD_BODY);
        assert!(c.inventory.get(0).is_none());
        assert!(c.equipment.weapon.is_none());
        drop(c);
        assert_eq!(
            world.object_at(&field(30, 30)),
            Some(GroundObject { def_id: 1, amount: 1 })
        );

        let sent = outbox.drain_for(victim);
        let deaths = sent
            .iter()
            .filter(|p| matches!(p, ServerPacket::ConsoleMessage { text, .. } if text == "You are dead."))
            .count();
        assert_eq!(deaths, 1);
    }

    #[test]
    fn test_arena_death_keeps_items() {
        let (world, _) = world_with(|_, field| {
            field.tile_mut(30, 30).trigger = crate::game::tile::Trigger::Arena;
        });
        let victim = spawn_character(&world, "Victim", field(30, 30));
        world.characters.get(victim).unwrap().lock().inventory.add(1, 1);

        assert!(world.kill_character(victim, None).unwrap());
        assert!(world.characters.get(victim).unwrap().lock().inventory.get(0).is_some());
        assert_eq!(world.object_at(&field(30, 30)), None);
    }

    #[test]
    fn test_attack_dead_target_rejected() {
        let (world, _) = world();
        let a = spawn_character(&world, "Aaa", field(20, 20));
        let b = spawn_character(&world, "Bbb", field(20, 19));
        world.kill_character(b, None).unwrap();
        let mut rng = StdRng::seed_from_u64(6);
        let outcome = world
            .resolve_attack(a, Combatant::Character(b), Instant::now(), &mut rng)
            .unwrap();
        assert_eq!(outcome, AttackOutcome::Rejected(AttackRejection::TargetDead));
    }

    #[test]
    fn test_pvp_hit_marks_attacker_criminal() {
        let (world, _) = world();
        let a = spawn_character(&world, "Aaa", field(20, 20));
        let b = spawn_character(&world, "Bbb", field(20, 19));
        make_strong(&world, a);
        let mut rng = StdRng::seed_from_u64(7);
        let mut now = Instant::now();

        let mut hit = false;
        for _ in 0..50 {
            world.characters.get(b).unwrap().lock().hp.fill();
            let outcome = world
                .resolve_attack(a, Combatant::Character(b), now, &mut rng)
                .unwrap();
            now += Duration::from_secs(2);
            if let AttackOutcome::Hit { damage, .. } = outcome {
                assert!(damage >= 1);
                hit = true;
                break;
            }
        }
        assert!(hit);
        assert!(world.characters.get(a).unwrap().lock().flags.criminal);
        assert!(!world.characters.get(b).unwrap().lock().flags.criminal);
    }

    #[test]
    fn test_ranged_attack_rules() {
        let (world, _) = world();
        let a = spawn_character(&world, "Archer", field(20, 20));
        let ni = world.spawn_npc(RAT, field(24, 20)).unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        let now = Instant::now();

        let outcome = world.ranged_attack(a, field(24, 20), now, &mut rng).unwrap();
        assert_eq!(outcome, AttackOutcome::Rejected(AttackRejection::NeedsRangedWeapon));

        {
            let handle = world.characters.get(a).unwrap();
            let mut c = handle.lock();
            c.inventory.add(2, 1);
            c.equipment.weapon = Some(0);
        }
        let outcome = world.ranged_attack(a, field(50, 20), now, &mut rng).unwrap();
        assert_eq!(outcome, AttackOutcome::Rejected(AttackRejection::OutOfRange));

        let outcome = world.ranged_attack(a, field(24, 20), now, &mut rng).unwrap();
        assert!(matches!(outcome, AttackOutcome::Missed | AttackOutcome::Hit { .. }));
        assert_eq!(
            world.characters.get(a).unwrap().lock().last_target,
            Some(Combatant::Npc(ni))
        );
    }

    #[test]
    fn test_npc_attack_faces_and_respects_interval() {
        let (world, outbox) = world();
        let victim = spawn_character(&world, "Victim", field(20, 20));
        let ni = world.spawn_npc(RAT, field(21, 20)).unwrap();
        outbox.drain();
        let mut rng = StdRng::seed_from_u64(9);
        let now = Instant::now();

        let first = world.npc_attacks(ni, victim, now, &mut rng).unwrap();
        assert!(!matches!(first, AttackOutcome::Rejected(_)));
        assert_eq!(
            world.npcs.get(ni).unwrap().lock().heading,
            crate::util::position::Heading::West
        );
        assert!(outbox
            .drain_for(victim)
            .contains(&ServerPacket::NpcHeading {
                index: ni,
                heading: crate::util::position::Heading::West
            }));

        let again = world.npc_attacks(ni, victim, now, &mut rng).unwrap();
        assert_eq!(again, AttackOutcome::Rejected(AttackRejection::TooSoon));
    }
}
