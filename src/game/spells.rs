//! Spell casting for characters and NPCs

use std::time::Instant;

use rand::Rng;

use crate::game::character::train;
use crate::game::combat::{Combatant, TargetKind};
use crate::game::constants::aoi;
use crate::game::definitions::{SpellDef, SpellEffect, SpellTargeting};
use crate::game::index_allocator::{CharIndex, NpcIndex};
use crate::game::world::{World, WorldError};
use crate::net::aoi::in_range;
use crate::net::protocol::{Font, ServerPacket};
use crate::util::position::Position;

/// Overhead colour for spoken spell words
const WORDS_COLOR: u32 = 0x00_FF_FF_80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpellRejection {
    CasterDead,
    NotKnown,
    NoMana,
    TooSoon,
    NoTarget,
    WrongTarget,
    OutOfRange,
    TargetDead,
    SafeZone,
    PkForbidden,
}

impl SpellRejection {
    pub fn message(self) -> Option<&'static str> {
        match self {
            SpellRejection::CasterDead => Some("You can't cast spells while dead."),
            SpellRejection::NotKnown => Some("You don't know that spell."),
            SpellRejection::NoMana => Some("You don't have enough mana."),
            SpellRejection::TooSoon => None,
            SpellRejection::NoTarget => Some("There is nothing to cast on there."),
            SpellRejection::WrongTarget => Some("That spell can't be cast on that target."),
            SpellRejection::OutOfRange => Some("Your target is too far away."),
            SpellRejection::TargetDead => Some("Your target is dead."),
            SpellRejection::SafeZone => Some("Hostile magic is not allowed in a safe zone."),
            SpellRejection::PkForbidden => Some("Player combat is not allowed here."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpellOutcome {
    Rejected(SpellRejection),
    Cast { target: TargetKind, amount: u16 },
}

/// Whether `targeting` accepts `target`
pub fn accepts(targeting: SpellTargeting, target: TargetKind) -> bool {
    matches!(
        (targeting, target),
        (SpellTargeting::Character | SpellTargeting::Any, TargetKind::Character(_))
            | (SpellTargeting::Npc | SpellTargeting::Any, TargetKind::Npc(_))
    )
}

struct CasterSnapshot {
    position: Position,
    spell: u16,
    magic: u8,
    criminal: bool,
}

impl World {
    fn reject_spell(&self, ci: CharIndex, reason: SpellRejection) -> SpellOutcome {
        if let Some(text) = reason.message() {
            self.console(ci, text, Font::Info);
        }
        SpellOutcome::Rejected(reason)
    }

    /// Cast the `slot`-th known spell at the tile `at`
    pub fn cast_spell<R: Rng + ?Sized>(
        &self,
        ci: CharIndex,
        slot: usize,
        at: Position,
        now: Instant,
        rng: &mut R,
    ) -> Result<SpellOutcome, WorldError> {
        let handle = self
            .characters
            .get(ci)
            .ok_or(WorldError::UnknownCharacter(ci))?;
        let caster = {
            let c = handle.lock();
            let known = c.spells.get(slot).copied();
            match known.and_then(|id| self.definitions().spell(id)) {
                _ if c.is_dead() => Err(SpellRejection::CasterDead),
                None => Err(SpellRejection::NotKnown),
                Some(def) if c.mana.current < def.mana_cost => Err(SpellRejection::NoMana),
                Some(_) if !c.timers.can_cast_spell(&self.settings().intervals, now) => {
                    Err(SpellRejection::TooSoon)
                }
                Some(def) => Ok(CasterSnapshot {
                    position: c.position,
                    spell: def.id,
                    magic: c.skills.magic,
                    criminal: c.flags.criminal,
                }),
            }
        };
        let caster = match caster {
            Ok(c) => c,
            Err(reason) => return Ok(self.reject_spell(ci, reason)),
        };
        let Some(def) = self.definitions().spell(caster.spell) else {
            return Ok(self.reject_spell(ci, SpellRejection::NotKnown));
        };

        if !in_range(&caster.position, &at)
            || caster.position.distance(&at) > aoi::MAX_TARGET_DISTANCE
        {
            return Ok(self.reject_spell(ci, SpellRejection::OutOfRange));
        }
        let target = self.target_at(&at);
        if let TargetKind::Position(_) = target {
            return Ok(self.reject_spell(ci, SpellRejection::NoTarget));
        }
        if !accepts(def.targeting, target) {
            return Ok(self.reject_spell(ci, SpellRejection::WrongTarget));
        }
        if let Err(reason) = self.check_spell_target(ci, def, target, &caster.position) {
            return Ok(self.reject_spell(ci, reason));
        }

        let stats = {
            let mut c = handle.lock();
            c.mana.drain(def.mana_cost);
            c.timers.update_cast(now);
            if def.effect.is_hostile() {
                c.last_target = target.combatant();
            }
            self.stats_packet(&c)
        };
        self.send(ci, stats);
        if !def.words.is_empty() {
            self.broadcast_area(
                &caster.position,
                &ServerPacket::ChatOverHead {
                    index: ci,
                    text: def.words.clone(),
                    color: WORDS_COLOR,
                },
                None,
            );
        }

        if def.effect.is_hostile() && !caster.criminal {
            if let TargetKind::Character(victim) = target {
                let innocent = self
                    .characters
                    .get(victim)
                    .is_some_and(|h| !h.lock().flags.criminal);
                if innocent {
                    self.mark_criminal(ci);
                }
            }
        }

        let bonus = u16::from(caster.magic / 10);
        let amount = match target.combatant() {
            Some(combatant) => {
                self.apply_spell(def, combatant, Some(Combatant::Character(ci)), bonus, at, now, rng)?
            }
            None => 0,
        };
        if rng.gen_ratio(1, 10) {
            if let Some(handle) = self.characters.get(ci) {
                train(&mut handle.lock().skills.magic);
            }
        }
        Ok(SpellOutcome::Cast { target, amount })
    }

    fn check_spell_target(
        &self,
        ci: CharIndex,
        def: &SpellDef,
        target: TargetKind,
        caster_pos: &Position,
    ) -> Result<(), SpellRejection> {
        let (dead, position, own_pet) = match target {
            TargetKind::Character(t) => {
                let Some(handle) = self.characters.get(t) else {
                    return Err(SpellRejection::NoTarget);
                };
                let c = handle.lock();
                (c.is_dead(), c.position, false)
            }
            TargetKind::Npc(n) => {
                let Some(handle) = self.npcs.get(n) else {
                    return Err(SpellRejection::NoTarget);
                };
                let npc = handle.lock();
                (npc.is_dead(), npc.position, npc.owner == Some(ci))
            }
            TargetKind::Position(_) => return Err(SpellRejection::NoTarget),
        };
        if dead {
            return Err(SpellRejection::TargetDead);
        }
        if !def.effect.is_hostile() {
            return Ok(());
        }
        if own_pet || target == TargetKind::Character(ci) {
            return Err(SpellRejection::WrongTarget);
        }
        if self.is_safe_zone(caster_pos) || self.is_safe_zone(&position) {
            return Err(SpellRejection::SafeZone);
        }
        if matches!(target, TargetKind::Character(_)) && !self.is_pk_allowed(position.region) {
            return Err(SpellRejection::PkForbidden);
        }
        Ok(())
    }

    /// Apply a spell's effect to a combatant. Returns the HP amount moved.
    #[allow(clippy::too_many_arguments)]
    fn apply_spell<R: Rng + ?Sized>(
        &self,
        def: &SpellDef,
        target: Combatant,
        source: Option<Combatant>,
        bonus: u16,
        at: Position,
        now: Instant,
        rng: &mut R,
    ) -> Result<u16, WorldError> {
        let paralysis = self.settings().paralysis;
        let caster = match source {
            Some(Combatant::Character(ci)) => Some(ci),
            _ => None,
        };
        let mut amount = 0;
        match target {
            Combatant::Character(victim) => {
                let handle = self
                    .characters
                    .get(victim)
                    .ok_or(WorldError::UnknownCharacter(victim))?;
                match def.effect {
                    SpellEffect::Damage { min, max } => {
                        amount = rng.gen_range(min..=max.max(min)).saturating_add(bonus);
                        self.damage_character(victim, amount, source)?;
                    }
                    SpellEffect::Heal { min, max } => {
                        let roll = rng.gen_range(min..=max.max(min)).saturating_add(bonus);
                        let hp = {
                            let mut c = handle.lock();
                            amount = c.hp.restore(roll);
                            c.hp.current
                        };
                        self.send(victim, ServerPacket::UpdateHp { hp });
                    }
                    SpellEffect::Paralyze => {
                        handle.lock().paralyzed_until = Some(now + paralysis);
                        self.send(victim, ServerPacket::Paralyzed { paralyzed: true });
                    }
                    SpellEffect::Immobilize => {
                        handle.lock().immobilized_until = Some(now + paralysis);
                        self.send(victim, ServerPacket::Paralyzed { paralyzed: true });
                    }
                    SpellEffect::RemoveParalysis => {
                        {
                            let mut c = handle.lock();
                            c.paralyzed_until = None;
                            c.immobilized_until = None;
                        }
                        self.send(victim, ServerPacket::Paralyzed { paralyzed: false });
                    }
                    SpellEffect::Poison => {
                        handle.lock().flags.poisoned = true;
                        self.console(victim, "You have been poisoned!", Font::Warning);
                    }
                    SpellEffect::CurePoison => {
                        handle.lock().flags.poisoned = false;
                        self.console(victim, "You have been cured of poison.", Font::Info);
                    }
                }
            }
            Combatant::Npc(ni) => {
                let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
                if def.effect.is_hostile() {
                    let mut npc = handle.lock();
                    if npc.owner.is_none() {
                        if let Some(ci) = caster {
                            npc.attacked_by = Some(ci);
                        }
                    }
                }
                match def.effect {
                    SpellEffect::Damage { min, max } => {
                        amount = rng.gen_range(min..=max.max(min)).saturating_add(bonus);
                        self.damage_npc(ni, amount, caster, now, rng)?;
                    }
                    SpellEffect::Heal { min, max } => {
                        let roll = rng.gen_range(min..=max.max(min)).saturating_add(bonus);
                        amount = handle.lock().hp.restore(roll);
                    }
                    SpellEffect::Paralyze => handle.lock().paralyzed_until = Some(now + paralysis),
                    SpellEffect::Immobilize => {
                        handle.lock().immobilized_until = Some(now + paralysis)
                    }
                    SpellEffect::RemoveParalysis => {
                        let mut npc = handle.lock();
                        npc.paralyzed_until = None;
                        npc.immobilized_until = None;
                    }
                    SpellEffect::Poison => handle.lock().poisoned = true,
                    SpellEffect::CurePoison => handle.lock().poisoned = false,
                }
            }
        }

        if def.fx != 0 {
            self.fx_on(target, &at, def.fx);
        }
        if def.sound != 0 {
            self.sound_at(&at, def.sound);
        }
        Ok(amount)
    }

    /// NPC casts `spell` on a character. Returns false if nothing was cast.
    pub fn npc_cast_spell<R: Rng + ?Sized>(
        &self,
        ni: NpcIndex,
        victim: CharIndex,
        spell: u16,
        now: Instant,
        rng: &mut R,
    ) -> Result<bool, WorldError> {
        let Some(def) = self.definitions().spell(spell) else {
            tracing::warn!("NPC {} references unknown spell {}", ni, spell);
            return Ok(false);
        };
        let handle = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        let (position, def_id) = {
            let npc = handle.lock();
            (npc.position, npc.def_id)
        };
        let interval = match self.definitions().npc(def_id) {
            Some(npc_def) => self.npc_attack_interval(npc_def),
            None => self.settings().npc_attack_interval,
        };
        {
            let npc = handle.lock();
            if npc.is_dead() || npc.last_cast.is_some_and(|t| now.saturating_duration_since(t) < interval) {
                return Ok(false);
            }
        }
        let target_pos = match self.characters.get(victim) {
            Some(h) => {
                let c = h.lock();
                if c.is_dead() {
                    return Ok(false);
                }
                c.position
            }
            None => return Ok(false),
        };
        if !in_range(&position, &target_pos)
            || position.distance(&target_pos) > aoi::MAX_TARGET_DISTANCE
            || (def.effect.is_hostile()
                && (self.is_safe_zone(&position) || self.is_safe_zone(&target_pos)))
        {
            return Ok(false);
        }
        {
            let mut npc = handle.lock();
            npc.last_cast = Some(now);
            npc.last_attack = Some(now);
        }
        if let Some(npc_def) = self.definitions().npc(def_id) {
            self.console(
                victim,
                format!("The {} casts {} on you.", npc_def.name, def.name),
                Font::Combat,
            );
        }
        self.apply_spell(
            def,
            Combatant::Character(victim),
            Some(Combatant::Npc(ni)),
            0,
            target_pos,
            now,
            rng,
        )?;
        Ok(true)
    }
}
