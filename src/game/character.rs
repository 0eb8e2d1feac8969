//! Player characters
//!
//! `Character` is both the live state of a connected player and the record
//! written to the character store. Fields only meaningful while online are
//! skipped during serialization.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::game::constants::{character as limits, combat};
use crate::game::index_allocator::{CharIndex, NpcIndex};
use crate::game::intervals::ActionTimers;
use crate::util::position::{Heading, Position};

// ============================================================================
// Archetypes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Archetype {
    #[default]
    Warrior,
    Mage,
    Cleric,
    Paladin,
    Hunter,
    Assassin,
    Bard,
    Druid,
    Worker,
}

/// Per-archetype weights applied by the combat formulas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassModifiers {
    pub melee_power: f32,
    pub ranged_power: f32,
    pub unarmed_power: f32,
    pub evasion: f32,
    pub shield: f32,
    pub melee_damage: f32,
    pub ranged_damage: f32,
    pub unarmed_damage: f32,
}

impl Archetype {
    pub const ALL: [Archetype; 9] = [
        Archetype::Warrior,
        Archetype::Mage,
        Archetype::Cleric,
        Archetype::Paladin,
        Archetype::Hunter,
        Archetype::Assassin,
        Archetype::Bard,
        Archetype::Druid,
        Archetype::Worker,
    ];

    pub fn to_wire(self) -> u8 {
        match self {
            Archetype::Warrior => 1,
            Archetype::Mage => 2,
            Archetype::Cleric => 3,
            Archetype::Paladin => 4,
            Archetype::Hunter => 5,
            Archetype::Assassin => 6,
            Archetype::Bard => 7,
            Archetype::Druid => 8,
            Archetype::Worker => 9,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.to_wire() == value)
    }

    pub fn modifiers(self) -> ClassModifiers {
        let m = |melee_power, ranged_power, evasion, shield, melee_damage, ranged_damage| {
            ClassModifiers {
                melee_power,
                ranged_power,
                unarmed_power: 0.4,
                evasion,
                shield,
                melee_damage,
                ranged_damage,
                unarmed_damage: 0.4,
            }
        };
        match self {
            Archetype::Warrior => m(1.0, 0.8, 1.0, 1.0, 1.1, 1.0),
            Archetype::Paladin => m(0.95, 0.75, 0.9, 1.0, 0.925, 0.8),
            Archetype::Hunter => m(0.8, 1.0, 0.9, 0.8, 0.9, 1.1),
            Archetype::Assassin => m(0.85, 0.75, 1.1, 0.8, 0.9, 0.8),
            Archetype::Cleric => m(0.85, 0.7, 0.8, 0.85, 0.85, 0.7),
            Archetype::Bard => m(0.7, 0.7, 1.05, 0.75, 0.75, 0.7),
            Archetype::Druid => m(0.65, 0.75, 0.75, 0.7, 0.7, 0.75),
            Archetype::Mage => m(0.5, 0.5, 0.4, 0.6, 0.5, 0.5),
            Archetype::Worker => m(0.7, 0.7, 0.7, 0.6, 0.7, 0.7),
        }
    }

    /// (hp, mana, min hit, max hit) gained per level
    fn level_gains(self) -> (u16, u16, u16, u16) {
        match self {
            Archetype::Warrior => (10, 0, 2, 3),
            Archetype::Paladin => (9, 6, 2, 3),
            Archetype::Hunter => (8, 0, 2, 3),
            Archetype::Assassin => (8, 6, 2, 2),
            Archetype::Cleric | Archetype::Bard | Archetype::Druid => (7, 10, 1, 2),
            Archetype::Worker => (7, 0, 1, 2),
            Archetype::Mage => (6, 15, 1, 1),
        }
    }

    fn starting_mana(self) -> u16 {
        match self {
            Archetype::Mage => 50,
            Archetype::Cleric | Archetype::Druid | Archetype::Bard => 30,
            Archetype::Paladin | Archetype::Assassin => 20,
            _ => 0,
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

/// A bounded resource (health, mana, stamina)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub current: u16,
    pub max: u16,
}

impl Pool {
    pub fn full(max: u16) -> Self {
        Self { current: max, max }
    }

    /// Remove up to `amount`, returning what was actually removed
    pub fn drain(&mut self, amount: u16) -> u16 {
        let taken = amount.min(self.current);
        self.current -= taken;
        taken
    }

    /// Add up to `amount`, returning what was actually added
    pub fn restore(&mut self, amount: u16) -> u16 {
        let added = amount.min(self.max - self.current.min(self.max));
        self.current += added;
        added
    }

    pub fn fill(&mut self) {
        self.current = self.max;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.current == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.current >= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub strength: u8,
    pub dexterity: u8,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            strength: 18,
            dexterity: 18,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skills {
    pub melee: u8,
    pub ranged: u8,
    pub unarmed: u8,
    pub tactics: u8,
    pub shield: u8,
    pub magic: u8,
    pub fishing: u8,
    pub mining: u8,
    pub woodcutting: u8,
}

impl Default for Skills {
    fn default() -> Self {
        Self {
            melee: 5,
            ranged: 5,
            unarmed: 5,
            tactics: 5,
            shield: 5,
            magic: 5,
            fishing: 5,
            mining: 5,
            woodcutting: 5,
        }
    }
}

/// Raise a skill by one, saturating at the cap. Returns whether it changed.
pub fn train(skill: &mut u8) -> bool {
    if *skill < limits::MAX_SKILL {
        *skill += 1;
        true
    } else {
        false
    }
}

// ============================================================================
// Inventory & equipment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySlot {
    pub object: u16,
    pub amount: u16,
    pub equipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    slots: Vec<Option<InventorySlot>>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            slots: vec![None; limits::INVENTORY_SLOTS],
        }
    }
}

impl Inventory {
    pub fn get(&self, slot: usize) -> Option<&InventorySlot> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut InventorySlot> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    /// Stack onto matching slots first, then fill empty ones.
    /// Returns the amount that did not fit.
    pub fn add(&mut self, object: u16, amount: u16) -> u16 {
        let mut left = amount;
        for slot in self.slots.iter_mut().flatten() {
            if left == 0 {
                break;
            }
            if slot.object == object && slot.amount < limits::MAX_STACK {
                let moved = left.min(limits::MAX_STACK - slot.amount);
                slot.amount += moved;
                left -= moved;
            }
        }
        for slot in self.slots.iter_mut().filter(|s| s.is_none()) {
            if left == 0 {
                break;
            }
            let moved = left.min(limits::MAX_STACK);
            *slot = Some(InventorySlot {
                object,
                amount: moved,
                equipped: false,
            });
            left -= moved;
        }
        left
    }

    /// Remove up to `amount` from a slot. Emptied slots are cleared.
    pub fn take(&mut self, slot: usize, amount: u16) -> Option<InventorySlot> {
        let entry = self.slots.get_mut(slot)?;
        let current = entry.as_mut()?;
        let taken = amount.min(current.amount);
        if taken == 0 {
            return None;
        }
        let removed = InventorySlot {
            object: current.object,
            amount: taken,
            equipped: current.equipped,
        };
        current.amount -= taken;
        if current.amount == 0 {
            *entry = None;
        }
        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &InventorySlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }
}

/// Inventory slot held in each equipment position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub weapon: Option<usize>,
    pub armor: Option<usize>,
    pub shield: Option<usize>,
    pub helmet: Option<usize>,
    pub boat: Option<usize>,
}

impl Equipment {
    /// Forget whichever equipment position references `slot`
    pub fn release_slot(&mut self, slot: usize) {
        for held in [
            &mut self.weapon,
            &mut self.armor,
            &mut self.shield,
            &mut self.helmet,
            &mut self.boat,
        ] {
            if *held == Some(slot) {
                *held = None;
            }
        }
    }
}

/// What other clients draw for a character
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appearance {
    pub body: u16,
    pub head: u16,
    pub weapon: u16,
    pub shield: u16,
    pub helmet: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterFlags {
    pub dead: bool,
    pub sailing: bool,
    pub criminal: bool,
    pub poisoned: bool,
    pub gm: bool,
}

/// Ticks accumulated by the regeneration task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegenCounters {
    pub hunger: u32,
    pub thirst: u32,
    pub stamina: u32,
    pub hp: u32,
    pub mana: u32,
    pub poison: u32,
}

/// Experience needed to leave each level, index 0 = level 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelTable {
    thresholds: Vec<u32>,
}

impl LevelTable {
    pub fn new(thresholds: Vec<u32>) -> Self {
        Self { thresholds }
    }

    /// Geometric table: `base` for level 1, growing by `factor` each level
    pub fn geometric(max_level: u8, base: u32, factor: f32) -> Self {
        let mut thresholds = Vec::with_capacity(usize::from(max_level));
        let mut next = base as f32;
        for _ in 1..max_level {
            thresholds.push(next.min(u32::MAX as f32) as u32);
            next *= factor;
        }
        Self { thresholds }
    }

    pub fn max_level(&self) -> u8 {
        (self.thresholds.len() + 1).min(usize::from(u8::MAX)) as u8
    }

    /// Experience required to reach the next level, `None` at the cap
    pub fn next_level(&self, level: u8) -> Option<u32> {
        self.thresholds.get(usize::from(level.max(1)) - 1).copied()
    }
}

impl Default for LevelTable {
    fn default() -> Self {
        Self::geometric(50, 300, 1.2)
    }
}

// ============================================================================
// Character
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub archetype: Archetype,
    pub level: u8,
    pub experience: u32,
    pub attributes: Attributes,
    pub skills: Skills,
    pub min_hit: u16,
    pub max_hit: u16,
    pub hp: Pool,
    pub mana: Pool,
    pub stamina: Pool,
    pub hunger: u8,
    pub thirst: u8,
    pub gold: u32,
    pub inventory: Inventory,
    pub equipment: Equipment,
    pub appearance: Appearance,
    /// Body and head to restore after death or disembarking
    pub base_body: u16,
    pub base_head: u16,
    pub position: Position,
    pub heading: Heading,
    pub home_city: u16,
    pub spells: Vec<u16>,
    pub flags: CharacterFlags,

    /// Entity index while online, 0 otherwise
    #[serde(skip)]
    pub index: CharIndex,
    #[serde(skip)]
    pub timers: ActionTimers,
    #[serde(skip)]
    pub regen: RegenCounters,
    #[serde(skip)]
    pub paralyzed_until: Option<Instant>,
    #[serde(skip)]
    pub immobilized_until: Option<Instant>,
    #[serde(skip)]
    pub pets: SmallVec<[NpcIndex; 3]>,
    /// Last combatant this character attacked (pets assist against it)
    #[serde(skip)]
    pub last_target: Option<crate::game::combat::Combatant>,
}

impl Character {
    pub fn new(
        name: impl Into<String>,
        archetype: Archetype,
        body: u16,
        head: u16,
        home_city: u16,
        position: Position,
    ) -> Self {
        Self {
            name: name.into(),
            archetype,
            level: 1,
            experience: 0,
            attributes: Attributes::default(),
            skills: Skills::default(),
            min_hit: 1,
            max_hit: 2,
            hp: Pool::full(20),
            mana: Pool::full(archetype.starting_mana()),
            stamina: Pool::full(40),
            hunger: limits::MAX_HUNGER,
            thirst: limits::MAX_THIRST,
            gold: 0,
            inventory: Inventory::default(),
            equipment: Equipment::default(),
            appearance: Appearance {
                body,
                head,
                ..Default::default()
            },
            base_body: body,
            base_head: head,
            position,
            heading: Heading::default(),
            home_city,
            spells: Vec::new(),
            flags: CharacterFlags::default(),
            index: 0,
            timers: ActionTimers::default(),
            regen: RegenCounters::default(),
            paralyzed_until: None,
            immobilized_until: None,
            pets: SmallVec::new(),
            last_target: None,
        }
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.flags.dead
    }

    /// Paralyzed or immobilized at `now`
    pub fn is_rooted(&self, now: Instant) -> bool {
        self.paralyzed_until.is_some_and(|t| t > now)
            || self.immobilized_until.is_some_and(|t| t > now)
    }

    /// Object id held in an equipment position
    pub fn equipped_object(&self, held: Option<usize>) -> Option<u16> {
        held.and_then(|slot| self.inventory.get(slot)).map(|s| s.object)
    }

    /// Add experience, applying level-ups. Returns the number of levels gained.
    pub fn gain_experience(&mut self, amount: u32, table: &LevelTable) -> u8 {
        if self.level >= table.max_level() {
            return 0;
        }
        self.experience = self.experience.saturating_add(amount);
        let mut gained = 0;
        while let Some(needed) = table.next_level(self.level) {
            if self.experience < needed {
                break;
            }
            self.experience -= needed;
            self.level += 1;
            gained += 1;

            let (hp, mana, min_hit, max_hit) = self.archetype.level_gains();
            self.hp.max = self.hp.max.saturating_add(hp);
            self.mana.max = self.mana.max.saturating_add(mana);
            self.stamina.max = self.stamina.max.saturating_add(15);
            self.min_hit = self.min_hit.saturating_add(min_hit);
            self.max_hit = self.max_hit.saturating_add(max_hit);
            self.hp.fill();
        }
        if self.level >= table.max_level() {
            self.experience = 0;
        }
        gained
    }

    /// Switch to the ghost appearance and drop equipment visuals
    pub fn become_ghost(&mut self) {
        self.flags.dead = true;
        self.flags.poisoned = false;
        self.hp.current = 0;
        self.paralyzed_until = None;
        self.immobilized_until = None;
        if !self.flags.sailing {
            self.appearance = Appearance {
                body: combat::DEAD_BODY,
                head: combat::DEAD_HEAD,
                ..Default::default()
            };
        }
    }

    /// Bring a dead character back with minimal health
    pub fn revive(&mut self) {
        self.flags.dead = false;
        self.hp.current = self.hp.current.max(1);
        if !self.flags.sailing {
            self.appearance.body = self.base_body;
            self.appearance.head = self.base_head;
        }
    }
}

/// Character names: letters and single inner spaces only
pub fn is_valid_name(name: &str) -> bool {
    let len = name.chars().count();
    (3..=limits::MAX_NAME_LEN).contains(&len)
        && name.chars().all(|c| c.is_ascii_alphabetic() || c == ' ')
        && !name.starts_with(' ')
        && !name.ends_with(' ')
        && !name.contains("  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Character {
        Character::new("Aldric", Archetype::Warrior, 1, 1, 1, Position::new(1, 50, 50))
    }

    #[test]
    fn test_pool_drain_and_restore() {
        let mut pool = Pool::full(30);
        assert_eq!(pool.drain(12), 12);
        assert_eq!(pool.drain(40), 18);
        assert!(pool.is_empty());
        assert_eq!(pool.restore(50), 30);
        assert!(pool.is_full());
    }

    #[test]
    fn test_inventory_stacks_then_fills() {
        let mut inv = Inventory::default();
        assert_eq!(inv.add(7, 5), 0);
        assert_eq!(inv.add(7, 3), 0);
        assert_eq!(inv.get(0).unwrap().amount, 8);
        assert!(inv.get(1).is_none());

        assert_eq!(inv.add(9, limits::MAX_STACK + 2), 0);
        assert_eq!(inv.get(1).unwrap().amount, limits::MAX_STACK);
        assert_eq!(inv.get(2).unwrap().amount, 2);
    }

    #[test]
    fn test_inventory_full_returns_leftover() {
        let mut inv = Inventory::default();
        for id in 0..limits::INVENTORY_SLOTS as u16 {
            inv.add(id + 100, 1);
        }
        assert!(inv.is_full());
        assert_eq!(inv.add(1, 4), 4);
    }

    #[test]
    fn test_inventory_take_clears_empty_slot() {
        let mut inv = Inventory::default();
        inv.add(3, 10);
        let taken = inv.take(0, 4).unwrap();
        assert_eq!((taken.object, taken.amount), (3, 4));
        let taken = inv.take(0, 100).unwrap();
        assert_eq!(taken.amount, 6);
        assert!(inv.get(0).is_none());
        assert!(inv.take(0, 1).is_none());
    }

    #[test]
    fn test_level_up() {
        let table = LevelTable::new(vec![100, 200]);
        let mut c = sample();
        let hp_before = c.hp.max;

        assert_eq!(c.gain_experience(50, &table), 0);
        assert_eq!(c.gain_experience(260, &table), 2);
        assert_eq!(c.level, 3);
        assert_eq!(c.experience, 0);
        assert!(c.hp.max > hp_before);
        assert_eq!(c.gain_experience(1000, &table), 0);
    }

    #[test]
    fn test_ghost_and_revive() {
        let mut c = sample();
        c.become_ghost();
        assert!(c.is_dead());
        assert_eq!(c.appearance.body, combat::DEAD_BODY);
        c.revive();
        assert!(!c.is_dead());
        assert_eq!(c.appearance.body, 1);
        assert_eq!(c.hp.current, 1);
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("Aldric"));
        assert!(is_valid_name("Old Tom"));
        assert!(!is_valid_name("Al"));
        assert!(!is_valid_name(" Tom"));
        assert!(!is_valid_name("Tom  Two"));
        assert!(!is_valid_name("Tom99"));
    }

    #[test]
    fn test_archetype_wire() {
        for a in Archetype::ALL {
            assert_eq!(Archetype::from_wire(a.to_wire()), Some(a));
        }
        assert!(Archetype::from_wire(0).is_none());
    }

    #[test]
    fn test_record_skips_online_state() {
        let mut c = sample();
        c.index = 12;
        let json = serde_json::to_string(&c).unwrap();
        let back: Character = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index, 0);
        assert_eq!(back.name, "Aldric");
    }
}
