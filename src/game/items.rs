//! Inventory actions: pick up, drop, equip, use, work, tame and resurrect

use std::time::Instant;

use rand::Rng;

use crate::game::character::{train, Character};
use crate::game::combat::TargetKind;
use crate::game::constants::{character as limits, work};
use crate::game::definitions::{ObjectDef, ObjectKind, PotionStat, WorkSkill};
use crate::game::index_allocator::{CharIndex, NpcIndex};
use crate::game::tile::GroundObject;
use crate::game::world::{World, WorldError};
use crate::net::protocol::{Font, ServerPacket};
use crate::util::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRejection {
    Dead,
    NotDead,
    TooSoon,
    NothingHere,
    NotPickable,
    InventoryFull,
    EmptySlot,
    NotEquippable,
    NotUsable,
    InUse,
    NoRoom,
    NoTool,
    WrongResource,
    TooFar,
    NotTameable,
    TooManyPets,
    NotInSafeZone,
}

impl ItemRejection {
    pub fn message(self) -> Option<&'static str> {
        Some(match self {
            ItemRejection::Dead => "You can't do that while dead.",
            ItemRejection::NotDead => "You are not dead.",
            ItemRejection::TooSoon => return None,
            ItemRejection::NothingHere => "There is nothing here.",
            ItemRejection::NotPickable => "You can't pick that up.",
            ItemRejection::InventoryFull => "Your inventory is full.",
            ItemRejection::EmptySlot => "That slot is empty.",
            ItemRejection::NotEquippable => "You can't equip that.",
            ItemRejection::NotUsable => "You can't use that.",
            ItemRejection::InUse => "You can't drop the boat you are sailing.",
            ItemRejection::NoRoom => "There is no room there.",
            ItemRejection::NoTool => "You need the right tool for that.",
            ItemRejection::WrongResource => "There is nothing to gather there.",
            ItemRejection::TooFar => "That is too far away.",
            ItemRejection::NotTameable => "That creature can't be tamed.",
            ItemRejection::TooManyPets => "You can't control more pets.",
            ItemRejection::NotInSafeZone => "You can only be resurrected in a safe zone.",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Rejected(ItemRejection),
    PickedUp { object: u16, amount: u16 },
    Dropped { at: Position, amount: u16 },
    Equipped { slot: usize },
    Unequipped { slot: usize },
    Used { object: u16 },
    Sailing { sailing: bool },
    Worked { product: Option<u16> },
    Tamed { npc: NpcIndex },
    Resurrected,
}

/// Equipment position an object goes into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EquipSlot {
    Weapon,
    Armor,
    Shield,
    Helmet,
}

fn equip_slot(kind: &ObjectKind) -> Option<EquipSlot> {
    match kind {
        ObjectKind::Weapon { .. } | ObjectKind::Tool { .. } => Some(EquipSlot::Weapon),
        ObjectKind::Armor { .. } => Some(EquipSlot::Armor),
        ObjectKind::Shield { .. } => Some(EquipSlot::Shield),
        ObjectKind::Helmet { .. } => Some(EquipSlot::Helmet),
        _ => None,
    }
}

fn held_mut(c: &mut Character, slot: EquipSlot) -> &mut Option<usize> {
    match slot {
        EquipSlot::Weapon => &mut c.equipment.weapon,
        EquipSlot::Armor => &mut c.equipment.armor,
        EquipSlot::Shield => &mut c.equipment.shield,
        EquipSlot::Helmet => &mut c.equipment.helmet,
    }
}

/// Show (or clear, with `None`) an equipped object on the character
fn apply_appearance(c: &mut Character, slot: EquipSlot, def: Option<&ObjectDef>) {
    let visible_body = !c.flags.sailing && !c.is_dead();
    match (slot, def.map(|d| &d.kind)) {
        (EquipSlot::Weapon, Some(ObjectKind::Weapon { anim, .. })) => c.appearance.weapon = *anim,
        (EquipSlot::Weapon, _) => c.appearance.weapon = 0,
        (EquipSlot::Shield, Some(ObjectKind::Shield { anim, .. })) => c.appearance.shield = *anim,
        (EquipSlot::Shield, _) => c.appearance.shield = 0,
        (EquipSlot::Helmet, Some(ObjectKind::Helmet { anim, .. })) => c.appearance.helmet = *anim,
        (EquipSlot::Helmet, _) => c.appearance.helmet = 0,
        (EquipSlot::Armor, Some(ObjectKind::Armor { body, .. })) if visible_body => {
            c.appearance.body = *body
        }
        (EquipSlot::Armor, _) if visible_body => c.appearance.body = c.base_body,
        (EquipSlot::Armor, _) => {}
    }
}

/// Chance in percent that a tool use yields something
pub fn work_success_chance(skill: u8) -> u8 {
    let grown = u16::from(work::BASE_SUCCESS) + u16::from(skill) * 4 / 5;
    grown.min(u16::from(work::MAX_SUCCESS)) as u8
}

impl World {
    fn reject_item(&self, ci: CharIndex, reason: ItemRejection) -> ItemOutcome {
        if let Some(text) = reason.message() {
            self.console(ci, text, Font::Info);
        }
        ItemOutcome::Rejected(reason)
    }

    fn live_handle(
        &self,
        ci: CharIndex,
    ) -> Result<crate::game::entity_table::Shared<Character>, WorldError> {
        self.characters
            .get(ci)
            .ok_or(WorldError::UnknownCharacter(ci))
    }

    /// Take whatever lies under the character
    pub fn pick_up(&self, ci: CharIndex) -> Result<ItemOutcome, WorldError> {
        let handle = self.live_handle(ci)?;
        let (position, dead) = {
            let c = handle.lock();
            (c.position, c.is_dead())
        };
        if dead {
            return Ok(self.reject_item(ci, ItemRejection::Dead));
        }
        let Some(ground) = self.object_at(&position) else {
            return Ok(self.reject_item(ci, ItemRejection::NothingHere));
        };
        let Some(def) = self.definitions().object(ground.def_id) else {
            tracing::warn!("Ground object with unknown definition {} at {:?}", ground.def_id, position);
            return Ok(self.reject_item(ci, ItemRejection::NotPickable));
        };
        if !def.pickable {
            return Ok(self.reject_item(ci, ItemRejection::NotPickable));
        }

        let is_gold = matches!(def.kind, ObjectKind::Gold);
        let fits = if is_gold {
            ground.amount
        } else {
            let mut probe = handle.lock().inventory.clone();
            ground.amount - probe.add(ground.def_id, ground.amount)
        };
        if fits == 0 {
            return Ok(self.reject_item(ci, ItemRejection::InventoryFull));
        }
        let Some(taken) = self.take_object(&position, fits)? else {
            return Ok(self.reject_item(ci, ItemRejection::NothingHere));
        };

        let (leftover, packets) = {
            let mut c = handle.lock();
            if is_gold {
                c.gold = c.gold.saturating_add(u32::from(taken.amount));
                (0, vec![self.stats_packet(&c)])
            } else {
                let leftover = c.inventory.add(taken.def_id, taken.amount);
                let packets = c
                    .inventory
                    .iter()
                    .filter(|(_, s)| s.object == taken.def_id)
                    .map(|(slot, _)| slot)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(|slot| self.inventory_slot_packet(&c, slot))
                    .collect();
                (leftover, packets)
            }
        };
        for packet in packets {
            self.send(ci, packet);
        }
        if leftover > 0 {
            let object = GroundObject {
                def_id: taken.def_id,
                amount: leftover,
            };
            if let Err(e) = self.drop_object_near(position, object) {
                tracing::warn!("Lost {} of object {} on pickup: {}", leftover, taken.def_id, e);
            }
        }
        Ok(ItemOutcome::PickedUp {
            object: taken.def_id,
            amount: taken.amount - leftover,
        })
    }

    /// Drop `amount` from an inventory slot onto the ground
    pub fn drop_item(&self, ci: CharIndex, slot: usize, amount: u16) -> Result<ItemOutcome, WorldError> {
        let handle = self.live_handle(ci)?;
        let (position, taken, appearance) = {
            let mut c = handle.lock();
            if c.is_dead() {
                drop(c);
                return Ok(self.reject_item(ci, ItemRejection::Dead));
            }
            if c.equipment.boat == Some(slot) {
                drop(c);
                return Ok(self.reject_item(ci, ItemRejection::InUse));
            }
            let Some(taken) = c.inventory.take(slot, amount.max(1)) else {
                drop(c);
                return Ok(self.reject_item(ci, ItemRejection::EmptySlot));
            };
            let mut appearance = None;
            if taken.equipped && c.inventory.get(slot).is_none() {
                appearance = self.unequip_locked(&mut c, slot, taken.object);
            }
            (c.position, taken, appearance)
        };

        let object = GroundObject {
            def_id: taken.object,
            amount: taken.amount,
        };
        let outcome = match self.drop_object_near(position, object) {
            Ok(at) => ItemOutcome::Dropped {
                at,
                amount: taken.amount,
            },
            Err(e) => {
                tracing::debug!("Drop of object {} failed: {}", taken.object, e);
                handle.lock().inventory.add(taken.object, taken.amount);
                self.console(ci, "There is no room to drop that here.", Font::Info);
                ItemOutcome::Rejected(ItemRejection::NoRoom)
            }
        };
        let slot_packet = self.inventory_slot_packet(&handle.lock(), slot);
        self.send(ci, slot_packet);
        if let Some(packet) = appearance {
            self.broadcast_area(&position, &packet, None);
        }
        Ok(outcome)
    }

    /// Clear the equipment position holding `slot`. Returns the appearance
    /// change to broadcast, if any.
    fn unequip_locked(&self, c: &mut Character, slot: usize, object: u16) -> Option<ServerPacket> {
        let def = self.definitions().object(object)?;
        let position = equip_slot(&def.kind)?;
        if *held_mut(c, position) != Some(slot) {
            return None;
        }
        *held_mut(c, position) = None;
        if let Some(entry) = c.inventory.get_mut(slot) {
            entry.equipped = false;
        }
        apply_appearance(c, position, None);
        Some(self.character_change_packet(c))
    }

    /// Equip the object in `slot`, or take it off if it is already worn
    pub fn equip_item(&self, ci: CharIndex, slot: usize) -> Result<ItemOutcome, WorldError> {
        let handle = self.live_handle(ci)?;
        let result = {
            let mut c = handle.lock();
            self.equip_locked(&mut c, slot)
        };
        let (outcome, changed_slots, packet) = match result {
            Ok(done) => done,
            Err(reason) => return Ok(self.reject_item(ci, reason)),
        };
        let (position, slot_packets) = {
            let c = handle.lock();
            let packets: Vec<_> = changed_slots
                .iter()
                .map(|s| self.inventory_slot_packet(&c, *s))
                .collect();
            (c.position, packets)
        };
        for p in slot_packets {
            self.send(ci, p);
        }
        self.broadcast_area(&position, &packet, None);
        Ok(outcome)
    }

    #[allow(clippy::type_complexity)]
    fn equip_locked(
        &self,
        c: &mut Character,
        slot: usize,
    ) -> Result<(ItemOutcome, Vec<usize>, ServerPacket), ItemRejection> {
        if c.is_dead() {
            return Err(ItemRejection::Dead);
        }
        let entry = *c.inventory.get(slot).ok_or(ItemRejection::EmptySlot)?;
        let def = self
            .definitions()
            .object(entry.object)
            .filter(|d| d.is_equippable())
            .ok_or(ItemRejection::NotEquippable)?;
        let position = equip_slot(&def.kind).ok_or(ItemRejection::NotEquippable)?;

        if entry.equipped {
            let packet = self
                .unequip_locked(c, slot, entry.object)
                .unwrap_or_else(|| self.character_change_packet(c));
            return Ok((ItemOutcome::Unequipped { slot }, vec![slot], packet));
        }

        let mut changed = vec![slot];
        if let Some(previous) = held_mut(c, position).replace(slot) {
            if let Some(old) = c.inventory.get_mut(previous) {
                old.equipped = false;
            }
            changed.push(previous);
        }
        if let Some(new) = c.inventory.get_mut(slot) {
            new.equipped = true;
        }
        apply_appearance(c, position, Some(def));
        Ok((
            ItemOutcome::Equipped { slot },
            changed,
            self.character_change_packet(c),
        ))
    }

    /// Consume or activate the object in `slot`
    pub fn use_item<R: Rng + ?Sized>(
        &self,
        ci: CharIndex,
        slot: usize,
        now: Instant,
        rng: &mut R,
    ) -> Result<ItemOutcome, WorldError> {
        let handle = self.live_handle(ci)?;
        let entry = {
            let c = handle.lock();
            if c.is_dead() {
                Err(ItemRejection::Dead)
            } else if !c.timers.can_use_item(&self.settings().intervals, now) {
                Err(ItemRejection::TooSoon)
            } else {
                c.inventory.get(slot).copied().ok_or(ItemRejection::EmptySlot)
            }
        };
        let entry = match entry {
            Ok(entry) => entry,
            Err(reason) => return Ok(self.reject_item(ci, reason)),
        };
        let Some(def) = self.definitions().object(entry.object) else {
            return Ok(self.reject_item(ci, ItemRejection::NotUsable));
        };

        if let ObjectKind::Boat { body } = def.kind {
            handle.lock().timers.update_use(now);
            return self.toggle_boat(ci, slot, body);
        }

        let packets = {
            let mut c = handle.lock();
            let consumed = match def.kind {
                ObjectKind::Potion { stat, min, max } => {
                    let amount = rng.gen_range(min..=max.max(min));
                    match stat {
                        PotionStat::Health => c.hp.restore(amount),
                        PotionStat::Mana => c.mana.restore(amount),
                        PotionStat::Stamina => c.stamina.restore(amount),
                    };
                    true
                }
                ObjectKind::Food { hunger } => {
                    c.hunger = c.hunger.saturating_add(hunger).min(limits::MAX_HUNGER);
                    true
                }
                ObjectKind::Drink { thirst } => {
                    c.thirst = c.thirst.saturating_add(thirst).min(limits::MAX_THIRST);
                    true
                }
                ObjectKind::Antidote => {
                    c.flags.poisoned = false;
                    true
                }
                _ => false,
            };
            if !consumed {
                None
            } else {
                c.timers.update_use(now);
                c.inventory.take(slot, 1);
                Some([
                    self.stats_packet(&c),
                    ServerPacket::UpdateHungerThirst {
                        hunger: c.hunger,
                        thirst: c.thirst,
                    },
                    self.inventory_slot_packet(&c, slot),
                ])
            }
        };
        let Some(packets) = packets else {
            return Ok(self.reject_item(ci, ItemRejection::NotUsable));
        };
        for packet in packets {
            self.send(ci, packet);
        }
        if matches!(def.kind, ObjectKind::Antidote) {
            self.console(ci, "You feel better.", Font::Info);
        }
        Ok(ItemOutcome::Used {
            object: entry.object,
        })
    }

    /// Embark onto the faced water tile, or land on the faced shore
    fn toggle_boat(&self, ci: CharIndex, slot: usize, boat_body: u16) -> Result<ItemOutcome, WorldError> {
        let handle = self.live_handle(ci)?;
        let (heading, was_sailing) = {
            let mut c = handle.lock();
            let was = c.flags.sailing;
            c.flags.sailing = !was;
            (c.heading, was)
        };
        let outcome = self.move_character(ci, heading);
        if !matches!(outcome, Ok(ref o) if o.is_moved()) {
            handle.lock().flags.sailing = was_sailing;
            outcome?;
            return Ok(self.reject_item(ci, ItemRejection::NoRoom));
        }

        {
            let mut c = handle.lock();
            if was_sailing {
                c.equipment.boat = None;
                c.appearance.body = c.base_body;
                c.appearance.head = c.base_head;
                let armor = c.equipped_object(c.equipment.armor);
                if let Some(def) = armor.and_then(|id| self.definitions().object(id)) {
                    apply_appearance(&mut c, EquipSlot::Armor, Some(def));
                }
            } else {
                c.equipment.boat = Some(slot);
                c.appearance.body = boat_body;
                c.appearance.head = 0;
            }
        }
        self.send(ci, ServerPacket::Sailing { sailing: !was_sailing });
        self.refresh_character(ci)?;
        Ok(ItemOutcome::Sailing {
            sailing: !was_sailing,
        })
    }

    /// Gather from the tile `at` with the equipped tool
    pub fn work_tile<R: Rng + ?Sized>(
        &self,
        ci: CharIndex,
        at: Position,
        now: Instant,
        rng: &mut R,
    ) -> Result<ItemOutcome, WorldError> {
        let handle = self.live_handle(ci)?;
        let checked = {
            let c = handle.lock();
            let tool = c
                .equipped_object(c.equipment.weapon)
                .and_then(|id| self.definitions().object(id))
                .and_then(|d| match d.kind {
                    ObjectKind::Tool { skill, product } => Some((skill, product)),
                    _ => None,
                });
            if c.is_dead() {
                Err(ItemRejection::Dead)
            } else if !c.timers.can_work(&self.settings().intervals, now) {
                Err(ItemRejection::TooSoon)
            } else if !c.position.same_region(&at) || c.position.distance(&at) > work::MAX_DISTANCE
            {
                Err(ItemRejection::TooFar)
            } else {
                tool.map(|t| (t, c.position)).ok_or(ItemRejection::NoTool)
            }
        };
        let ((skill, product), position) = match checked {
            Ok(found) => found,
            Err(reason) => return Ok(self.reject_item(ci, reason)),
        };

        let tile = match self.tile(&at) {
            Ok(tile) => tile,
            Err(_) => return Ok(self.reject_item(ci, ItemRejection::WrongResource)),
        };
        let matches_resource = match skill {
            WorkSkill::Fishing => tile.is_navigable_water(),
            WorkSkill::Mining | WorkSkill::Woodcutting => tile
                .object
                .and_then(|o| self.definitions().object(o.def_id))
                .is_some_and(|d| matches!(d.kind, ObjectKind::Resource { skill: s } if s == skill)),
        };
        if !matches_resource {
            return Ok(self.reject_item(ci, ItemRejection::WrongResource));
        }

        let (succeeded, leftover, packets) = {
            let mut c = handle.lock();
            c.timers.update_work(now);
            let level = match skill {
                WorkSkill::Fishing => &mut c.skills.fishing,
                WorkSkill::Mining => &mut c.skills.mining,
                WorkSkill::Woodcutting => &mut c.skills.woodcutting,
            };
            let chance = work_success_chance(*level);
            if rng.gen_range(1..=100u8) > chance {
                (false, 0, Vec::new())
            } else {
                if rng.gen_ratio(1, 5) {
                    train(level);
                }
                let leftover = c.inventory.add(product, 1);
                let packets: Vec<_> = c
                    .inventory
                    .iter()
                    .filter(|(_, s)| s.object == product)
                    .map(|(slot, _)| slot)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(|slot| self.inventory_slot_packet(&c, slot))
                    .collect();
                (true, leftover, packets)
            }
        };
        if !succeeded {
            self.console(ci, "You didn't get anything.", Font::Info);
            return Ok(ItemOutcome::Worked { product: None });
        }
        for packet in packets {
            self.send(ci, packet);
        }
        if leftover > 0 {
            let object = GroundObject {
                def_id: product,
                amount: leftover,
            };
            if let Err(e) = self.drop_object_near(position, object) {
                tracing::debug!("Work product {} lost: {}", product, e);
            }
        }
        if let Some(def) = self.definitions().object(product) {
            self.console(ci, format!("You got some {}.", def.name), Font::Info);
        }
        Ok(ItemOutcome::Worked {
            product: Some(product),
        })
    }

    /// Take a tameable NPC standing on `at` as a pet
    pub fn tame(&self, ci: CharIndex, at: Position) -> Result<ItemOutcome, WorldError> {
        let handle = self.live_handle(ci)?;
        let (position, pets, dead) = {
            let c = handle.lock();
            (c.position, c.pets.len(), c.is_dead())
        };
        if dead {
            return Ok(self.reject_item(ci, ItemRejection::Dead));
        }
        if !position.same_region(&at) || position.distance(&at) > work::MAX_TAME_DISTANCE {
            return Ok(self.reject_item(ci, ItemRejection::TooFar));
        }
        let TargetKind::Npc(ni) = self.target_at(&at) else {
            return Ok(self.reject_item(ci, ItemRejection::NothingHere));
        };
        if pets >= self.settings().max_pets {
            return Ok(self.reject_item(ci, ItemRejection::TooManyPets));
        }
        let npc = self.npcs.get(ni).ok_or(WorldError::UnknownNpc(ni))?;
        let name = {
            let mut npc = npc.lock();
            let def = self.definitions().npc(npc.def_id);
            let Some(def) = def.filter(|d| d.tameable && npc.owner.is_none() && !npc.is_dead())
            else {
                drop(npc);
                return Ok(self.reject_item(ci, ItemRejection::NotTameable));
            };
            npc.tame(ci);
            def.name.clone()
        };
        handle.lock().pets.push(ni);
        self.console(ci, format!("The {} is now your pet.", name), Font::Info);
        tracing::debug!("Character {} tamed NPC {}", ci, ni);
        Ok(ItemOutcome::Tamed { npc: ni })
    }

    /// Revive a dead character standing in a safe zone
    pub fn resurrect(&self, ci: CharIndex) -> Result<ItemOutcome, WorldError> {
        let handle = self.live_handle(ci)?;
        let (position, dead) = {
            let c = handle.lock();
            (c.position, c.is_dead())
        };
        if !dead {
            return Ok(self.reject_item(ci, ItemRejection::NotDead));
        }
        if !self.is_safe_zone(&position) {
            return Ok(self.reject_item(ci, ItemRejection::NotInSafeZone));
        }
        let stats = {
            let mut c = handle.lock();
            c.revive();
            self.stats_packet(&c)
        };
        self.send(ci, stats);
        self.refresh_character(ci)?;
        self.console(ci, "You have been resurrected.", Font::Info);
        Ok(ItemOutcome::Resurrected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::tile::Trigger;
    use crate::game::world::test_support::*;
    use crate::util::position::Heading;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    const DAGGER: u16 = 1;
    const ARMOR: u16 = 3;
    const POTION: u16 = 4;
    const BOAT: u16 = 5;
    const GOLD: u16 = 6;
    const TREE: u16 = 13;
    const AXE: u16 = 14;
    const WOOD: u16 = 15;

    fn p(x: u8, y: u8) -> Position {
        Position::new(2, x, y)
    }

    fn give(world: &World, ci: CharIndex, object: u16, amount: u16) {
        world
            .characters
            .get(ci)
            .unwrap()
            .lock()
            .inventory
            .add(object, amount);
    }

    #[test]
    fn test_work_success_chance_grows_and_caps() {
        assert_eq!(work_success_chance(0), 10);
        assert!(work_success_chance(50) > work_success_chance(10));
        assert_eq!(work_success_chance(100), 90);
    }

    #[test]
    fn test_pick_up_object_and_gold() {
        let (world, outbox) = world();
        let ci = spawn_character(&world, "Picker", p(30, 30));
        world
            .place_object(p(30, 30), GroundObject { def_id: POTION, amount: 3 })
            .unwrap();

        assert_eq!(
            world.pick_up(ci).unwrap(),
            ItemOutcome::PickedUp { object: POTION, amount: 3 }
        );
        assert!(world.object_at(&p(30, 30)).is_none());
        assert_eq!(
            world.characters.get(ci).unwrap().lock().inventory.get(0).unwrap().amount,
            3
        );
        assert!(outbox
            .drain()
            .iter()
            .any(|(_, pkt)| matches!(pkt, ServerPacket::ObjectRemove { .. })));

        world
            .place_object(p(30, 30), GroundObject { def_id: GOLD, amount: 50 })
            .unwrap();
        world.pick_up(ci).unwrap();
        assert_eq!(world.characters.get(ci).unwrap().lock().gold, 50);

        assert_eq!(
            world.pick_up(ci).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NothingHere)
        );
    }

    #[test]
    fn test_pick_up_unpickable_resource() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Picker", p(30, 30));
        world
            .place_object(p(30, 30), GroundObject { def_id: TREE, amount: 1 })
            .unwrap();
        assert_eq!(
            world.pick_up(ci).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NotPickable)
        );
        assert!(world.object_at(&p(30, 30)).is_some());
    }

    #[test]
    fn test_drop_item_and_stack() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Dropper", p(30, 30));
        give(&world, ci, POTION, 5);

        assert_eq!(
            world.drop_item(ci, 0, 2).unwrap(),
            ItemOutcome::Dropped { at: p(30, 30), amount: 2 }
        );
        world.drop_item(ci, 0, 2).unwrap();
        assert_eq!(
            world.object_at(&p(30, 30)),
            Some(GroundObject { def_id: POTION, amount: 4 })
        );
        assert_eq!(
            world.drop_item(ci, 5, 1).unwrap(),
            ItemOutcome::Rejected(ItemRejection::EmptySlot)
        );
    }

    #[test]
    fn test_equip_swaps_and_broadcasts() {
        let (world, outbox) = world();
        let ci = spawn_character(&world, "Knight", p(30, 30));
        let watcher = spawn_character(&world, "Watcher", p(31, 30));
        give(&world, ci, DAGGER, 1);
        give(&world, ci, AXE, 1);
        give(&world, ci, ARMOR, 1);
        outbox.drain();

        assert_eq!(world.equip_item(ci, 0).unwrap(), ItemOutcome::Equipped { slot: 0 });
        assert_eq!(world.equip_item(ci, 2).unwrap(), ItemOutcome::Equipped { slot: 2 });
        {
            let c = world.characters.get(ci).unwrap();
            let c = c.lock();
            assert_eq!(c.equipment.weapon, Some(0));
            assert_eq!(c.appearance.weapon, 3);
            assert_eq!(c.appearance.body, 40);
        }
        assert!(outbox
            .drain_for(watcher)
            .iter()
            .any(|pkt| matches!(pkt, ServerPacket::CharacterChange { index, weapon: 3, .. } if *index == ci)));

        // Swapping weapons releases the dagger
        assert_eq!(world.equip_item(ci, 1).unwrap(), ItemOutcome::Equipped { slot: 1 });
        {
            let c = world.characters.get(ci).unwrap();
            let c = c.lock();
            assert!(!c.inventory.get(0).unwrap().equipped);
            assert_eq!(c.appearance.weapon, 0);
        }

        assert_eq!(world.equip_item(ci, 2).unwrap(), ItemOutcome::Unequipped { slot: 2 });
        assert_eq!(world.characters.get(ci).unwrap().lock().appearance.body, 1);

        give(&world, ci, POTION, 1);
        assert_eq!(
            world.equip_item(ci, 3).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NotEquippable)
        );
    }

    #[test]
    fn test_dropping_equipped_item_clears_appearance() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Knight", p(30, 30));
        give(&world, ci, DAGGER, 1);
        world.equip_item(ci, 0).unwrap();
        world.drop_item(ci, 0, 1).unwrap();
        let c = world.characters.get(ci).unwrap();
        assert!(c.lock().equipment.weapon.is_none());
        assert_eq!(c.lock().appearance.weapon, 0);
    }

    #[test]
    fn test_use_potion_respects_interval() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Drinker", p(30, 30));
        give(&world, ci, POTION, 2);
        world.characters.get(ci).unwrap().lock().hp.current = 5;
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();

        assert_eq!(
            world.use_item(ci, 0, now, &mut rng).unwrap(),
            ItemOutcome::Used { object: POTION }
        );
        assert_eq!(world.characters.get(ci).unwrap().lock().hp.current, 15);
        assert_eq!(
            world.use_item(ci, 0, now + Duration::from_millis(50), &mut rng).unwrap(),
            ItemOutcome::Rejected(ItemRejection::TooSoon)
        );
        world
            .use_item(ci, 0, now + Duration::from_secs(1), &mut rng)
            .unwrap();
        assert!(world.characters.get(ci).unwrap().lock().inventory.get(0).is_none());
    }

    #[test]
    fn test_boat_embark_and_land() {
        let (world, outbox) = world_with(|_, field| {
            field.tile_mut(30, 29).water = true;
        });
        let ci = spawn_character(&world, "Sailor", p(30, 30));
        give(&world, ci, BOAT, 1);
        world.turn_character(ci, Heading::North).unwrap();
        outbox.drain();
        let mut rng = StdRng::seed_from_u64(2);
        let now = Instant::now();

        assert_eq!(
            world.use_item(ci, 0, now, &mut rng).unwrap(),
            ItemOutcome::Sailing { sailing: true }
        );
        {
            let c = world.characters.get(ci).unwrap();
            let c = c.lock();
            assert!(c.flags.sailing);
            assert_eq!(c.position, p(30, 29));
            assert_eq!(c.appearance.body, 84);
        }
        assert!(outbox
            .drain_for(ci)
            .contains(&ServerPacket::Sailing { sailing: true }));
        assert_eq!(
            world.drop_item(ci, 0, 1).unwrap(),
            ItemOutcome::Rejected(ItemRejection::InUse)
        );

        // North of the water is land again
        let later = now + Duration::from_secs(1);
        assert_eq!(
            world.use_item(ci, 0, later, &mut rng).unwrap(),
            ItemOutcome::Sailing { sailing: false }
        );
        let c = world.characters.get(ci).unwrap();
        assert!(!c.lock().flags.sailing);
        assert_eq!(c.lock().position, p(30, 28));
        assert_eq!(c.lock().appearance.body, 1);
    }

    #[test]
    fn test_boat_needs_water_ahead() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Sailor", p(30, 30));
        give(&world, ci, BOAT, 1);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            world.use_item(ci, 0, Instant::now(), &mut rng).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NoRoom)
        );
        assert!(!world.characters.get(ci).unwrap().lock().flags.sailing);
        assert_eq!(world.character_position(ci), Some(p(30, 30)));
    }

    #[test]
    fn test_work_needs_tool_and_resource() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Logger", p(30, 30));
        world
            .place_object(p(31, 30), GroundObject { def_id: TREE, amount: 1 })
            .unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let mut now = Instant::now();

        assert_eq!(
            world.work_tile(ci, p(31, 30), now, &mut rng).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NoTool)
        );
        give(&world, ci, AXE, 1);
        world.equip_item(ci, 0).unwrap();
        assert_eq!(
            world.work_tile(ci, p(29, 30), now, &mut rng).unwrap(),
            ItemOutcome::Rejected(ItemRejection::WrongResource)
        );
        assert_eq!(
            world.work_tile(ci, p(33, 30), now, &mut rng).unwrap(),
            ItemOutcome::Rejected(ItemRejection::TooFar)
        );

        world.characters.get(ci).unwrap().lock().skills.woodcutting = 100;
        let mut gathered = 0;
        for _ in 0..30 {
            now += Duration::from_secs(1);
            if let ItemOutcome::Worked { product: Some(WOOD) } =
                world.work_tile(ci, p(31, 30), now, &mut rng).unwrap()
            {
                gathered += 1;
            }
        }
        assert!(gathered > 0);
        let c = world.characters.get(ci).unwrap();
        let wood: u16 = c
            .lock()
            .inventory
            .iter()
            .filter(|(_, s)| s.object == WOOD)
            .map(|(_, s)| s.amount)
            .sum();
        assert_eq!(wood, gathered);
    }

    #[test]
    fn test_tame_and_pet_limit() {
        let (world, _) = world();
        let ci = spawn_character(&world, "Tamer", p(30, 30));
        let rat = world.spawn_npc(1, p(31, 30)).unwrap();
        world.spawn_npc(3, p(30, 31)).unwrap();

        assert_eq!(
            world.tame(ci, p(30, 31)).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NotTameable)
        );
        assert_eq!(world.tame(ci, p(31, 30)).unwrap(), ItemOutcome::Tamed { npc: rat });
        assert_eq!(world.npcs.get(rat).unwrap().lock().owner, Some(ci));
        assert_eq!(world.characters.get(ci).unwrap().lock().pets.as_slice(), &[rat]);
        assert_eq!(
            world.tame(ci, p(31, 30)).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NotTameable)
        );
    }

    #[test]
    fn test_resurrect_only_in_safe_zone() {
        let (world, _) = world_with(|_, field| {
            field.tile_mut(40, 40).trigger = Trigger::SafeZone;
        });
        let ci = spawn_character(&world, "Ghost", p(30, 30));
        assert_eq!(
            world.resurrect(ci).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NotDead)
        );
        world.kill_character(ci, None).unwrap();
        assert_eq!(
            world.resurrect(ci).unwrap(),
            ItemOutcome::Rejected(ItemRejection::NotInSafeZone)
        );
        world.teleport_character(ci, p(40, 40)).unwrap();
        assert_eq!(world.resurrect(ci).unwrap(), ItemOutcome::Resurrected);
        let c = world.characters.get(ci).unwrap();
        assert!(!c.lock().is_dead());
        assert_eq!(c.lock().appearance.body, 1);
    }
}
