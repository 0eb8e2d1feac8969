//! Dense entity storage keyed by entity index
//!
//! Tiles and region indices only ever hold indices; the live entity data is
//! owned here. Removing an entity drops the slot, so a stale index resolves to
//! `None` instead of a dangling reference.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::game::index_allocator::EntityIndex;

/// Shared handle to a live entity
pub type Shared<T> = Arc<Mutex<T>>;

pub struct EntityTable<T> {
    slots: RwLock<Vec<Option<Shared<T>>>>,
}

impl<T> EntityTable<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Store an entity under `index`, replacing whatever was there
    pub fn insert(&self, index: EntityIndex, value: T) -> Shared<T> {
        let shared = Arc::new(Mutex::new(value));
        let mut slots = self.slots.write();
        let slot = usize::from(index);
        if slots.len() <= slot {
            slots.resize_with(slot + 1, || None);
        }
        if slots[slot].is_some() {
            tracing::warn!("Entity slot {} overwritten while still occupied", index);
        }
        slots[slot] = Some(shared.clone());
        shared
    }

    pub fn get(&self, index: EntityIndex) -> Option<Shared<T>> {
        self.slots
            .read()
            .get(usize::from(index))
            .and_then(|slot| slot.clone())
    }

    pub fn remove(&self, index: EntityIndex) -> Option<Shared<T>> {
        self.slots
            .write()
            .get_mut(usize::from(index))
            .and_then(|slot| slot.take())
    }

    pub fn contains(&self, index: EntityIndex) -> bool {
        self.slots
            .read()
            .get(usize::from(index))
            .is_some_and(|slot| slot.is_some())
    }

    /// Indices of all live entities, ascending
    pub fn indices(&self) -> Vec<EntityIndex> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| i as EntityIndex)
            .collect()
    }

    /// Snapshot of all live entities, ascending by index
    pub fn entries(&self) -> Vec<(EntityIndex, Shared<T>)> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (i as EntityIndex, s.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for EntityTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
