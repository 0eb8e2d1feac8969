//! Entity index allocation
//!
//! Hands out small integer identifiers used as the wire addressing key for
//! live characters and NPCs. Each entity kind owns its own allocator, so
//! "character 7" and "NPC 7" are independent.

use hashbrown::HashSet;
use parking_lot::Mutex;

/// Wire-level entity identifier
pub type EntityIndex = u16;
/// Index of a live character
pub type CharIndex = EntityIndex;
/// Index of a live NPC
pub type NpcIndex = EntityIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("Entity index space exhausted")]
    Exhausted,
}

#[derive(Debug, Default)]
struct AllocatorState {
    /// Highest index handed out so far (0 is never issued)
    last: EntityIndex,
    /// Recycled indices, most recently freed on top
    free: Vec<EntityIndex>,
    /// Mirror of `free` for O(1) double-free detection
    free_set: HashSet<EntityIndex>,
}

/// Counter plus free-list allocator, safe under concurrent assign/free
#[derive(Debug, Default)]
pub struct IndexAllocator {
    state: Mutex<AllocatorState>,
}

impl IndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop a recycled index, or advance the counter
    pub fn assign(&self) -> Result<EntityIndex, IndexError> {
        let mut state = self.state.lock();
        if let Some(index) = state.free.pop() {
            state.free_set.remove(&index);
            return Ok(index);
        }
        if state.last == EntityIndex::MAX {
            return Err(IndexError::Exhausted);
        }
        state.last += 1;
        Ok(state.last)
    }

    /// Return an index to the pool
    ///
    /// Callers must have fully unlinked the entity from the world first.
    /// Freeing an index twice, or one that was never issued, is ignored.
    pub fn free(&self, index: EntityIndex) {
        let mut state = self.state.lock();
        if index == 0 || index > state.last {
            tracing::warn!("Ignoring free of never-issued index {}", index);
            return;
        }
        if !state.free_set.insert(index) {
            tracing::warn!("Ignoring double free of index {}", index);
            return;
        }
        state.free.push(index);
    }

    /// Number of indices currently issued and not freed
    pub fn live_count(&self) -> usize {
        let state = self.state.lock();
        usize::from(state.last) - state.free.len()
    }
}
