//! Periodic persistence of every online character

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::game::persistence::CharacterStore;
use crate::game::scheduler::PeriodicTask;
use crate::game::world::World;

pub struct AutosaveTask {
    period: Duration,
    store: Arc<dyn CharacterStore>,
}

impl AutosaveTask {
    pub fn new(period: Duration, store: Arc<dyn CharacterStore>) -> Self {
        Self { period, store }
    }

    /// Save a copy of each character. Returns (saved, failed).
    pub fn run_once(&mut self, world: &World) -> (usize, usize) {
        let mut saved = 0;
        let mut failed = 0;
        for (ci, handle) in world.characters.entries() {
            let record = handle.lock().clone();
            match self.store.save(&record) {
                Ok(()) => saved += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Autosave of character {} ({}) failed: {}", ci, record.name, e);
                }
            }
        }
        if saved + failed > 0 {
            tracing::info!("Autosaved {} characters ({} failed)", saved, failed);
        }
        (saved, failed)
    }
}

impl PeriodicTask for AutosaveTask {
    fn name(&self) -> &'static str {
        "autosave"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run(&mut self, world: &World, _now: Instant) {
        self.run_once(world);
    }
}
