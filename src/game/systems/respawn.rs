//! Deferred NPC respawns

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::game::scheduler::PeriodicTask;
use crate::game::world::World;

pub struct RespawnTask {
    period: Duration,
    rng: StdRng,
}

impl RespawnTask {
    pub fn new(period: Duration, seed: u64) -> Self {
        Self {
            period,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Spawn every due request. Returns how many NPCs came back.
    pub fn run_once(&mut self, world: &World, now: Instant) -> usize {
        let mut spawned = 0;
        for request in world.respawns().drain_due(now) {
            match world.spawn_npc_in_region(request.def_id, request.region, &mut self.rng) {
                Ok(ni) => {
                    tracing::debug!("Respawned NPC def {} as {}", request.def_id, ni);
                    spawned += 1;
                }
                Err(e) => tracing::warn!(
                    "Respawn of NPC def {} in region {} failed: {}",
                    request.def_id,
                    request.region,
                    e
                ),
            }
        }
        spawned
    }
}

impl PeriodicTask for RespawnTask {
    fn name(&self) -> &'static str {
        "npc_respawn"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run(&mut self, world: &World, now: Instant) {
        self.run_once(world, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::respawn_queue::RespawnRequest;
    use crate::game::world::test_support::*;

    #[test]
    fn test_due_requests_respawn() {
        let (world, _) = world();
        let now = Instant::now();
        world
            .respawns()
            .push(RespawnRequest { def_id: 1, region: 2, due: now })
            .unwrap();
        world
            .respawns()
            .push(RespawnRequest {
                def_id: 1,
                region: 2,
                due: now + Duration::from_secs(30),
            })
            .unwrap();

        let mut task = RespawnTask::new(Duration::from_secs(1), 3);
        assert_eq!(task.run_once(&world, now), 1);
        assert_eq!(world.npcs.len(), 1);
        assert_eq!(world.respawns().pending_count(), 1);

        assert_eq!(task.run_once(&world, now + Duration::from_secs(30)), 1);
        assert_eq!(world.npcs.len(), 2);
        assert_eq!(world.respawns().pending_count(), 0);
    }

    #[test]
    fn test_unknown_definition_is_dropped() {
        let (world, _) = world();
        let now = Instant::now();
        world
            .respawns()
            .push(RespawnRequest { def_id: 999, region: 2, due: now })
            .unwrap();

        let mut task = RespawnTask::new(Duration::from_secs(1), 3);
        assert_eq!(task.run_once(&world, now), 0);
        assert_eq!(world.respawns().pending_count(), 0);
    }
}
