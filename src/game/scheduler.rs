//! Periodic task scheduler
//!
//! Independent of the network layer: every task is driven by an explicit
//! `now`, so tests can step time by hand. The async driver in
//! [`start_scheduler`] only supplies wall-clock instants.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::game::world::World;
use crate::metrics::Metrics;

/// Work that runs on a fixed period
pub trait PeriodicTask: Send {
    fn name(&self) -> &'static str;
    fn period(&self) -> Duration;
    fn run(&mut self, world: &World, now: Instant);
}

struct Slot {
    task: Box<dyn PeriodicTask>,
    /// `None` until the first `advance` call anchors the schedule
    next_due: Option<Instant>,
}

pub struct Scheduler {
    slots: Vec<Slot>,
    /// Longest acceptable `advance` duration before an overrun is logged
    budget: Duration,
    overruns: u64,
}

impl Scheduler {
    pub fn new(budget: Duration) -> Self {
        Self {
            slots: Vec::new(),
            budget,
            overruns: 0,
        }
    }

    pub fn register(&mut self, task: impl PeriodicTask + 'static) {
        debug!("Registered periodic task {} every {:?}", task.name(), task.period());
        self.slots.push(Slot {
            task: Box::new(task),
            next_due: None,
        });
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.task.name()).collect()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Run every task whose period has elapsed at `now`
    ///
    /// A task runs at most once per call; one that fell more than a period
    /// behind is rescheduled from `now` instead of bursting. Returns the
    /// number of tasks run.
    pub fn advance(&mut self, world: &World, now: Instant) -> usize {
        let started = Instant::now();
        let mut ran = 0;
        for slot in &mut self.slots {
            let period = slot.task.period();
            let due = *slot.next_due.get_or_insert(now + period);
            if now < due {
                continue;
            }
            slot.task.run(world, now);
            ran += 1;

            let mut next = due + period;
            if next <= now {
                debug!("Task {} fell behind; rescheduling", slot.task.name());
                next = now + period;
            }
            slot.next_due = Some(next);
        }
        let took = started.elapsed();
        if took > self.budget {
            self.overruns += 1;
            warn!("Tick overrun: {} tasks took {:?} (budget {:?})", ran, took, self.budget);
        }
        ran
    }
}

/// Drive `scheduler` from a tokio interval until the task is aborted
pub fn start_scheduler(
    world: Arc<World>,
    scheduler: Arc<Mutex<Scheduler>>,
    tick: Duration,
    metrics: Arc<Metrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            "Scheduler started at {:?} with tasks {:?}",
            tick,
            scheduler.lock().task_names()
        );
        let summary_every = (Duration::from_secs(30).as_millis() / tick.as_millis().max(1)).max(1) as u64;
        let mut tick_count: u64 = 0;

        loop {
            ticker.tick().await;
            tick_count += 1;

            // Tasks may block on disk or fan out to rayon; keep them off the async workers
            let step = {
                let world = world.clone();
                let scheduler = scheduler.clone();
                tokio::task::spawn_blocking(move || {
                    let started = Instant::now();
                    scheduler.lock().advance(&world, started);
                    started.elapsed()
                })
            };
            match step.await {
                Ok(took) => metrics.record_tick_time(took),
                Err(e) => {
                    error!("Scheduler step panicked: {}", e);
                    continue;
                }
            }

            metrics
                .characters_online
                .store(world.characters.len() as u64, Ordering::Relaxed);
            metrics
                .npcs_alive
                .store(world.npcs.len() as u64, Ordering::Relaxed);

            if tick_count % summary_every == 0 {
                let summary = world.summary();
                info!(
                    "World: {} regions, {} characters, {} NPCs, {} respawns pending | tick p95 {}us",
                    summary.regions.len(),
                    summary.characters,
                    summary.npcs,
                    summary.pending_respawns,
                    metrics.tick_time_p95_us.load(Ordering::Relaxed)
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::test_support::world;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        period: Duration,
        runs: Arc<AtomicUsize>,
    }

    impl PeriodicTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn period(&self) -> Duration {
            self.period
        }

        fn run(&mut self, _world: &World, _now: Instant) {
            self.runs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counter(ms: u64) -> (Counter, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Counter {
                period: Duration::from_millis(ms),
                runs: runs.clone(),
            },
            runs,
        )
    }

    #[test]
    fn test_first_advance_only_anchors() {
        let (world, _) = world();
        let (task, runs) = counter(100);
        let mut scheduler = Scheduler::new(Duration::from_secs(1));
        scheduler.register(task);

        let start = Instant::now();
        assert_eq!(scheduler.advance(&world, start), 0);
        assert_eq!(scheduler.advance(&world, start + Duration::from_millis(99)), 0);
        assert_eq!(scheduler.advance(&world, start + Duration::from_millis(100)), 1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tasks_keep_their_own_period() {
        let (world, _) = world();
        let (fast, fast_runs) = counter(100);
        let (slow, slow_runs) = counter(300);
        let mut scheduler = Scheduler::new(Duration::from_secs(1));
        scheduler.register(fast);
        scheduler.register(slow);

        let start = Instant::now();
        for step in 0..=9 {
            scheduler.advance(&world, start + Duration::from_millis(step * 100));
        }
        assert_eq!(fast_runs.load(Ordering::Relaxed), 9);
        assert_eq!(slow_runs.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_late_task_runs_once_then_reschedules() {
        let (world, _) = world();
        let (task, runs) = counter(100);
        let mut scheduler = Scheduler::new(Duration::from_secs(1));
        scheduler.register(task);

        let start = Instant::now();
        scheduler.advance(&world, start);
        scheduler.advance(&world, start + Duration::from_millis(1000));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        scheduler.advance(&world, start + Duration::from_millis(1050));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        scheduler.advance(&world, start + Duration::from_millis(1100));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }
}
