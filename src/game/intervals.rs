//! Action interval gating
//!
//! Per-entity cooldowns for attacking, casting, item use and work. Everything
//! here is a pure read or write of timestamps; callers pass `now` explicitly
//! and already hold whatever lock guards the entity.

use std::time::{Duration, Instant};

/// Minimum gaps between actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalConfig {
    pub attack: Duration,
    pub cast: Duration,
    pub use_item: Duration,
    pub work: Duration,
    /// Gap required after casting before the next attack
    pub attack_after_cast: Duration,
    /// Gap required after attacking before the next cast
    pub cast_after_attack: Duration,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            attack: Duration::from_millis(1500),
            cast: Duration::from_millis(1400),
            use_item: Duration::from_millis(200),
            work: Duration::from_millis(700),
            attack_after_cast: Duration::from_millis(1000),
            cast_after_attack: Duration::from_millis(1000),
        }
    }
}

/// Last time each kind of action happened (`None` = never)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionTimers {
    pub last_attack: Option<Instant>,
    pub last_cast: Option<Instant>,
    pub last_use: Option<Instant>,
    pub last_work: Option<Instant>,
}

#[inline]
fn elapsed_at_least(last: Option<Instant>, now: Instant, gap: Duration) -> bool {
    match last {
        Some(at) => now.saturating_duration_since(at) >= gap,
        None => true,
    }
}

impl ActionTimers {
    pub fn can_attack(&self, config: &IntervalConfig, now: Instant) -> bool {
        elapsed_at_least(self.last_attack, now, config.attack)
            && elapsed_at_least(self.last_cast, now, config.attack_after_cast)
    }

    pub fn can_cast_spell(&self, config: &IntervalConfig, now: Instant) -> bool {
        elapsed_at_least(self.last_cast, now, config.cast)
            && elapsed_at_least(self.last_attack, now, config.cast_after_attack)
    }

    pub fn can_use_item(&self, config: &IntervalConfig, now: Instant) -> bool {
        elapsed_at_least(self.last_use, now, config.use_item)
    }

    pub fn can_work(&self, config: &IntervalConfig, now: Instant) -> bool {
        elapsed_at_least(self.last_work, now, config.work)
    }

    pub fn update_attack(&mut self, now: Instant) {
        self.last_attack = Some(now);
    }

    pub fn update_cast(&mut self, now: Instant) {
        self.last_cast = Some(now);
    }

    pub fn update_use(&mut self, now: Instant) {
        self.last_use = Some(now);
    }

    pub fn update_work(&mut self, now: Instant) {
        self.last_work = Some(now);
    }
}
