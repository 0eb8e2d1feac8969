pub mod ai;
pub mod autosave;
pub mod regen;
pub mod respawn;
