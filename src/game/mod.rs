pub mod character;
pub mod combat;
pub mod constants;
pub mod definitions;
pub mod entity_table;
pub mod index_allocator;
pub mod intervals;
pub mod items;
pub mod npc;
pub mod persistence;
pub mod region;
pub mod respawn_queue;
pub mod scheduler;
pub mod snapshot;
pub mod spells;
pub mod systems;
pub mod tile;
pub mod world;
