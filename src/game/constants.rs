/// Region grid geometry
pub mod grid {
    /// Tiles per row
    pub const WIDTH: usize = 100;
    /// Tiles per column
    pub const HEIGHT: usize = 100;
    /// Total tiles in a region
    pub const TILE_COUNT: usize = WIDTH * HEIGHT;
    /// Playable sub-rectangle (0-based, inclusive). A 17x13 client viewport
    /// must fit around every legal position.
    pub const MIN_X: u8 = 8;
    pub const MAX_X: u8 = 91;
    pub const MIN_Y: u8 = 6;
    pub const MAX_Y: u8 = 93;
}

/// Area-of-interest constants
pub mod aoi {
    /// Side length of a visibility bucket in tiles
    pub const BUCKET_SIZE: u8 = 9;
    /// Buckets per axis (100 / 9, rounded up)
    pub const BUCKETS_PER_AXIS: u8 = 12;
    /// Maximum Manhattan distance for ranged attacks and spells
    pub const MAX_TARGET_DISTANCE: u16 = 12;
}

/// Combat constants
pub mod combat {
    /// Minimum stamina required to swing a weapon
    pub const MIN_STAMINA: u16 = 10;
    /// Stamina cost range per attack (inclusive)
    pub const STAMINA_COST_MIN: u16 = 1;
    pub const STAMINA_COST_MAX: u16 = 10;
    /// Hit chance bounds in percent
    pub const MIN_HIT_CHANCE: i32 = 10;
    pub const MAX_HIT_CHANCE: i32 = 90;
    /// Base hit chance in percent before the power/evasion term
    pub const BASE_HIT_CHANCE: f32 = 50.0;
    /// Weight of (power - evasion) in the hit chance
    pub const HIT_CHANCE_SLOPE: f32 = 0.4;
    /// Level above which the level bonus starts accruing
    pub const LEVEL_BONUS_THRESHOLD: u8 = 12;
    /// Power/evasion bonus per level above the threshold
    pub const LEVEL_BONUS_PER_LEVEL: f32 = 2.5;
    /// Strength above which weapons deal bonus damage
    pub const STRENGTH_BONUS_THRESHOLD: u8 = 15;
    /// Unarmed base roll range (inclusive)
    pub const UNARMED_MIN_HIT: u16 = 1;
    pub const UNARMED_MAX_HIT: u16 = 3;
    /// Ghost appearance used for dead characters
    pub const DEAD_BODY: u16 = 8;
    pub const DEAD_HEAD: u16 = 500;
    /// Sound and effect ids broadcast during combat
    pub const SOUND_SWING: u16 = 2;
    pub const SOUND_HIT: u16 = 10;
    pub const SOUND_DEATH: u16 = 11;
    pub const FX_BLOOD: u16 = 14;
}

/// NPC behavior constants
pub mod ai {
    /// Radius (Manhattan) in which hostile NPCs look for targets to pursue
    pub const PURSUE_RADIUS: u16 = 8;
    /// Pets wait this close to their owner
    pub const FOLLOW_DISTANCE: u16 = 1;
    /// Maximum NPC intents produced per tick for one NPC
    pub const MAX_INTENTS_PER_NPC: usize = 2;
}

/// Spawning constants
pub mod spawn {
    /// Random tile samples before giving up on a spawn
    pub const MAX_SPAWN_ATTEMPTS: u32 = 200;
    /// Search radius for the nearest free tile around a target position
    pub const MAX_NEAREST_FREE_RADIUS: u8 = 10;
    /// Capacity of the deferred respawn queue
    pub const RESPAWN_QUEUE_CAPACITY: usize = 4096;
}

/// Character constants
pub mod character {
    /// Inventory slots per character
    pub const INVENTORY_SLOTS: usize = 20;
    /// Maximum stack size for one inventory slot or ground object
    pub const MAX_STACK: u16 = 10_000;
    /// Maximum known spells
    pub const MAX_SPELLS: usize = 35;
    /// Maximum character name length
    pub const MAX_NAME_LEN: usize = 30;
    /// Maximum hunger/thirst
    pub const MAX_HUNGER: u8 = 100;
    pub const MAX_THIRST: u8 = 100;
    /// Maximum skill value
    pub const MAX_SKILL: u8 = 100;
    /// Maximum overhead chat length
    pub const MAX_CHAT_LEN: usize = 255;
}

/// Regeneration constants (counted in regeneration ticks)
pub mod regen {
    /// Ticks between hunger decrements
    pub const HUNGER_TICKS: u32 = 180;
    /// Ticks between thirst decrements
    pub const THIRST_TICKS: u32 = 120;
    /// Ticks between stamina regeneration steps
    pub const STAMINA_TICKS: u32 = 3;
    /// Ticks between HP regeneration steps
    pub const HP_TICKS: u32 = 10;
    /// Ticks between mana regeneration steps
    pub const MANA_TICKS: u32 = 6;
    /// Ticks between poison damage steps
    pub const POISON_TICKS: u32 = 5;
    /// Poison damage range per step (inclusive)
    pub const POISON_DAMAGE_MIN: u16 = 1;
    pub const POISON_DAMAGE_MAX: u16 = 5;
    /// Hunger and thirst lost per decrement
    pub const NEED_DECAY: u8 = 10;
    /// Pools regenerate max / divisor per step (at least 1)
    pub const STAMINA_DIVISOR: u16 = 20;
    pub const HP_DIVISOR: u16 = 25;
    pub const MANA_DIVISOR: u16 = 20;
}

/// Gathering with tools
pub mod work {
    /// Success chance in percent at skill 0
    pub const BASE_SUCCESS: u8 = 10;
    /// Success chance cap in percent
    pub const MAX_SUCCESS: u8 = 90;
    /// Largest distance to the worked tile
    pub const MAX_DISTANCE: u16 = 1;
    /// Largest distance to an NPC being tamed
    pub const MAX_TAME_DISTANCE: u16 = 2;
}

/// Networking constants
pub mod net {
    /// Largest accepted buffered-but-incomplete input in bytes
    pub const MAX_PENDING_INPUT: usize = 16 * 1024;
    /// Socket read chunk size
    pub const READ_CHUNK_SIZE: usize = 4096;
    /// Maximum string length on the wire (bytes)
    pub const MAX_STRING_LEN: usize = 1024;
    /// Outbound packets queued per connection before it is dropped as too slow
    pub const OUTBOUND_QUEUE_CAPACITY: usize = 2048;
    /// Protocol version accepted at login
    pub const PROTOCOL_VERSION: u16 = 1;
    /// Overhead chat is cut to this many characters
    pub const MAX_CHAT_LEN: usize = 160;
    pub const CHAT_COLOR: u32 = 0x00FF_FFFF;
    pub const GM_CHAT_COLOR: u32 = 0x0000_FF00;
    /// How long a closing connection may take to flush queued packets
    pub const WRITER_DRAIN_TIMEOUT_MS: u64 = 2000;
}
