use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::game::character::LevelTable;
use crate::game::intervals::IntervalConfig;
use crate::game::world::WorldSettings;
use crate::net::dos_protection::AdmissionConfig;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the game and metrics listeners to
    pub bind_address: IpAddr,
    pub port: u16,
    pub metrics_port: u16,
    /// Maximum concurrent connections
    pub max_users: usize,
    pub max_connections_per_ip: usize,
    /// Packets per second a connection may send before it is throttled
    pub max_packets_per_second: u32,
    /// Holds `definitions.json`, `regions/` and `characters/`
    pub data_dir: PathBuf,
    /// Binary region snapshot; `None` disables the cache
    pub region_cache: Option<PathBuf>,

    /// Scheduler driver resolution
    pub scheduler_tick: Duration,
    pub ai_tick: Duration,
    pub regen_tick: Duration,
    pub autosave_period: Duration,
    pub respawn_delay: Duration,
    pub paralysis: Duration,
    /// Defaults for NPC definitions that don't set their own
    pub npc_move_interval: Duration,
    pub npc_attack_interval: Duration,
    pub intervals: IntervalConfig,

    pub max_level: u8,
    /// Experience for level 2; each further level needs `level_factor` times more
    pub level_base_exp: u32,
    pub level_factor: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 7666,
            metrics_port: 9090,
            max_users: 500,
            max_connections_per_ip: 4,
            max_packets_per_second: 60,
            data_dir: PathBuf::from("data"),
            region_cache: Some(PathBuf::from("data/regions.bin")),
            scheduler_tick: Duration::from_millis(100),
            ai_tick: Duration::from_millis(300),
            regen_tick: Duration::from_millis(500),
            autosave_period: Duration::from_secs(300),
            respawn_delay: Duration::from_secs(30),
            paralysis: Duration::from_secs(8),
            npc_move_interval: Duration::from_millis(600),
            npc_attack_interval: Duration::from_millis(1500),
            intervals: IntervalConfig::default(),
            max_level: 50,
            level_base_exp: 300,
            level_factor: 1.2,
        }
    }
}

/// Overwrite `target` with the parsed value of `key`, if set and valid
fn env_value<T: FromStr>(key: &str, target: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!("Invalid {} '{}', using default", key, raw),
    }
}

/// Same as [`env_value`] for durations given in milliseconds
fn env_millis(key: &str, target: &mut Duration) {
    let mut ms = target.as_millis() as u64;
    env_value(key, &mut ms);
    *target = Duration::from_millis(ms);
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        env_value("BIND_ADDRESS", &mut config.bind_address);
        env_value("PORT", &mut config.port);
        env_value("METRICS_PORT", &mut config.metrics_port);
        env_value("MAX_USERS", &mut config.max_users);
        env_value("MAX_CONNECTIONS_PER_IP", &mut config.max_connections_per_ip);
        env_value("MAX_PACKETS_PER_SECOND", &mut config.max_packets_per_second);
        env_value("DATA_DIR", &mut config.data_dir);

        // An empty value turns the cache off
        match std::env::var("REGION_CACHE") {
            Ok(path) if path.trim().is_empty() => config.region_cache = None,
            Ok(path) => config.region_cache = Some(PathBuf::from(path)),
            Err(_) => config.region_cache = Some(config.data_dir.join("regions.bin")),
        }

        env_millis("SCHEDULER_TICK_MS", &mut config.scheduler_tick);
        env_millis("AI_TICK_MS", &mut config.ai_tick);
        env_millis("REGEN_TICK_MS", &mut config.regen_tick);
        env_millis("AUTOSAVE_MS", &mut config.autosave_period);
        env_millis("NPC_RESPAWN_MS", &mut config.respawn_delay);
        env_millis("PARALYSIS_MS", &mut config.paralysis);
        env_millis("NPC_MOVE_INTERVAL_MS", &mut config.npc_move_interval);
        env_millis("NPC_ATTACK_INTERVAL_MS", &mut config.npc_attack_interval);
        env_millis("ATTACK_INTERVAL_MS", &mut config.intervals.attack);
        env_millis("CAST_INTERVAL_MS", &mut config.intervals.cast);
        env_millis("USE_ITEM_INTERVAL_MS", &mut config.intervals.use_item);
        env_millis("WORK_INTERVAL_MS", &mut config.intervals.work);
        env_millis("ATTACK_AFTER_CAST_MS", &mut config.intervals.attack_after_cast);
        env_millis("CAST_AFTER_ATTACK_MS", &mut config.intervals.cast_after_attack);

        env_value("MAX_LEVEL", &mut config.max_level);
        env_value("LEVEL_BASE_EXP", &mut config.level_base_exp);
        env_value("LEVEL_FACTOR", &mut config.level_factor);

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.port == self.metrics_port {
            return Err("PORT and METRICS_PORT must differ".to_string());
        }
        if self.max_users == 0 {
            return Err("max_users must be at least 1".to_string());
        }
        if self.max_connections_per_ip == 0 {
            return Err("max_connections_per_ip must be at least 1".to_string());
        }
        if self.scheduler_tick.is_zero() {
            return Err("scheduler_tick must be positive".to_string());
        }
        for (name, period) in [
            ("ai_tick", self.ai_tick),
            ("regen_tick", self.regen_tick),
            ("autosave_period", self.autosave_period),
        ] {
            if period < self.scheduler_tick {
                return Err(format!("{} cannot be shorter than scheduler_tick", name));
            }
        }
        if self.max_level < 2 {
            return Err("max_level must be at least 2".to_string());
        }
        if self.level_base_exp == 0 || self.level_factor < 1.0 {
            return Err("Level table must be non-decreasing".to_string());
        }
        Ok(())
    }

    pub fn game_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.metrics_port)
    }

    pub fn definitions_path(&self) -> PathBuf {
        self.data_dir.join("definitions.json")
    }

    pub fn regions_dir(&self) -> PathBuf {
        self.data_dir.join("regions")
    }

    pub fn characters_dir(&self) -> PathBuf {
        self.data_dir.join("characters")
    }

    pub fn world_settings(&self) -> WorldSettings {
        WorldSettings {
            intervals: self.intervals,
            levels: LevelTable::geometric(self.max_level, self.level_base_exp, self.level_factor),
            npc_move_interval: self.npc_move_interval,
            npc_attack_interval: self.npc_attack_interval,
            paralysis: self.paralysis,
            respawn_delay: self.respawn_delay,
            ..WorldSettings::default()
        }
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_users: self.max_users,
            max_connections_per_ip: self.max_connections_per_ip,
            max_packets_per_window: self.max_packets_per_second,
            rate_window: Duration::from_secs(1),
            ..AdmissionConfig::default()
        }
    }
}
