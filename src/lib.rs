//! Realm Server Library
//!
//! An authoritative server for a tile-based 2D multiplayer world over TCP.
//!
//! # Features
//!
//! - `dos_ratelimit` - Per-connection packet rate limiting (connection limits are always on)
//! - `region_cache` - Reload parsed regions from a bincode snapshot at startup

pub mod config;
pub mod util;
pub mod game;
pub mod net;
pub mod metrics;
