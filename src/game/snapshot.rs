//! Region loading and the binary region cache
//!
//! Region sources are sparse JSON files: open ground everywhere except the
//! listed features. Parsed regions can be cached as one bincode snapshot
//! behind a magic/version header; a stale or unreadable cache is ignored and
//! rebuilt from the sources.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::game::constants::grid;
use crate::game::definitions::DefinitionStore;
use crate::game::region::RegionData;
use crate::game::tile::{GroundObject, Trigger};
use crate::util::position::{Position, RegionId};

const SNAPSHOT_MAGIC: &[u8; 4] = b"RLMS";
const SNAPSHOT_VERSION: u16 = 1;
const HEADER_LEN: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed region source {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Region {region}: feature at ({x}, {y}) lies outside the grid")]
    OutOfGrid { region: RegionId, x: u8, y: u8 },
    #[error("Not a region snapshot")]
    BadMagic,
    #[error("Snapshot version {found} is not supported (expected {SNAPSHOT_VERSION})")]
    Version { found: u16 },
    #[error("Snapshot encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Snapshot decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

// ============================================================================
// Sparse JSON sources
// ============================================================================

/// A rectangle of tiles sharing the same static properties
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Feature {
    pub x: u8,
    pub y: u8,
    #[serde(default = "one")]
    pub w: u8,
    #[serde(default = "one")]
    pub h: u8,
    #[serde(default)]
    pub blocked: Option<bool>,
    #[serde(default)]
    pub water: Option<bool>,
    #[serde(default)]
    pub lava: Option<bool>,
    #[serde(default)]
    pub bridge: Option<bool>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub exit: Option<Position>,
    #[serde(default)]
    pub npc: Option<u16>,
    #[serde(default)]
    pub object: Option<GroundObject>,
}

fn one() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegionSource {
    pub id: RegionId,
    pub name: String,
    #[serde(default)]
    pub pk_allowed: bool,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl RegionSource {
    pub fn into_data(self) -> Result<RegionData, SnapshotError> {
        let mut data = RegionData::open(self.id, self.name, self.pk_allowed);
        for f in &self.features {
            let x_end = usize::from(f.x) + usize::from(f.w);
            let y_end = usize::from(f.y) + usize::from(f.h);
            if x_end > grid::WIDTH || y_end > grid::HEIGHT {
                return Err(SnapshotError::OutOfGrid {
                    region: self.id,
                    x: f.x,
                    y: f.y,
                });
            }
            for y in f.y..f.y + f.h {
                for x in f.x..f.x + f.w {
                    let tile = data.tile_mut(x, y);
                    if let Some(v) = f.blocked {
                        tile.blocked = v;
                    }
                    if let Some(v) = f.water {
                        tile.water = v;
                    }
                    if let Some(v) = f.lava {
                        tile.lava = v;
                    }
                    if let Some(v) = f.bridge {
                        tile.bridge = v;
                    }
                    if let Some(v) = f.trigger {
                        tile.trigger = v;
                    }
                    if f.exit.is_some() {
                        tile.exit = f.exit;
                    }
                    if f.npc.is_some() {
                        tile.npc_spawn = f.npc;
                    }
                    if f.object.is_some() {
                        tile.object = f.object;
                    }
                }
            }
        }
        Ok(data)
    }
}

pub fn load_region_file(path: &Path) -> Result<RegionData, SnapshotError> {
    let text = fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let source: RegionSource = serde_json::from_str(&text).map_err(|source| SnapshotError::Source {
        path: path.to_path_buf(),
        source,
    })?;
    source.into_data()
}

/// `*.json` files of a directory, sorted by name
fn region_files(dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
    let io = |source| SnapshotError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse every region source in `dir`
pub fn load_region_dir(dir: &Path) -> Result<Vec<RegionData>, SnapshotError> {
    region_files(dir)?
        .iter()
        .map(|path| load_region_file(path))
        .collect()
}

// ============================================================================
// Binary cache
// ============================================================================

pub fn encode_snapshot(regions: &[RegionData]) -> Result<Vec<u8>, SnapshotError> {
    let body = bincode::serde::encode_to_vec(regions, bincode::config::legacy())?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<RegionData>, SnapshotError> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version { found: version });
    }
    let (regions, _): (Vec<RegionData>, usize) =
        bincode::serde::decode_from_slice(&bytes[HEADER_LEN..], bincode::config::legacy())?;
    Ok(regions)
}

pub fn save_snapshot(path: &Path, regions: &[RegionData]) -> Result<(), SnapshotError> {
    let bytes = encode_snapshot(regions)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| SnapshotError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_snapshot(path: &Path) -> Result<Vec<RegionData>, SnapshotError> {
    let bytes = fs::read(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode_snapshot(&bytes)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Whether the cache is at least as new as every source file
fn cache_is_fresh(cache: &Path, sources: &[PathBuf]) -> bool {
    let Some(cached_at) = modified(cache) else {
        return false;
    };
    sources
        .iter()
        .all(|src| modified(src).is_some_and(|t| t <= cached_at))
}

/// Load regions from the cache when it is fresh, else from the sources
///
/// With `cache` set, a rebuilt region set is written back. Cache failures
/// only cost a reparse.
pub fn load_regions(dir: &Path, cache: Option<&Path>) -> Result<Vec<RegionData>, SnapshotError> {
    let sources = region_files(dir)?;
    if let Some(cache) = cache.filter(|c| cache_is_fresh(c, &sources)) {
        match load_snapshot(cache) {
            Ok(regions) => {
                tracing::info!("Loaded {} regions from cache {}", regions.len(), cache.display());
                return Ok(regions);
            }
            Err(e) => tracing::warn!("Ignoring region cache {}: {}", cache.display(), e),
        }
    }

    let regions = sources
        .iter()
        .map(|path| load_region_file(path))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::info!("Parsed {} regions from {}", regions.len(), dir.display());
    if let Some(cache) = cache {
        if let Err(e) = save_snapshot(cache, &regions) {
            tracing::warn!("Could not write region cache {}: {}", cache.display(), e);
        }
    }
    Ok(regions)
}

/// Drop tile references to definitions that no longer exist
///
/// Snapshots keep raw ids; they are checked against the definitions loaded
/// now. Returns the number of references removed.
pub fn resolve_definitions(data: &mut RegionData, defs: &dyn DefinitionStore) -> usize {
    let mut dropped = 0;
    for tile in &mut data.tiles {
        if let Some(id) = tile.npc_spawn.filter(|id| defs.npc(*id).is_none()) {
            tracing::warn!("Region {}: dropping spawn of unknown NPC {}", data.id, id);
            tile.npc_spawn = None;
            dropped += 1;
        }
        if let Some(object) = tile.object.filter(|o| defs.object(o.def_id).is_none()) {
            tracing::warn!("Region {}: dropping unknown object {}", data.id, object.def_id);
            tile.object = None;
            dropped += 1;
        }
    }
    dropped
}
