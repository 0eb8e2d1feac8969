//! Character records
//!
//! The world never touches the disk itself; login, logout and autosave go
//! through a [`CharacterStore`]. Records are keyed by the case-folded name.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::game::character::{is_valid_name, Character};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Invalid character name {0:?}")]
    InvalidName(String),
    #[error("Character {0} already exists")]
    AlreadyExists(String),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt record {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub trait CharacterStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Option<Character>, PersistError>;
    fn save(&self, character: &Character) -> Result<(), PersistError>;
    fn exists(&self, name: &str) -> Result<bool, PersistError>;

    /// Save a brand new character, refusing to overwrite an existing one
    fn create(&self, character: &Character) -> Result<(), PersistError> {
        if self.exists(&character.name)? {
            return Err(PersistError::AlreadyExists(character.name.clone()));
        }
        self.save(character)
    }
}

/// Storage key for a name: lowercase, spaces as underscores
pub fn record_key(name: &str) -> Result<String, PersistError> {
    if !is_valid_name(name) {
        return Err(PersistError::InvalidName(name.to_string()));
    }
    Ok(name.to_lowercase().replace(' ', "_"))
}

/// One pretty-printed JSON file per character
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| PersistError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, PersistError> {
        Ok(self.dir.join(format!("{}.json", record_key(name)?)))
    }
}

impl CharacterStore for JsonFileStore {
    fn load(&self, name: &str) -> Result<Option<Character>, PersistError> {
        let path = self.path_for(name)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistError::Io { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| PersistError::Corrupt { path, source })
    }

    /// Write to a temporary file, then rename over the old record
    fn save(&self, character: &Character) -> Result<(), PersistError> {
        let path = self.path_for(&character.name)?;
        let json = serde_json::to_vec_pretty(character).map_err(|source| PersistError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        let io = |source| PersistError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(&json).map_err(io)?;
        file.sync_all().map_err(io)?;
        fs::rename(&tmp, &path).map_err(|source| PersistError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!("Saved character {} to {}", character.name, path.display());
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, PersistError> {
        Ok(self.path_for(name)?.exists())
    }
}

/// In-process store for tests and throwaway servers
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Character>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CharacterStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<Character>, PersistError> {
        let key = record_key(name)?;
        Ok(self.records.lock().get(&key).cloned())
    }

    fn save(&self, character: &Character) -> Result<(), PersistError> {
        let key = record_key(&character.name)?;
        self.records.lock().insert(key, character.clone());
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, PersistError> {
        let key = record_key(name)?;
        Ok(self.records.lock().contains_key(&key))
    }
}
