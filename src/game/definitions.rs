//! Static game definitions: objects, NPCs, spells and cities
//!
//! Loaded once at startup from JSON. The world only ever holds raw ids and
//! resolves them through [`DefinitionStore`] when it needs the data.

use std::path::Path;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::game::npc::NpcBehavior;
use crate::util::position::Position;

/// Skill a tool trains and a resource requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkSkill {
    Fishing,
    Mining,
    Woodcutting,
}

/// Which pool a potion restores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PotionStat {
    Health,
    Mana,
    Stamina,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectKind {
    Weapon {
        min_hit: u16,
        max_hit: u16,
        #[serde(default)]
        ranged: bool,
        #[serde(default)]
        unarmed: bool,
        anim: u16,
    },
    Armor {
        min_def: u16,
        max_def: u16,
        body: u16,
    },
    Shield {
        min_def: u16,
        max_def: u16,
        anim: u16,
    },
    Helmet {
        min_def: u16,
        max_def: u16,
        anim: u16,
    },
    Potion {
        stat: PotionStat,
        min: u16,
        max: u16,
    },
    Food {
        hunger: u8,
    },
    Drink {
        thirst: u8,
    },
    Antidote,
    Boat {
        body: u16,
    },
    Tool {
        skill: WorkSkill,
        product: u16,
    },
    /// Tree, ore vein or similar node a tool can harvest
    Resource {
        skill: WorkSkill,
    },
    Gold,
    Misc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDef {
    pub id: u16,
    pub name: String,
    /// Client graphic index
    pub graphic: u16,
    #[serde(flatten)]
    pub kind: ObjectKind,
    #[serde(default = "default_true")]
    pub pickable: bool,
    /// Never dropped on death
    #[serde(default)]
    pub newbie: bool,
}

impl ObjectDef {
    pub fn is_equippable(&self) -> bool {
        matches!(
            self.kind,
            ObjectKind::Weapon { .. }
                | ObjectKind::Armor { .. }
                | ObjectKind::Shield { .. }
                | ObjectKind::Helmet { .. }
                | ObjectKind::Tool { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LootEntry {
    pub object: u16,
    pub amount: u16,
    /// Drop probability in percent
    pub chance: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcDef {
    pub id: u16,
    pub name: String,
    pub body: u16,
    #[serde(default)]
    pub head: u16,
    pub behavior: NpcBehavior,
    pub max_hp: u16,
    #[serde(default)]
    pub min_hit: u16,
    #[serde(default)]
    pub max_hit: u16,
    /// Flat damage reduction
    #[serde(default)]
    pub defense: u16,
    #[serde(default)]
    pub attack_power: u16,
    #[serde(default)]
    pub evasion: u16,
    /// Total experience granted over the NPC's life
    #[serde(default)]
    pub experience: u32,
    #[serde(default)]
    pub gold: u32,
    #[serde(default)]
    pub loot: Vec<LootEntry>,
    #[serde(default)]
    pub spells: Vec<u16>,
    /// Chance in percent to cast instead of melee when a spell is available
    #[serde(default)]
    pub spell_chance: u8,
    /// Lives in water and never steps onto land
    #[serde(default)]
    pub aquatic: bool,
    #[serde(default)]
    pub respawn: bool,
    #[serde(default)]
    pub tameable: bool,
    /// Overrides the configured default when set
    #[serde(default)]
    pub move_interval_ms: Option<u64>,
    #[serde(default)]
    pub attack_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SpellEffect {
    Damage { min: u16, max: u16 },
    Heal { min: u16, max: u16 },
    Paralyze,
    Immobilize,
    RemoveParalysis,
    Poison,
    CurePoison,
}

impl SpellEffect {
    pub fn is_hostile(&self) -> bool {
        matches!(
            self,
            SpellEffect::Damage { .. }
                | SpellEffect::Paralyze
                | SpellEffect::Immobilize
                | SpellEffect::Poison
        )
    }
}

/// What a spell may be aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpellTargeting {
    Character,
    Npc,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellDef {
    pub id: u16,
    pub name: String,
    /// Spoken overhead by the caster
    #[serde(default)]
    pub words: String,
    pub mana_cost: u16,
    #[serde(flatten)]
    pub effect: SpellEffect,
    pub targeting: SpellTargeting,
    #[serde(default)]
    pub fx: u16,
    #[serde(default)]
    pub sound: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityDef {
    pub id: u16,
    pub name: String,
    pub position: Position,
}

fn default_true() -> bool {
    true
}

/// Definition lookups the world consumes
pub trait DefinitionStore: Send + Sync {
    fn object(&self, id: u16) -> Option<&ObjectDef>;
    fn npc(&self, id: u16) -> Option<&NpcDef>;
    fn spell(&self, id: u16) -> Option<&SpellDef>;
    fn city(&self, id: u16) -> Option<&CityDef>;
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed definitions: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate {kind} id {id}")]
    Duplicate { kind: &'static str, id: u16 },
}

/// On-disk layout of `definitions.json`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DefinitionFile {
    #[serde(default)]
    pub objects: Vec<ObjectDef>,
    #[serde(default)]
    pub npcs: Vec<NpcDef>,
    #[serde(default)]
    pub spells: Vec<SpellDef>,
    #[serde(default)]
    pub cities: Vec<CityDef>,
}

/// In-memory definition tables
#[derive(Debug, Default)]
pub struct Definitions {
    objects: HashMap<u16, ObjectDef>,
    npcs: HashMap<u16, NpcDef>,
    spells: HashMap<u16, SpellDef>,
    cities: HashMap<u16, CityDef>,
}

macro_rules! index_by_id {
    ($items:expr, $kind:literal) => {{
        let mut map = HashMap::with_capacity($items.len());
        for item in $items {
            let id = item.id;
            if map.insert(id, item).is_some() {
                return Err(DefinitionError::Duplicate { kind: $kind, id });
            }
        }
        map
    }};
}

impl Definitions {
    pub fn from_file_data(file: DefinitionFile) -> Result<Self, DefinitionError> {
        Ok(Self {
            objects: index_by_id!(file.objects, "object"),
            npcs: index_by_id!(file.npcs, "npc"),
            spells: index_by_id!(file.spells, "spell"),
            cities: index_by_id!(file.cities, "city"),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        Self::from_file_data(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Load definitions, falling back to an empty set on any failure
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(defs) => {
                tracing::info!(
                    "Loaded {} objects, {} NPCs, {} spells, {} cities from {}",
                    defs.objects.len(),
                    defs.npcs.len(),
                    defs.spells.len(),
                    defs.cities.len(),
                    path.display()
                );
                defs
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load definitions from {}: {}; continuing with none",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn cities(&self) -> impl Iterator<Item = &CityDef> {
        self.cities.values()
    }
}

impl DefinitionStore for Definitions {
    fn object(&self, id: u16) -> Option<&ObjectDef> {
        self.objects.get(&id)
    }

    fn npc(&self, id: u16) -> Option<&NpcDef> {
        self.npcs.get(&id)
    }

    fn spell(&self, id: u16) -> Option<&SpellDef> {
        self.spells.get(&id)
    }

    fn city(&self, id: u16) -> Option<&CityDef> {
        self.cities.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "objects": [
            {"id": 1, "name": "Dagger", "graphic": 10, "kind": "weapon", "min_hit": 1, "max_hit": 4, "anim": 3},
            {"id": 2, "name": "Red Potion", "graphic": 11, "kind": "potion", "stat": "health", "min": 10, "max": 20},
            {"id": 3, "name": "Tree", "graphic": 12, "kind": "resource", "skill": "woodcutting", "pickable": false}
        ],
        "npcs": [
            {"id": 500, "name": "Rat", "body": 9, "behavior": "hostile_wander", "max_hp": 20, "experience": 30, "respawn": true}
        ],
        "spells": [
            {"id": 1, "name": "Dart", "mana_cost": 5, "effect": "damage", "min": 2, "max": 5, "targeting": "any"}
        ],
        "cities": [
            {"id": 1, "name": "Haven", "position": {"x": 50, "y": 50, "region": 1}}
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let defs = Definitions::from_json(SAMPLE).unwrap();

        let dagger = defs.object(1).unwrap();
        assert!(dagger.is_equippable());
        assert!(dagger.pickable);
        assert!(matches!(dagger.kind, ObjectKind::Weapon { max_hit: 4, ranged: false, .. }));

        assert!(!defs.object(3).unwrap().pickable);
        assert_eq!(defs.npc(500).unwrap().behavior, NpcBehavior::HostileWander);
        assert!(defs.spell(1).unwrap().effect.is_hostile());
        assert_eq!(defs.city(1).unwrap().position, Position::new(1, 50, 50));
        assert!(defs.object(99).is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = r#"{"cities": [
            {"id": 1, "name": "A", "position": {"x": 50, "y": 50, "region": 1}},
            {"id": 1, "name": "B", "position": {"x": 50, "y": 50, "region": 1}}
        ]}"#;
        assert!(matches!(
            Definitions::from_json(json),
            Err(DefinitionError::Duplicate { kind: "city", id: 1 })
        ));
    }

    #[test]
    fn test_missing_file_falls_back_to_empty() {
        let defs = Definitions::load_or_empty(Path::new("/nonexistent/definitions.json"));
        assert!(defs.object(1).is_none());
        assert_eq!(defs.cities().count(), 0);
    }
}
