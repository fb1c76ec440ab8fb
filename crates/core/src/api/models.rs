#![allow(missing_docs)]

//! Typed payloads for the endpoints the engine consumes.
//!
//! Numeric ids are decoded leniently: anything that is not a non-negative
//! integer fitting in `u32` is treated as "no id" instead of failing the
//! whole payload. Every other shape mismatch surfaces as a parse failure.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Records returned by the public bulk endpoints, keyed by their own id.
pub trait Identified {
    /// The record's numeric id.
    fn id(&self) -> u32;
}

/// `/account`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub world: Option<u32>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access: Vec<String>,
    #[serde(default)]
    pub guilds: Vec<String>,
    #[serde(default)]
    pub commander: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `/characters` returns the bare list of names.
pub type CharacterNameList = Vec<String>;

/// `/characters/{name}/buildtabs/active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTab {
    #[serde(default)]
    pub tab: Option<u32>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub build: Build,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Build {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profession: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub specializations: Vec<SpecializationLine>,
    #[serde(default)]
    pub skills: Option<SkillBar>,
    #[serde(default)]
    pub aquatic_skills: Option<SkillBar>,
}

/// One chosen specialization and its three major trait picks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecializationLine {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<u32>,
    #[serde(default, deserialize_with = "lenient_id_list")]
    pub traits: Vec<u32>,
}

/// Heal, utility and elite slots for one environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillBar {
    #[serde(default, deserialize_with = "lenient_id")]
    pub heal: Option<u32>,
    #[serde(default, deserialize_with = "lenient_id_list")]
    pub utilities: Vec<u32>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub elite: Option<u32>,
}

impl SkillBar {
    /// All skill ids on the bar in slot order: heal, utilities, elite.
    pub fn skill_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.heal
            .into_iter()
            .chain(self.utilities.iter().copied())
            .chain(self.elite)
    }
}

/// `/characters/{name}/equipment`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterEquipment {
    #[serde(default, deserialize_with = "lenient_list")]
    pub equipment: Vec<EquipmentSlot>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentSlot {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<u32>,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default, deserialize_with = "lenient_id_list")]
    pub upgrades: Vec<u32>,
    #[serde(default, deserialize_with = "lenient_id_list")]
    pub infusions: Vec<u32>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub skin: Option<u32>,
    #[serde(default)]
    pub binding: Option<String>,
    #[serde(default)]
    pub bound_to: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default, deserialize_with = "lenient_id_list")]
    pub tabs: Vec<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `/traits`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trait {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub specialization: Option<u32>,
    #[serde(default)]
    pub tier: Option<u32>,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `/skills`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `/specializations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specialization {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profession: Option<String>,
    #[serde(default)]
    pub elite: bool,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub minor_traits: Vec<u32>,
    #[serde(default)]
    pub major_traits: Vec<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `/items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub rarity: Option<String>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! identified {
    ($($ty:ty),* $(,)?) => {
        $(impl Identified for $ty {
            fn id(&self) -> u32 {
                self.id
            }
        })*
    };
}

identified!(Trait, Skill, Specialization, Item);

fn as_id(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|raw| u32::try_from(raw).ok())
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(as_id(&value))
}

fn lenient_id_list<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(values) => values.iter().filter_map(as_id).collect(),
        _ => Vec::new(),
    })
}

/// Keeps the entries that decode as `T`; a non-array becomes empty.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    let (entries, dropped) = decode_entries(value);
    if dropped > 0 {
        debug!(
            dropped,
            kept = entries.len(),
            record = std::any::type_name::<T>(),
            "dropped undecodable list entries"
        );
    }
    Ok(entries)
}

/// Decoded entries plus how many were discarded. A non-array counts as one.
fn decode_entries<T: DeserializeOwned>(value: Value) -> (Vec<T>, usize) {
    match value {
        Value::Array(values) => {
            let total = values.len();
            let entries: Vec<T> = values
                .into_iter()
                .filter_map(|entry| serde_json::from_value(entry).ok())
                .collect();
            let dropped = total - entries.len();
            (entries, dropped)
        }
        Value::Null => (Vec::new(), 0),
        _ => (Vec::new(), 1),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
