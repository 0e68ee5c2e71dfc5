//! Entity schema and merged-record types shared by every wfwiki crate.

use std::collections::BTreeMap;
use std::fmt;
use std::iter;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "wfwiki-core";

pub const ID_COLUMN: &str = "id";
pub const LAST_UPDATED_COLUMN: &str = "last_updated";

/// One persisted row as decoded for readers: column name to structured JSON.
pub type RecordRow = serde_json::Map<String, JsonValue>;

/// Column name to value. `None` means null: never written by a partial update.
pub type Attributes = BTreeMap<&'static str, Option<AttrValue>>;

/// Timestamps are stored as fixed-width RFC 3339 text with microsecond precision,
/// so they sort lexically and round-trip exactly.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Current time truncated to the stored precision.
pub fn now_stamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The three record shapes the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "warframes")]
    Character,
    #[serde(rename = "weapons")]
    Weapon,
    #[serde(rename = "mods")]
    Mod,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity kind: {0}")]
pub struct UnknownEntityKind(pub String);

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Character, EntityKind::Weapon, EntityKind::Mod];

    pub fn table_name(self) -> &'static str {
        match self {
            EntityKind::Character => "warframes",
            EntityKind::Weapon => "weapons",
            EntityKind::Mod => "mods",
        }
    }

    fn specific_columns(self) -> &'static [ColumnDef] {
        match self {
            EntityKind::Character => CHARACTER_COLUMNS,
            EntityKind::Weapon => WEAPON_COLUMNS,
            EntityKind::Mod => MOD_COLUMNS,
        }
    }

    /// Every column in table order, `id` first and `last_updated` last.
    pub fn columns(self) -> impl Iterator<Item = &'static ColumnDef> + Clone {
        iter::once(&ID_DEF)
            .chain(self.data_columns())
            .chain(iter::once(&LAST_UPDATED_DEF))
    }

    /// Columns a merge or a caller may write. Excludes `id` and `last_updated`.
    pub fn data_columns(self) -> impl Iterator<Item = &'static ColumnDef> + Clone {
        BASE_DATA_COLUMNS.iter().chain(self.specific_columns().iter())
    }

    pub fn column(self, name: &str) -> Option<&'static ColumnDef> {
        self.columns().find(|c| c.name == name)
    }

    pub fn data_column(self, name: &str) -> Option<&'static ColumnDef> {
        self.data_columns().find(|c| c.name == name)
    }

    /// Numeric columns that must be strictly positive for a record to be stored.
    pub fn positive_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Character => &["health"],
            EntityKind::Weapon | EntityKind::Mod => &[],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warframes" | "warframe" | "characters" | "character" => Ok(EntityKind::Character),
            "weapons" | "weapon" => Ok(EntityKind::Weapon),
            "mods" | "mod" => Ok(EntityKind::Mod),
            _ => Err(UnknownEntityKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Zh,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Zh => "zh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Float,
    Integer,
    Boolean,
    /// Structured data stored as JSON text.
    Json,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Json | ColumnType::Timestamp => "TEXT",
            ColumnType::Float => "REAL",
            ColumnType::Integer => "INTEGER",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef { name, ty }
}

static ID_DEF: ColumnDef = col(ID_COLUMN, ColumnType::Text);
static LAST_UPDATED_DEF: ColumnDef = col(LAST_UPDATED_COLUMN, ColumnType::Timestamp);

static BASE_DATA_COLUMNS: &[ColumnDef] = &[
    col("name_en", ColumnType::Text),
    col("name_zh", ColumnType::Text),
    col("name_alias", ColumnType::Text),
    col("description_en", ColumnType::Text),
    col("description_zh", ColumnType::Text),
    col("image_url", ColumnType::Text),
    col("wiki_url", ColumnType::Text),
];

static CHARACTER_COLUMNS: &[ColumnDef] = &[
    col("health", ColumnType::Float),
    col("shield", ColumnType::Float),
    col("armor", ColumnType::Float),
    col("energy", ColumnType::Float),
    col("sprint_speed", ColumnType::Float),
    col("mastery_rank", ColumnType::Integer),
    col("abilities_en", ColumnType::Json),
    col("abilities_zh", ColumnType::Json),
    col("passive_en", ColumnType::Text),
    col("passive_zh", ColumnType::Text),
    col("polarities", ColumnType::Json),
];

static WEAPON_COLUMNS: &[ColumnDef] = &[
    col("type", ColumnType::Text),
    col("mastery_rank", ColumnType::Integer),
    col("damage", ColumnType::Json),
    col("critical_chance", ColumnType::Float),
    col("critical_multiplier", ColumnType::Float),
    col("status_chance", ColumnType::Float),
    col("fire_rate", ColumnType::Float),
    col("accuracy", ColumnType::Float),
    col("magazine_size", ColumnType::Integer),
    col("reload_time", ColumnType::Float),
    col("disposition", ColumnType::Integer),
];

static MOD_COLUMNS: &[ColumnDef] = &[
    col("polarity", ColumnType::Text),
    col("rarity", ColumnType::Text),
    col("drain", ColumnType::Integer),
    col("max_rank", ColumnType::Integer),
    col("effect_en", ColumnType::Text),
    col("effect_zh", ColumnType::Text),
    col("tradable", ColumnType::Boolean),
    col("mod_set", ColumnType::Text),
    col("base_effects", ColumnType::Json),
    col("upgrade_effects", ColumnType::Json),
];

/// A single typed column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Text(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Json(JsonValue),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected} for `{column}`")]
pub struct AttrTypeError {
    pub column: String,
    pub expected: &'static str,
}

impl AttrValue {
    /// Strict conversion of caller-supplied JSON into a column value.
    /// JSON null maps to `Ok(None)`.
    pub fn from_json(column: &ColumnDef, value: &JsonValue) -> Result<Option<AttrValue>, AttrTypeError> {
        if value.is_null() {
            return Ok(None);
        }
        let mismatch = |expected| AttrTypeError {
            column: column.name.to_string(),
            expected,
        };
        let converted = match column.ty {
            ColumnType::Text => AttrValue::Text(value.as_str().ok_or_else(|| mismatch("a string"))?.to_string()),
            ColumnType::Float => AttrValue::Float(value.as_f64().ok_or_else(|| mismatch("a number"))?),
            ColumnType::Integer => {
                let int = value
                    .as_i64()
                    .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .ok_or_else(|| mismatch("an integer"))?;
                AttrValue::Int(int)
            }
            ColumnType::Boolean => AttrValue::Bool(value.as_bool().ok_or_else(|| mismatch("a boolean"))?),
            ColumnType::Json => AttrValue::Json(value.clone()),
            ColumnType::Timestamp => return Err(mismatch("a server-managed timestamp")),
        };
        Ok(Some(converted))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            AttrValue::Text(s) => JsonValue::String(s.clone()),
            AttrValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            AttrValue::Int(i) => JsonValue::from(*i),
            AttrValue::Bool(b) => JsonValue::Bool(*b),
            AttrValue::Json(v) => v.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Joined English + localized record for one entity, ready for validation and upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    pub kind: EntityKind,
    pub id: String,
    pub attributes: Attributes,
}

impl MergedRecord {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn set(&mut self, column: &'static str, value: Option<AttrValue>) {
        self.attributes.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&AttrValue> {
        self.attributes.get(column).and_then(Option::as_ref)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(AttrValue::as_str)
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(AttrValue::as_f64)
    }

    /// Non-null attributes, the set a partial update writes.
    pub fn present_fields(&self) -> impl Iterator<Item = (&'static str, &AttrValue)> {
        self.attributes
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (*k, v)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ability {
    pub name: String,
    pub description: String,
}

/// Per-damage-type values plus the weapon's total damage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageProfile {
    #[serde(flatten)]
    pub types: BTreeMap<String, f64>,
    pub total: f64,
}

impl DamageProfile {
    pub const BASE_TYPES: [&'static str; 3] = ["impact", "puncture", "slash"];

    pub fn zeroed() -> Self {
        Self {
            types: Self::BASE_TYPES.iter().map(|t| (t.to_string(), 0.0)).collect(),
            total: 0.0,
        }
    }
}
