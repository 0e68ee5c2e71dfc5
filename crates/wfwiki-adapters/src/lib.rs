//! Collection sources, field normalization and the English/localized join.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use wfwiki_core::{Ability, AttrValue, DamageProfile, EntityKind, Language, MergedRecord};
use wfwiki_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "wfwiki-adapters";

/// Raw field carrying the join key in both language collections.
pub const KEY_FIELD: &str = "uniqueName";
pub const TOTAL_DAMAGE_FIELD: &str = "totalDamage";

pub type JsonMap = serde_json::Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{kind} collection ({language}) is not a JSON array: {reason}")]
    Decode {
        kind: EntityKind,
        language: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Collection decoding
// ---------------------------------------------------------------------------

/// Decode one fetched collection. Non-object elements are skipped.
pub fn decode_collection(
    kind: EntityKind,
    language: Language,
    bytes: &[u8],
) -> Result<Vec<JsonMap>, AdapterError> {
    let decode_err = |reason: String| AdapterError::Decode {
        kind,
        language: language.code(),
        reason,
    };
    let value: JsonValue = serde_json::from_slice(bytes).map_err(|e| decode_err(e.to_string()))?;
    let items = match value {
        JsonValue::Array(items) => items,
        other => {
            return Err(decode_err(format!(
                "top-level value is {}",
                json_type_name(&other)
            )))
        }
    };

    let total = items.len();
    let records = items
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::Object(map) => Some(map),
            _ => None,
        })
        .collect::<Vec<_>>();
    if records.len() < total {
        debug!(
            %kind,
            language = language.code(),
            skipped = total - records.len(),
            "skipped non-object collection elements"
        );
    }
    Ok(records)
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Field normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// String, `""` when missing.
    Text,
    /// Number or numeric string, 0.0 on failure.
    Float,
    /// Number or numeric string truncated toward zero, 0 on failure.
    Int,
    Bool,
    /// `[{name, description}]`, dropping entries with an empty name or description.
    Abilities,
    TextList,
    /// `damageTypes` object plus `totalDamage`.
    Damage,
    /// First stat string of the first `levelStats` entry.
    FirstLevelStat,
    /// Raw JSON kept as-is, null when missing.
    Json,
}

/// One column of a merged record: which side it is read from and how it is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    pub target: &'static str,
    pub side: Language,
    pub source: &'static str,
    pub coerce: Coercion,
}

const fn rule(target: &'static str, side: Language, source: &'static str, coerce: Coercion) -> FieldRule {
    FieldRule {
        target,
        side,
        source,
        coerce,
    }
}

use Coercion as C;
use Language::{En, Zh};

static BASE_RULES: &[FieldRule] = &[
    rule("name_en", En, "name", C::Text),
    rule("name_zh", Zh, "name", C::Text),
    rule("description_en", En, "description", C::Text),
    rule("description_zh", Zh, "description", C::Text),
    rule("image_url", En, "wikiaThumbnail", C::Text),
    rule("wiki_url", En, "wikiaUrl", C::Text),
];

static CHARACTER_RULES: &[FieldRule] = &[
    rule("health", En, "health", C::Float),
    rule("shield", En, "shield", C::Float),
    rule("armor", En, "armor", C::Float),
    rule("energy", En, "power", C::Float),
    rule("sprint_speed", En, "sprintSpeed", C::Float),
    rule("mastery_rank", En, "masteryReq", C::Int),
    rule("abilities_en", En, "abilities", C::Abilities),
    rule("abilities_zh", Zh, "abilities", C::Abilities),
    rule("passive_en", En, "passiveDescription", C::Text),
    rule("passive_zh", Zh, "passiveDescription", C::Text),
    rule("polarities", En, "polarities", C::TextList),
];

static WEAPON_RULES: &[FieldRule] = &[
    rule("type", En, "type", C::Text),
    rule("mastery_rank", En, "masteryReq", C::Int),
    rule("damage", En, "damageTypes", C::Damage),
    rule("critical_chance", En, "criticalChance", C::Float),
    rule("critical_multiplier", En, "criticalMultiplier", C::Float),
    rule("status_chance", En, "procChance", C::Float),
    rule("fire_rate", En, "fireRate", C::Float),
    rule("accuracy", En, "accuracy", C::Float),
    rule("magazine_size", En, "magazineSize", C::Int),
    rule("reload_time", En, "reloadTime", C::Float),
    rule("disposition", En, "disposition", C::Int),
];

static MOD_RULES: &[FieldRule] = &[
    rule("polarity", En, "polarity", C::Text),
    rule("rarity", En, "rarity", C::Text),
    rule("drain", En, "baseDrain", C::Int),
    rule("max_rank", En, "fusionLimit", C::Int),
    rule("effect_en", En, "levelStats", C::FirstLevelStat),
    rule("effect_zh", Zh, "levelStats", C::FirstLevelStat),
    rule("tradable", En, "tradable", C::Bool),
    rule("mod_set", En, "modSet", C::Text),
    rule("base_effects", En, "levelStats", C::Json),
    rule("upgrade_effects", En, "upgradeEntries", C::Json),
];

/// Mapping table for one kind: shared base rules first, then the kind's own.
pub fn field_rules(kind: EntityKind) -> impl Iterator<Item = &'static FieldRule> {
    let specific = match kind {
        EntityKind::Character => CHARACTER_RULES,
        EntityKind::Weapon => WEAPON_RULES,
        EntityKind::Mod => MOD_RULES,
    };
    BASE_RULES.iter().chain(specific.iter())
}

/// Normalize an English/localized pair into a merged record. Never fails.
pub fn normalize_pair(kind: EntityKind, id: &str, en: &JsonMap, zh: &JsonMap) -> MergedRecord {
    let mut record = MergedRecord::new(kind, id);
    for rule in field_rules(kind) {
        let raw = match rule.side {
            Language::En => en,
            Language::Zh => zh,
        };
        let value = coerce(rule, raw, id);
        record.set(rule.target, value);
    }
    record
}

fn coerce(rule: &FieldRule, raw: &JsonMap, id: &str) -> Option<AttrValue> {
    let value = raw.get(rule.source).filter(|v| !v.is_null());
    let substituted = |what: &str| {
        debug!(id, field = rule.source, target = rule.target, "substituted {what} for malformed value");
    };

    match rule.coerce {
        Coercion::Text => Some(AttrValue::Text(match value {
            None => String::new(),
            Some(JsonValue::String(s)) => s.clone(),
            Some(v @ (JsonValue::Number(_) | JsonValue::Bool(_))) => v.to_string(),
            Some(_) => {
                substituted("empty text");
                String::new()
            }
        })),
        Coercion::Float => Some(AttrValue::Float(match value {
            None => 0.0,
            Some(v) => numeric(v).unwrap_or_else(|| {
                substituted("0.0");
                0.0
            }),
        })),
        Coercion::Int => Some(AttrValue::Int(match value {
            None => 0,
            Some(v) => integer(v).unwrap_or_else(|| {
                substituted("0");
                0
            }),
        })),
        Coercion::Bool => Some(AttrValue::Bool(match value {
            None => false,
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("true") => true,
            Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("false") => false,
            Some(_) => {
                substituted("false");
                false
            }
        })),
        Coercion::Abilities => {
            let abilities = match value {
                None => Vec::new(),
                Some(JsonValue::Array(items)) => items.iter().filter_map(ability).collect(),
                Some(_) => {
                    substituted("empty ability list");
                    Vec::new()
                }
            };
            Some(AttrValue::Json(serde_json::to_value(abilities).unwrap_or_default()))
        }
        Coercion::TextList => {
            let items = match value {
                None => Vec::new(),
                Some(JsonValue::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| JsonValue::String(s.to_string())))
                    .collect(),
                Some(_) => {
                    substituted("empty list");
                    Vec::new()
                }
            };
            Some(AttrValue::Json(JsonValue::Array(items)))
        }
        Coercion::Damage => {
            let profile = damage_profile(value, raw.get(TOTAL_DAMAGE_FIELD)).unwrap_or_else(|| {
                if value.is_some() {
                    substituted("zeroed damage");
                }
                DamageProfile::zeroed()
            });
            Some(AttrValue::Json(serde_json::to_value(profile).unwrap_or_default()))
        }
        Coercion::FirstLevelStat => Some(AttrValue::Text(first_level_stat(value).unwrap_or_default())),
        Coercion::Json => value.cloned().map(AttrValue::Json),
    }
}

fn numeric(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn integer(value: &JsonValue) -> Option<i64> {
    if let JsonValue::Number(n) = value {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    if let JsonValue::String(s) = value {
        if let Ok(i) = s.trim().parse::<i64>() {
            return Some(i);
        }
    }
    numeric(value)
        .filter(|f| f.abs() < i64::MAX as f64)
        .map(|f| f.trunc() as i64)
}

fn ability(value: &JsonValue) -> Option<Ability> {
    let name = value.get("name")?.as_str()?;
    let description = value.get("description")?.as_str()?;
    if name.is_empty() || description.is_empty() {
        return None;
    }
    Some(Ability {
        name: name.to_string(),
        description: description.to_string(),
    })
}

/// `None` when the damage block is absent or any entry or the total is not numeric.
fn damage_profile(types: Option<&JsonValue>, total: Option<&JsonValue>) -> Option<DamageProfile> {
    let entries = types?.as_object()?;
    let mut profile = DamageProfile::zeroed();
    for (name, value) in entries {
        profile.types.insert(name.clone(), numeric(value)?);
    }
    profile.total = match total.filter(|v| !v.is_null()) {
        None => 0.0,
        Some(v) => numeric(v)?,
    };
    Some(profile)
}

fn first_level_stat(level_stats: Option<&JsonValue>) -> Option<String> {
    level_stats?
        .as_array()?
        .first()?
        .get("stats")?
        .as_array()?
        .first()?
        .as_str()
        .map(ToString::to_string)
}

// ---------------------------------------------------------------------------
// Bilingual joiner
// ---------------------------------------------------------------------------

pub const DEFAULT_EXCLUDE_MARKERS: &[&str] = &["archwing"];

/// Join key of a raw record: `uniqueName` as text, `""` when missing.
pub fn record_key(record: &JsonMap) -> String {
    match record.get(KEY_FIELD) {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Non-playable markers only apply to characters; matching is case-insensitive.
pub fn is_excluded(kind: EntityKind, key: &str, markers: &[String]) -> bool {
    if kind != EntityKind::Character {
        return false;
    }
    let key = key.to_lowercase();
    markers
        .iter()
        .any(|marker| !marker.is_empty() && key.contains(&marker.to_lowercase()))
}

/// Key to record, last write wins while the first occurrence keeps its position.
pub fn index_collection(
    kind: EntityKind,
    records: Vec<JsonMap>,
    exclude_markers: &[String],
) -> IndexMap<String, JsonMap> {
    let mut index = IndexMap::with_capacity(records.len());
    for record in records {
        let key = record_key(&record);
        if is_excluded(kind, &key, exclude_markers) {
            debug!(%kind, key = %key, "excluded non-playable record");
            continue;
        }
        index.insert(key, record);
    }
    index
}

/// Lazy, single-pass stream of merged records in English insertion order.
#[derive(Debug)]
pub struct BilingualJoin {
    kind: EntityKind,
    english: indexmap::map::IntoIter<String, JsonMap>,
    localized: IndexMap<String, JsonMap>,
}

impl BilingualJoin {
    pub fn new(
        kind: EntityKind,
        english: IndexMap<String, JsonMap>,
        localized: IndexMap<String, JsonMap>,
    ) -> Self {
        Self {
            kind,
            english: english.into_iter(),
            localized,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }
}

impl Iterator for BilingualJoin {
    type Item = MergedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for (key, en) in self.english.by_ref() {
            match self.localized.get(&key) {
                Some(zh) => return Some(normalize_pair(self.kind, &key, &en, zh)),
                None => debug!(kind = %self.kind, key = %key, "no localized record; skipped"),
            }
        }
        None
    }
}

/// Decode both collections and return the merged stream.
/// A decode failure on either side fails the whole join.
pub fn join_collections(
    kind: EntityKind,
    en_bytes: &[u8],
    zh_bytes: &[u8],
    exclude_markers: &[String],
) -> Result<BilingualJoin, AdapterError> {
    let english = decode_collection(kind, Language::En, en_bytes)?;
    let localized = decode_collection(kind, Language::Zh, zh_bytes)?;
    info!(
        %kind,
        english = english.len(),
        localized = localized.len(),
        "decoded collections"
    );
    Ok(BilingualJoin::new(
        kind,
        index_collection(kind, english, exclude_markers),
        index_collection(kind, localized, exclude_markers),
    ))
}

// ---------------------------------------------------------------------------
// Collection sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Api,
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedCollection {
    pub kind: EntityKind,
    pub language: Language,
    pub location: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait CollectionSource: Send + Sync {
    fn kind(&self) -> EntityKind;
    fn mode(&self) -> SourceMode;

    async fn fetch_collection(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        language: Language,
    ) -> Result<FetchedCollection, AdapterError>;
}

/// Live `GET {base}{path}?language={code}`.
#[derive(Debug, Clone)]
pub struct ApiCollectionSource {
    kind: EntityKind,
    base_url: String,
    path: String,
}

impl ApiCollectionSource {
    pub fn new(kind: EntityKind, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            path: path.into(),
        }
    }

    pub fn url_for(&self, language: Language) -> String {
        let path = self.path.trim();
        let separator = if path.starts_with('/') { "" } else { "/" };
        format!(
            "{}{}{}?language={}",
            self.base_url.trim_end_matches('/'),
            separator,
            path,
            language.code()
        )
    }
}

#[async_trait]
impl CollectionSource for ApiCollectionSource {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Api
    }

    async fn fetch_collection(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        language: Language,
    ) -> Result<FetchedCollection, AdapterError> {
        let url = self.url_for(language);
        let resp = http
            .fetch_bytes(ctx.run_id, self.kind.table_name(), &url)
            .await?;
        info!(kind = %self.kind, language = language.code(), bytes = resp.body.len(), "fetched collection");
        Ok(FetchedCollection {
            kind: self.kind,
            language,
            location: resp.final_url,
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }
}

/// Recorded collections at `{dir}/{en|zh}.json`.
#[derive(Debug, Clone)]
pub struct FixtureCollectionSource {
    kind: EntityKind,
    dir: PathBuf,
}

impl FixtureCollectionSource {
    pub fn new(kind: EntityKind, dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            dir: dir.into(),
        }
    }

    pub fn path_for(&self, language: Language) -> PathBuf {
        self.dir.join(format!("{}.json", language.code()))
    }
}

#[async_trait]
impl CollectionSource for FixtureCollectionSource {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Fixture
    }

    async fn fetch_collection(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        language: Language,
    ) -> Result<FetchedCollection, AdapterError> {
        let path = self.path_for(language);
        let body = fs::read(&path).with_context(|| format!("reading fixture {}", path.display()))?;
        Ok(FetchedCollection {
            kind: self.kind,
            language,
            location: path.display().to_string(),
            body,
            fetched_at: ctx.fetched_at,
        })
    }
}

pub fn adapter_for_source(
    kind: EntityKind,
    mode: SourceMode,
    api_base: &str,
    path: &str,
    fixture_dir: &Path,
) -> Box<dyn CollectionSource> {
    match mode {
        SourceMode::Api => Box::new(ApiCollectionSource::new(kind, api_base, path)),
        SourceMode::Fixture => Box::new(FixtureCollectionSource::new(kind, fixture_dir)),
    }
}
