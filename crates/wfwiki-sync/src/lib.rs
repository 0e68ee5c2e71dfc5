//! Sync pipeline: source registry, validation gate, upsert engine and export.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use wfwiki_adapters::{
    adapter_for_source, join_collections, AdapterContext, SourceMode, DEFAULT_EXCLUDE_MARKERS,
};
use wfwiki_core::{now_stamp, Attributes, ColumnType, EntityKind, Language, MergedRecord};
use wfwiki_storage::{
    BackoffPolicy, ExportWriter, HttpClientConfig, HttpFetcher, RecordStore, RecordTransaction,
    SqliteRecordStore, StoreError,
};

pub const CRATE_NAME: &str = "wfwiki-sync";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: EntityKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub mode: SourceMode,
    pub path: String,
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
    #[serde(default)]
    pub exclude_markers: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    /// Live API sources for all three kinds.
    pub fn builtin() -> Self {
        let sources = EntityKind::ALL
            .into_iter()
            .map(|kind| SourceConfig {
                kind,
                enabled: true,
                mode: SourceMode::Api,
                path: format!("/{}/", kind.table_name()),
                fixture_dir: None,
                exclude_markers: match kind {
                    EntityKind::Character => DEFAULT_EXCLUDE_MARKERS.iter().map(|m| m.to_string()).collect(),
                    _ => Vec::new(),
                },
            })
            .collect();
        Self { sources }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// `{workspace_root}/sources.yaml`, or the built-in registry when the file is absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            info!(path = %path.display(), "no sources.yaml; using built-in registry");
            return Ok(Self::builtin());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn source_for(&self, kind: EntityKind) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.kind == kind)
    }

    /// Switch every source to recorded fixtures.
    pub fn into_fixture_mode(mut self) -> Self {
        for source in &mut self.sources {
            source.mode = SourceMode::Fixture;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub request_delay_ms: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
    pub export_dir: PathBuf,
    pub web_host: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://warframe_data.db?mode=rwc".to_string(),
            api_base: "https://api.warframestat.us".to_string(),
            user_agent: "wfwiki-bot/0.1".to_string(),
            http_timeout_secs: 30,
            max_retries: 5,
            request_delay_ms: 2000,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            workspace_root: PathBuf::from("."),
            export_dir: PathBuf::from("./exports"),
            web_host: "127.0.0.1".to_string(),
            web_port: 8080,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            api_base: std::env::var("WFWIKI_API_BASE").unwrap_or(defaults.api_base),
            user_agent: std::env::var("WFWIKI_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("WFWIKI_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            max_retries: env_parse("WFWIKI_MAX_RETRIES").unwrap_or(defaults.max_retries),
            request_delay_ms: env_parse("WFWIKI_REQUEST_DELAY_MS").unwrap_or(defaults.request_delay_ms),
            scheduler_enabled: std::env::var("WFWIKI_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("WFWIKI_SYNC_CRON").unwrap_or(defaults.sync_cron),
            workspace_root: std::env::var("WFWIKI_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            export_dir: std::env::var("WFWIKI_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
            web_host: std::env::var("WFWIKI_WEB_HOST").unwrap_or(defaults.web_host),
            web_port: env_parse("WFWIKI_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: 1,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
            request_interval: (self.request_delay_ms > 0)
                .then(|| Duration::from_millis(self.request_delay_ms)),
        }
    }

    fn fixture_dir_for(&self, source: &SourceConfig) -> PathBuf {
        match &source.fixture_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.workspace_root.join(dir),
            None => self
                .workspace_root
                .join("fixtures")
                .join(source.kind.table_name()),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("empty id")]
    EmptyId,
    #[error("empty name_en")]
    EmptyNameEn,
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("no writable fields")]
    EmptyPatch,
}

/// Reject records that must never reach the store.
pub fn validate_record(record: &MergedRecord) -> Result<(), Rejection> {
    if record.id.is_empty() {
        return Err(Rejection::EmptyId);
    }
    if record.text("name_en").map_or(true, str::is_empty) {
        return Err(Rejection::EmptyNameEn);
    }
    for &field in record.kind.positive_fields() {
        let value = record.float(field).unwrap_or(0.0);
        if !(value > 0.0) {
            return Err(Rejection::NonPositive { field, value });
        }
    }
    Ok(())
}

/// Reject a partial update that would leave a stored row breaking the gate.
/// Null values leave the column untouched, so only present values are checked.
pub fn validate_patch(kind: EntityKind, attributes: &Attributes) -> Result<(), Rejection> {
    let present = attributes
        .iter()
        .filter_map(|(&field, value)| value.as_ref().map(|v| (field, v)))
        .collect::<Vec<_>>();
    if present.is_empty() {
        return Err(Rejection::EmptyPatch);
    }
    for (field, value) in present {
        if field == "name_en" && value.as_str().map_or(true, str::is_empty) {
            return Err(Rejection::EmptyNameEn);
        }
        let Some(number) = value.as_f64() else {
            continue;
        };
        if kind.positive_fields().contains(&field) && !(number > 0.0) {
            return Err(Rejection::NonPositive { field, value: number });
        }
        let is_float = kind
            .data_column(field)
            .is_some_and(|c| c.ty == ColumnType::Float);
        if kind == EntityKind::Character && is_float && number < 0.0 {
            return Err(Rejection::Negative { field, value: number });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reconciliation / upsert engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Stamp for the next write of a row: now, but always past the previous stamp.
pub fn next_stamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now_stamp();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

#[derive(Clone)]
pub struct ReconcileEngine {
    store: Arc<dyn RecordStore>,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Insert on first sighting, otherwise overwrite the non-null attributes.
    /// One transaction per record; any failure rolls it back.
    pub async fn apply(&self, record: &MergedRecord) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.store.begin().await?;
        let result = upsert_in(tx.as_mut(), record).await;
        finish(tx, result).await
    }

    /// Update-only write for an existing row.
    pub async fn patch(
        &self,
        kind: EntityKind,
        id: &str,
        attributes: &Attributes,
    ) -> Result<(), StoreError> {
        let mut tx = self.store.begin().await?;
        let result = patch_in(tx.as_mut(), kind, id, attributes).await;
        finish(tx, result).await
    }
}

async fn upsert_in(
    tx: &mut dyn RecordTransaction,
    record: &MergedRecord,
) -> Result<UpsertOutcome, StoreError> {
    match tx.find_by_id(record.kind, &record.id).await? {
        Some(existing) => {
            let stamp = next_stamp(existing.last_updated);
            tx.update(record.kind, &record.id, &record.attributes, stamp).await?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            tx.insert(record.kind, &record.id, &record.attributes, now_stamp())
                .await?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

async fn patch_in(
    tx: &mut dyn RecordTransaction,
    kind: EntityKind,
    id: &str,
    attributes: &Attributes,
) -> Result<(), StoreError> {
    let existing = tx
        .find_by_id(kind, id)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_string(),
        })?;
    tx.update(kind, id, attributes, next_stamp(existing.last_updated))
        .await?;
    Ok(())
}

async fn finish<T>(
    tx: Box<dyn RecordTransaction>,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub kind: EntityKind,
    pub inserted: usize,
    pub updated: usize,
    pub rejected: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl BatchReport {
    fn for_kind(kind: EntityKind) -> Self {
        Self {
            kind,
            inserted: 0,
            updated: 0,
            rejected: 0,
            failed: 0,
            error: None,
        }
    }

    fn failed_with(kind: EntityKind, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::for_kind(kind)
        }
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches: Vec<BatchReport>,
}

impl SyncRunSummary {
    pub fn failed_batches(&self) -> usize {
        self.batches.iter().filter(|b| b.error.is_some()).count()
    }

    pub fn batch(&self, kind: EntityKind) -> Option<&BatchReport> {
        self.batches.iter().find(|b| b.kind == kind)
    }
}

/// Gate then upsert every merged record, one transaction each.
pub async fn ingest_records(
    engine: &ReconcileEngine,
    kind: EntityKind,
    records: impl IntoIterator<Item = MergedRecord>,
) -> BatchReport {
    let mut report = BatchReport::for_kind(kind);
    for record in records {
        if let Err(rejection) = validate_record(&record) {
            warn!(%kind, id = %record.id, reason = %rejection, "rejected record");
            report.rejected += 1;
            continue;
        }
        match engine.apply(&record).await {
            Ok(UpsertOutcome::Inserted) => report.inserted += 1,
            Ok(UpsertOutcome::Updated) => report.updated += 1,
            Err(err) => {
                error!(%kind, id = %record.id, error = %err, "upsert failed; rolled back");
                report.failed += 1;
            }
        }
    }
    report
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    http: HttpFetcher,
    store: SqliteRecordStore,
    engine: ReconcileEngine,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: SourceRegistry, store: SqliteRecordStore) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let engine = ReconcileEngine::new(Arc::new(store.clone()));
        Ok(Self {
            config,
            registry,
            http,
            store,
            engine,
        })
    }

    /// Connect the configured store, create tables and load `sources.yaml`.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = SqliteRecordStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.ensure_schema().await.context("creating tables")?;
        let registry = SourceRegistry::load(&config.workspace_root).await?;
        Self::new(config, registry, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteRecordStore {
        &self.store
    }

    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }

    /// Run one batch per kind, sequentially. A failed batch is reported and the rest continue.
    #[instrument(skip(self), fields(run_id))]
    pub async fn run_once(&self, kinds: &[EntityKind]) -> Result<SyncRunSummary> {
        let ctx = AdapterContext::new();
        tracing::Span::current().record("run_id", tracing::field::display(ctx.run_id));
        let started_at = Utc::now();
        let mut batches = Vec::with_capacity(kinds.len());

        for &kind in kinds {
            let Some(source) = self.registry.source_for(kind) else {
                warn!(%kind, "no source configured");
                batches.push(BatchReport::failed_with(kind, "no source configured"));
                continue;
            };
            if !source.enabled {
                info!(%kind, "source disabled; skipped");
                continue;
            }
            let report = self.run_source(source, &ctx).await;
            info!(
                %kind,
                inserted = report.inserted,
                updated = report.updated,
                rejected = report.rejected,
                failed = report.failed,
                error = report.error.as_deref().unwrap_or(""),
                "batch finished"
            );
            batches.push(report);
        }

        Ok(SyncRunSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            batches,
        })
    }

    async fn run_source(&self, source: &SourceConfig, ctx: &AdapterContext) -> BatchReport {
        let kind = source.kind;
        let adapter = adapter_for_source(
            kind,
            source.mode,
            &self.config.api_base,
            &source.path,
            &self.config.fixture_dir_for(source),
        );

        let english = match adapter.fetch_collection(&self.http, ctx, Language::En).await {
            Ok(c) => c,
            Err(err) => {
                error!(%kind, error = %err, "english collection unavailable");
                return BatchReport::failed_with(kind, err);
            }
        };
        let localized = match adapter.fetch_collection(&self.http, ctx, Language::Zh).await {
            Ok(c) => c,
            Err(err) => {
                error!(%kind, error = %err, "localized collection unavailable");
                return BatchReport::failed_with(kind, err);
            }
        };

        self.ingest_collections(kind, &english.body, &localized.body, &source.exclude_markers)
            .await
    }

    /// Join, gate and upsert one kind's raw collections.
    #[instrument(skip(self, en_bytes, zh_bytes, exclude_markers))]
    pub async fn ingest_collections(
        &self,
        kind: EntityKind,
        en_bytes: &[u8],
        zh_bytes: &[u8],
        exclude_markers: &[String],
    ) -> BatchReport {
        match join_collections(kind, en_bytes, zh_bytes, exclude_markers) {
            Ok(merged) => ingest_records(&self.engine, kind, merged).await,
            Err(err) => {
                error!(%kind, error = %err, "collection decode failed; batch dropped");
                BatchReport::failed_with(kind, err)
            }
        }
    }

    pub async fn export(&self, format: ExportFormat, out_dir: Option<&Path>) -> Result<ExportManifest> {
        let out_dir = out_dir.unwrap_or(&self.config.export_dir);
        export_snapshot(&self.store, out_dir, format).await
    }
}

/// Cron job running a full sync, when the scheduler is enabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once(&EntityKind::ALL).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    failed_batches = summary.failed_batches(),
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env(kinds: &[EntityKind]) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.run_once(kinds).await
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

pub const JSON_EXPORT_FILE: &str = "warframe_data.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    All,
}

impl ExportFormat {
    fn includes_json(self) -> bool {
        matches!(self, ExportFormat::Json | ExportFormat::All)
    }

    fn includes_csv(self) -> bool {
        matches!(self, ExportFormat::Csv | ExportFormat::All)
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "all" => Ok(ExportFormat::All),
            other => Err(anyhow!("unknown export format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Dump every table to JSON and/or per-table CSV plus a checksum manifest.
pub async fn export_snapshot(
    store: &SqliteRecordStore,
    out_dir: &Path,
    format: ExportFormat,
) -> Result<ExportManifest> {
    let writer = ExportWriter::new(out_dir);
    let mut tables = BTreeMap::new();
    for kind in EntityKind::ALL {
        let rows = store
            .all_rows(kind)
            .await
            .with_context(|| format!("reading {kind} for export"))?;
        tables.insert(kind, rows);
    }

    let mut files = Vec::new();
    if format.includes_json() {
        let document = tables
            .iter()
            .map(|(kind, rows)| {
                let rows = rows
                    .iter()
                    .map(|r| JsonValue::Object(r.values.clone()))
                    .collect::<Vec<_>>();
                (kind.table_name().to_string(), JsonValue::Array(rows))
            })
            .collect::<serde_json::Map<_, _>>();
        let bytes = serde_json::to_vec_pretty(&document).context("serializing json export")?;
        let written = writer.write_file(JSON_EXPORT_FILE, &bytes).await?;
        files.push(manifest_entry("all_tables", &written));
    }
    if format.includes_csv() {
        for (kind, rows) in &tables {
            let bytes = table_to_csv(*kind, rows.iter().map(|r| &r.values))?;
            let relative = Path::new("csv").join(format!("{}.csv", kind.table_name()));
            let written = writer.write_file(&relative, &bytes).await?;
            files.push(manifest_entry(kind.table_name(), &written));
        }
    }

    let manifest = ExportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    writer.write_file(MANIFEST_FILE, &bytes).await?;
    info!(out_dir = %out_dir.display(), files = manifest.files.len(), "export written");
    Ok(manifest)
}

fn manifest_entry(name: &str, written: &wfwiki_storage::WrittenFile) -> ExportManifestFile {
    ExportManifestFile {
        name: name.to_string(),
        path: written.relative_path.display().to_string(),
        sha256: written.sha256.clone(),
        bytes: written.byte_size as u64,
    }
}

fn table_to_csv<'a>(
    kind: EntityKind,
    rows: impl Iterator<Item = &'a wfwiki_core::RecordRow>,
) -> Result<Vec<u8>> {
    let mut out = csv::Writer::from_writer(Vec::new());
    out.write_record(kind.columns().map(|c| c.name))
        .context("writing csv header")?;
    for row in rows {
        out.write_record(kind.columns().map(|c| csv_cell(row.get(c.name))))
            .context("writing csv row")?;
    }
    out.into_inner()
        .map_err(|e| anyhow!("flushing csv buffer: {}", e.error()))
}

fn csv_cell(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use wfwiki_core::AttrValue;
    use wfwiki_storage::StoredRow;

    async fn pipeline() -> SyncPipeline {
        let store = SqliteRecordStore::in_memory().await.expect("memory store");
        let config = SyncConfig {
            request_delay_ms: 0,
            workspace_root: Path::new(env!("CARGO_MANIFEST_DIR")).join("../.."),
            ..SyncConfig::default()
        };
        SyncPipeline::new(config, SourceRegistry::builtin().into_fixture_mode(), store)
            .expect("pipeline")
    }

    fn character(id: &str, name_en: &str, health: f64) -> MergedRecord {
        let mut record = MergedRecord::new(EntityKind::Character, id);
        record.set("name_en", Some(AttrValue::Text(name_en.into())));
        record.set("health", Some(AttrValue::Float(health)));
        record
    }

    #[test]
    fn gate_rejects_empty_keys_names_and_non_positive_health() {
        assert_eq!(validate_record(&character("", "Foo", 1.0)), Err(Rejection::EmptyId));
        assert_eq!(validate_record(&character("/X", "", 1.0)), Err(Rejection::EmptyNameEn));
        assert_eq!(
            validate_record(&character("/X", "Foo", 0.0)),
            Err(Rejection::NonPositive {
                field: "health",
                value: 0.0
            })
        );
        assert_eq!(validate_record(&character("/X", "Foo", 1.0)), Ok(()));

        let mut weapon = MergedRecord::new(EntityKind::Weapon, "/W");
        weapon.set("name_en", Some(AttrValue::Text("Braton".into())));
        assert_eq!(validate_record(&weapon), Ok(()));
    }

    #[test]
    fn patch_gate_checks_only_present_values() {
        let mut patch = Attributes::new();
        assert_eq!(validate_patch(EntityKind::Character, &patch), Err(Rejection::EmptyPatch));
        patch.insert("name_en", None);
        assert_eq!(validate_patch(EntityKind::Character, &patch), Err(Rejection::EmptyPatch));

        patch.insert("name_zh", Some(AttrValue::Text("富".into())));
        assert_eq!(validate_patch(EntityKind::Character, &patch), Ok(()));

        patch.insert("name_en", Some(AttrValue::Text(String::new())));
        assert_eq!(validate_patch(EntityKind::Character, &patch), Err(Rejection::EmptyNameEn));
        patch.insert("name_en", Some(AttrValue::Text("Foo".into())));

        patch.insert("health", Some(AttrValue::Float(-5.0)));
        assert_eq!(
            validate_patch(EntityKind::Character, &patch),
            Err(Rejection::NonPositive {
                field: "health",
                value: -5.0
            })
        );
        patch.insert("health", Some(AttrValue::Float(100.0)));
        patch.insert("armor", Some(AttrValue::Float(-1.0)));
        assert_eq!(
            validate_patch(EntityKind::Character, &patch),
            Err(Rejection::Negative {
                field: "armor",
                value: -1.0
            })
        );

        let mut weapon = Attributes::new();
        weapon.insert("reload_time", Some(AttrValue::Float(0.0)));
        assert_eq!(validate_patch(EntityKind::Weapon, &weapon), Ok(()));
    }

    #[test]
    fn next_stamp_always_moves_forward() {
        let future = now_stamp() + chrono::Duration::seconds(60);
        assert_eq!(next_stamp(Some(future)), future + chrono::Duration::microseconds(1));
        let past = now_stamp() - chrono::Duration::seconds(60);
        assert!(next_stamp(Some(past)) > past);
        assert!(next_stamp(None) <= now_stamp());
    }

    #[test]
    fn registry_parses_yaml_and_defaults_enabled() {
        let registry = SourceRegistry::from_yaml(
            r#"
sources:
  - kind: warframes
    mode: fixture
    path: /warframes/
    fixture_dir: fixtures/warframes
    exclude_markers: [archwing, necramech]
  - kind: mods
    enabled: false
    mode: api
    path: /mods/
"#,
        )
        .unwrap();
        let frames = registry.source_for(EntityKind::Character).unwrap();
        assert!(frames.enabled);
        assert_eq!(frames.mode, SourceMode::Fixture);
        assert_eq!(frames.exclude_markers.len(), 2);
        assert!(!registry.source_for(EntityKind::Mod).unwrap().enabled);
        assert!(registry.source_for(EntityKind::Weapon).is_none());
    }

    #[test]
    fn builtin_registry_excludes_archwing_for_characters_only() {
        let registry = SourceRegistry::builtin();
        assert_eq!(
            registry.source_for(EntityKind::Character).unwrap().exclude_markers,
            vec!["archwing".to_string()]
        );
        assert!(registry.source_for(EntityKind::Weapon).unwrap().exclude_markers.is_empty());
        assert_eq!(registry.source_for(EntityKind::Mod).unwrap().path, "/mods/");
    }

    #[tokio::test]
    async fn end_to_end_merge_inserts_one_character() {
        let pipeline = pipeline().await;
        let report = pipeline
            .ingest_collections(
                EntityKind::Character,
                r#"[{"uniqueName":"/X","name":"Foo","health":100}]"#.as_bytes(),
                r#"[{"uniqueName":"/X","name":"富"}]"#.as_bytes(),
                &[],
            )
            .await;
        assert_eq!(report.inserted, 1);
        assert_eq!(report.error, None);

        let row = pipeline.store().get(EntityKind::Character, "/X").await.unwrap().unwrap();
        assert_eq!(row.value("name_en"), Some(&json!("Foo")));
        assert_eq!(row.value("name_zh"), Some(&json!("富")));
        assert_eq!(row.value("health"), Some(&json!(100.0)));
    }

    #[tokio::test]
    async fn rerunning_the_same_batch_only_advances_last_updated() {
        let pipeline = pipeline().await;
        let en = r#"[{"uniqueName":"/X","name":"Foo","health":100,"polarities":["madurai"]}]"#.as_bytes();
        let zh = r#"[{"uniqueName":"/X","name":"富"}]"#.as_bytes();

        pipeline.ingest_collections(EntityKind::Character, en, zh, &[]).await;
        let first = pipeline.store().get(EntityKind::Character, "/X").await.unwrap().unwrap();
        let report = pipeline.ingest_collections(EntityKind::Character, en, zh, &[]).await;
        let second = pipeline.store().get(EntityKind::Character, "/X").await.unwrap().unwrap();

        assert_eq!(report.updated, 1);
        assert!(second.last_updated > first.last_updated);
        let strip = |row: &StoredRow| {
            let mut values = row.values.clone();
            values.remove("last_updated");
            values
        };
        assert_eq!(strip(&first), strip(&second));
    }

    #[tokio::test]
    async fn partial_update_touches_only_present_fields() {
        let pipeline = pipeline().await;
        pipeline.engine().apply(&character("/X", "Foo", 100.0)).await.unwrap();
        let before = pipeline.store().get(EntityKind::Character, "/X").await.unwrap().unwrap();

        let mut partial = MergedRecord::new(EntityKind::Character, "/X");
        partial.set("name_zh", Some(AttrValue::Text("富".into())));
        partial.set("name_en", None);
        let outcome = pipeline.engine().apply(&partial).await.unwrap();
        let after = pipeline.store().get(EntityKind::Character, "/X").await.unwrap().unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(after.value("name_zh"), Some(&json!("富")));
        for (column, value) in &before.values {
            if column != "name_zh" && column != "last_updated" {
                assert_eq!(after.values.get(column), Some(value), "{column} changed");
            }
        }
        assert!(after.last_updated > before.last_updated);
    }

    #[tokio::test]
    async fn empty_english_names_are_never_persisted() {
        let pipeline = pipeline().await;
        let report = pipeline
            .ingest_collections(
                EntityKind::Mod,
                r#"[{"uniqueName":"/M","name":""}]"#.as_bytes(),
                r#"[{"uniqueName":"/M","name":"空"}]"#.as_bytes(),
                &[],
            )
            .await;
        assert_eq!(report.rejected, 1);
        assert!(pipeline.store().get(EntityKind::Mod, "/M").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn weapon_without_damage_types_persists_zeroed_damage() {
        let pipeline = pipeline().await;
        pipeline
            .ingest_collections(
                EntityKind::Weapon,
                r#"[{"uniqueName":"/W","name":"Glaive","damageTypes":"n/a"}]"#.as_bytes(),
                r#"[{"uniqueName":"/W","name":"战刃"}]"#.as_bytes(),
                &[],
            )
            .await;
        let row = pipeline.store().get(EntityKind::Weapon, "/W").await.unwrap().unwrap();
        assert_eq!(
            row.value("damage"),
            Some(&json!({"impact": 0.0, "puncture": 0.0, "slash": 0.0, "total": 0.0}))
        );
    }

    #[tokio::test]
    async fn undecodable_collection_fails_only_that_batch() {
        let pipeline = pipeline().await;
        let report = pipeline
            .ingest_collections(EntityKind::Weapon, b"<html>", b"[]", &[])
            .await;
        assert!(report.error.is_some());
        assert_eq!(report.written(), 0);
    }

    #[tokio::test]
    async fn patch_requires_an_existing_row() {
        let pipeline = pipeline().await;
        let mut attrs = Attributes::new();
        attrs.insert("name_alias", Some(AttrValue::Text("Excal".into())));
        let err = pipeline
            .engine()
            .patch(EntityKind::Character, "/missing", &attrs)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(pipeline.store().get(EntityKind::Character, "/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fixture_run_reports_per_kind_counts() {
        let pipeline = pipeline().await;
        let summary = pipeline.run_once(&EntityKind::ALL).await.unwrap();

        let frames = summary.batch(EntityKind::Character).unwrap();
        assert_eq!((frames.inserted, frames.rejected), (2, 1));
        let weapons = summary.batch(EntityKind::Weapon).unwrap();
        assert_eq!(weapons.inserted, 2);
        let mods = summary.batch(EntityKind::Mod).unwrap();
        assert_eq!((mods.inserted, mods.rejected), (2, 1));
        assert_eq!(summary.failed_batches(), 0);

        let stats = pipeline.store().stats().await.unwrap();
        assert_eq!(stats["warframes"].count, 2);
        assert!(pipeline
            .store()
            .get(EntityKind::Character, "/Lotus/Powersuits/Archwing/StandardJetPack/StandardJetPack")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn export_writes_json_csv_and_manifest() {
        let pipeline = pipeline().await;
        pipeline.run_once(&[EntityKind::Weapon]).await.unwrap();
        let dir = tempfile::tempdir().expect("tempdir");

        let manifest = pipeline.export(ExportFormat::All, Some(dir.path())).await.unwrap();
        assert_eq!(manifest.files.len(), 4);

        let json: JsonValue =
            serde_json::from_slice(&std::fs::read(dir.path().join(JSON_EXPORT_FILE)).unwrap()).unwrap();
        assert_eq!(json["weapons"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["mods"].as_array().map(Vec::len), Some(0));

        let csv_text = std::fs::read_to_string(dir.path().join("csv/weapons.csv")).unwrap();
        let mut lines = csv_text.lines();
        assert!(lines.next().unwrap().starts_with("id,name_en,name_zh,name_alias"));
        assert_eq!(lines.count(), 2);

        let on_disk: ExportManifest =
            serde_json::from_slice(&std::fs::read(dir.path().join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(on_disk.files.len(), 4);
        assert!(on_disk.files.iter().all(|f| f.sha256.len() == 64));
    }

    #[test]
    fn export_format_parses_case_insensitively() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    struct FailingUpdateStore {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    struct FailingUpdateTx {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl RecordStore for FailingUpdateStore {
        async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StoreError> {
            Ok(Box::new(FailingUpdateTx {
                events: Arc::clone(&self.events),
            }))
        }
    }

    #[async_trait]
    impl RecordTransaction for FailingUpdateTx {
        async fn find_by_id(&mut self, kind: EntityKind, id: &str) -> Result<Option<StoredRow>, StoreError> {
            Ok(Some(StoredRow {
                kind,
                id: id.to_string(),
                last_updated: Some(now_stamp()),
                values: Default::default(),
            }))
        }

        async fn insert(
            &mut self,
            _kind: EntityKind,
            _id: &str,
            _attributes: &Attributes,
            _stamp: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.events.lock().unwrap().push("insert");
            Ok(())
        }

        async fn update(
            &mut self,
            _kind: EntityKind,
            _id: &str,
            _attributes: &Attributes,
            _stamp: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Message("disk full".into()))
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.events.lock().unwrap().push("commit");
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.events.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_counts_as_failed() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = ReconcileEngine::new(Arc::new(FailingUpdateStore {
            events: Arc::clone(&events),
        }));

        let report = ingest_records(
            &engine,
            EntityKind::Character,
            vec![character("/X", "Foo", 100.0), character("/Y", "Bar", 50.0)],
        )
        .await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.written(), 0);
        assert_eq!(*events.lock().unwrap(), vec!["rollback", "rollback"]);
    }
}
