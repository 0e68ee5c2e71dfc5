//! Record persistence, HTTP fetch and export file utilities for wfwiki.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use wfwiki_core::{
    format_timestamp, parse_timestamp, AttrValue, Attributes, ColumnType, EntityKind, RecordRow,
    ID_COLUMN, LAST_UPDATED_COLUMN,
};

pub const CRATE_NAME: &str = "wfwiki-storage";

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("column `{column}` is not writable on {kind}")]
    UnknownColumn { kind: EntityKind, column: String },
    #[error("{kind} row `{id}` not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("{0}")]
    Message(String),
}

/// A persisted row, decoded to structured JSON with nested columns expanded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub kind: EntityKind,
    pub id: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub values: RecordRow,
}

impl StoredRow {
    pub fn value(&self, column: &str) -> Option<&JsonValue> {
        self.values.get(column)
    }
}

/// One transactional unit of work against the per-kind tables.
#[async_trait]
pub trait RecordTransaction: Send {
    async fn find_by_id(&mut self, kind: EntityKind, id: &str) -> Result<Option<StoredRow>, StoreError>;

    /// Insert a full row. Null attributes are written as SQL NULL.
    async fn insert(
        &mut self,
        kind: EntityKind,
        id: &str,
        attributes: &Attributes,
        stamp: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Overwrite only the non-null attributes and set `last_updated`. Returns rows affected.
    async fn update(
        &mut self,
        kind: EntityKind,
        id: &str,
        attributes: &Attributes,
        stamp: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PageQuery {
    pub page: u32,
    pub per_page: u32,
    pub search: Option<String>,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 10,
            search: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub rows: Vec<StoredRow>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStats {
    pub count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

const MAX_PER_PAGE: u32 = 500;

#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        info!("connected to record store");
        Ok(Self { pool })
    }

    /// Single-connection in-memory database with the schema already created.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for kind in EntityKind::ALL {
            sqlx::query(&create_table_sql(kind)).execute(&self.pool).await?;
            debug!(table = kind.table_name(), "ensured table");
        }
        Ok(())
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<StoredRow>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", kind.table_name());
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| decode_row(kind, &r)).transpose()
    }

    pub async fn list_page(&self, kind: EntityKind, query: &PageQuery) -> Result<Page, StoreError> {
        let page = query.page.max(1);
        let per_page = query.per_page.clamp(1, MAX_PER_PAGE);
        let pattern = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));

        let mut count_qb = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {}", kind.table_name()));
        push_name_filter(&mut count_qb, pattern.as_deref());
        let total: i64 = count_qb.build().fetch_one(&self.pool).await?.try_get(0)?;

        let mut rows_qb = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {}", kind.table_name()));
        push_name_filter(&mut rows_qb, pattern.as_deref());
        rows_qb.push(" ORDER BY id LIMIT ");
        rows_qb.push_bind(i64::from(per_page));
        rows_qb.push(" OFFSET ");
        rows_qb.push_bind(i64::from(page - 1) * i64::from(per_page));
        let rows = rows_qb
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| decode_row(kind, r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            rows,
            total: total.max(0) as u64,
            page,
            per_page,
        })
    }

    pub async fn all_rows(&self, kind: EntityKind) -> Result<Vec<StoredRow>, StoreError> {
        let sql = format!("SELECT * FROM {} ORDER BY id", kind.table_name());
        sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| decode_row(kind, r))
            .collect()
    }

    /// Row count and newest `last_updated` per table, keyed by table name.
    pub async fn stats(&self) -> Result<BTreeMap<String, TableStats>, StoreError> {
        let mut out = BTreeMap::new();
        for kind in EntityKind::ALL {
            let sql = format!(
                "SELECT COUNT(*) AS count, MAX(last_updated) AS last_updated FROM {}",
                kind.table_name()
            );
            let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
            let count: i64 = row.try_get("count")?;
            let last_updated: Option<String> = row.try_get("last_updated")?;
            out.insert(
                kind.table_name().to_string(),
                TableStats {
                    count: count.max(0) as u64,
                    last_updated: last_updated.as_deref().and_then(parse_timestamp),
                },
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl RecordTransaction for SqliteTransaction {
    async fn find_by_id(&mut self, kind: EntityKind, id: &str) -> Result<Option<StoredRow>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", kind.table_name());
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await?;
        row.map(|r| decode_row(kind, &r)).transpose()
    }

    async fn insert(
        &mut self,
        kind: EntityKind,
        id: &str,
        attributes: &Attributes,
        stamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        ensure_writable(kind, attributes)?;
        let columns = kind.data_columns().collect::<Vec<_>>();

        let mut qb = QueryBuilder::<Sqlite>::new(format!("INSERT INTO {} (", kind.table_name()));
        qb.push(quoted(ID_COLUMN));
        for column in &columns {
            qb.push(", ");
            qb.push(quoted(column.name));
        }
        qb.push(", ");
        qb.push(quoted(LAST_UPDATED_COLUMN));
        qb.push(") VALUES (");
        qb.push_bind(id.to_string());
        for column in &columns {
            qb.push(", ");
            push_attr(&mut qb, attributes.get(column.name).and_then(Option::as_ref));
        }
        qb.push(", ");
        qb.push_bind(format_timestamp(stamp));
        qb.push(")");

        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: &str,
        attributes: &Attributes,
        stamp: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        ensure_writable(kind, attributes)?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", kind.table_name()));
        for (column, value) in attributes.iter().filter_map(|(k, v)| v.as_ref().map(|v| (*k, v))) {
            qb.push(quoted(column));
            qb.push(" = ");
            push_attr(&mut qb, Some(value));
            qb.push(", ");
        }
        qb.push(quoted(LAST_UPDATED_COLUMN));
        qb.push(" = ");
        qb.push_bind(format_timestamp(stamp));
        qb.push(" WHERE id = ");
        qb.push_bind(id.to_string());

        let result = qb.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn quoted(column: &str) -> String {
    format!("\"{column}\"")
}

fn create_table_sql(kind: EntityKind) -> String {
    let columns = kind
        .columns()
        .map(|c| {
            if c.name == ID_COLUMN {
                format!("{} TEXT PRIMARY KEY NOT NULL", quoted(c.name))
            } else {
                format!("{} {}", quoted(c.name), c.ty.sql_type())
            }
        })
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        kind.table_name(),
        columns
    )
}

fn ensure_writable(kind: EntityKind, attributes: &Attributes) -> Result<(), StoreError> {
    match attributes.keys().find(|name| kind.data_column(name).is_none()) {
        Some(column) => Err(StoreError::UnknownColumn {
            kind,
            column: column.to_string(),
        }),
        None => Ok(()),
    }
}

fn push_attr(qb: &mut QueryBuilder<'_, Sqlite>, value: Option<&AttrValue>) {
    match value {
        Some(AttrValue::Text(s)) => qb.push_bind(s.clone()),
        Some(AttrValue::Float(f)) => qb.push_bind(*f),
        Some(AttrValue::Int(i)) => qb.push_bind(*i),
        Some(AttrValue::Bool(b)) => qb.push_bind(*b),
        Some(AttrValue::Json(v)) => qb.push_bind(v.to_string()),
        None => qb.push_bind(Option::<String>::None),
    };
}

fn push_name_filter(qb: &mut QueryBuilder<'_, Sqlite>, pattern: Option<&str>) {
    if let Some(pattern) = pattern {
        qb.push(" WHERE name_en LIKE ");
        qb.push_bind(pattern.to_string());
        qb.push(" ESCAPE '\\'");
    }
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn decode_row(kind: EntityKind, row: &SqliteRow) -> Result<StoredRow, StoreError> {
    let mut values = RecordRow::new();
    let mut last_updated = None;
    for column in kind.columns() {
        let name = column.name;
        let value = match column.ty {
            ColumnType::Text => row.try_get::<Option<String>, _>(name)?.map(JsonValue::String),
            ColumnType::Float => row
                .try_get::<Option<f64>, _>(name)?
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number),
            ColumnType::Integer => row.try_get::<Option<i64>, _>(name)?.map(JsonValue::from),
            ColumnType::Boolean => row.try_get::<Option<bool>, _>(name)?.map(JsonValue::Bool),
            ColumnType::Json => row
                .try_get::<Option<String>, _>(name)?
                .map(|text| match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(_) => JsonValue::String(text),
                }),
            ColumnType::Timestamp => {
                let text = row.try_get::<Option<String>, _>(name)?;
                if name == LAST_UPDATED_COLUMN {
                    last_updated = text.as_deref().and_then(parse_timestamp);
                }
                text.map(JsonValue::String)
            }
        };
        values.insert(name.to_string(), value.unwrap_or(JsonValue::Null));
    }
    let id = values
        .get(ID_COLUMN)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(StoredRow {
        kind,
        id,
        last_updated,
        values,
    })
}

// ---------------------------------------------------------------------------
// Export files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct ExportWriter {
    root: PathBuf,
}

impl ExportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Replace `relative_path` under the export root atomically via temp-file rename.
    pub async fn write_file(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<WrittenFile> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .with_context(|| format!("export path {} has no parent", absolute_path.display()))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating export directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp export file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp export {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(WrittenFile {
            sha256: Self::sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch
// ---------------------------------------------------------------------------

/// Statuses worth another attempt against the upstream API.
pub const RETRYABLE_STATUSES: [u16; 8] = [408, 429, 500, 502, 503, 504, 522, 524];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if RETRYABLE_STATUSES.contains(&status.as_u16()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    match err {
        e if e.is_builder() || e.is_redirect() => RetryDisposition::NonRetryable,
        // Truncated bodies on the large collections surface as body errors.
        e if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Seconds form of `Retry-After`; the HTTP-date form is ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^retry`, raised to the server's `Retry-After` hint, never past `max_delay`.
    pub fn delay_before_retry(&self, retry: usize, server_hint: Option<Duration>) -> Duration {
        let exponential = 2u32
            .checked_pow(retry as u32)
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor));
        exponential.max(server_hint.unwrap_or_default()).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between the starts of two requests.
    pub request_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 1,
            backoff: BackoffPolicy::default(),
            request_interval: None,
        }
    }
}

/// Spaces request starts at least `interval` apart. The first request goes out immediately.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserve the next slot and sleep until it opens.
    pub async fn wait_turn(&self) {
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot.map_or(now, |next| next.max(now));
            *next_slot = Some(slot + self.interval);
            slot
        };
        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "pacing request");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacer = config
            .request_interval
            .filter(|interval| !interval.is_zero())
            .map(RequestPacer::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            pacer,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let mut attempt = 0usize;

        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(bytes = body.len(), attempt, "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_before_retry(attempt, retry_after(resp.headers()));
                        warn!(status = status.as_u16(), attempt, delay_ms = delay.as_millis() as u64, "retryable http status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_before_retry(attempt, None)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wfwiki_core::now_stamp;

    fn character_attrs(name_en: &str, health: f64) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name_en", Some(AttrValue::Text(name_en.to_string())));
        attrs.insert("name_zh", Some(AttrValue::Text("圣剑".to_string())));
        attrs.insert("name_alias", None);
        attrs.insert("health", Some(AttrValue::Float(health)));
        attrs.insert("mastery_rank", Some(AttrValue::Int(0)));
        attrs.insert(
            "polarities",
            Some(AttrValue::Json(json!(["madurai", "vazarin"]))),
        );
        attrs
    }

    #[tokio::test]
    async fn insert_then_find_decodes_nested_columns() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert(
            EntityKind::Character,
            "/Lotus/Powersuits/Excalibur/Excalibur",
            &character_attrs("Excalibur", 270.0),
            now_stamp(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let row = store
            .get(EntityKind::Character, "/Lotus/Powersuits/Excalibur/Excalibur")
            .await
            .unwrap()
            .expect("row exists");
        assert_eq!(row.value("name_en"), Some(&json!("Excalibur")));
        assert_eq!(row.value("health"), Some(&json!(270.0)));
        assert_eq!(row.value("polarities"), Some(&json!(["madurai", "vazarin"])));
        assert_eq!(row.value("name_alias"), Some(&JsonValue::Null));
        assert!(row.last_updated.is_some());
    }

    #[tokio::test]
    async fn update_writes_only_present_fields() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert(EntityKind::Character, "/X", &character_attrs("Foo", 100.0), now_stamp())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut partial = Attributes::new();
        partial.insert("name_zh", Some(AttrValue::Text("富".into())));
        partial.insert("name_en", None);
        let mut tx = store.begin().await.unwrap();
        let affected = tx
            .update(EntityKind::Character, "/X", &partial, now_stamp())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(affected, 1);

        let row = store.get(EntityKind::Character, "/X").await.unwrap().unwrap();
        assert_eq!(row.value("name_zh"), Some(&json!("富")));
        assert_eq!(row.value("name_en"), Some(&json!("Foo")));
    }

    #[tokio::test]
    async fn rollback_discards_insert() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert(EntityKind::Character, "/X", &character_attrs("Foo", 100.0), now_stamp())
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert!(store.get(EntityKind::Character, "/X").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_columns_are_refused() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("health", Some(AttrValue::Float(1.0)));
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert(EntityKind::Weapon, "/W", &attrs, now_stamp())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { .. }));
    }

    #[tokio::test]
    async fn list_page_filters_by_english_name_case_insensitively() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        for (id, name) in [("/A", "Excalibur"), ("/B", "Excalibur Prime"), ("/C", "Mag")] {
            tx.insert(EntityKind::Character, id, &character_attrs(name, 100.0), now_stamp())
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let page = store
            .list_page(
                EntityKind::Character,
                &PageQuery {
                    page: 1,
                    per_page: 1,
                    search: Some("excal".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].id, "/A");

        let second = store
            .list_page(
                EntityKind::Character,
                &PageQuery {
                    page: 2,
                    per_page: 1,
                    search: Some("excal".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(second.rows[0].id, "/B");

        let literal = store
            .list_page(
                EntityKind::Character,
                &PageQuery {
                    search: Some("%".into()),
                    ..PageQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(literal.total, 0);
    }

    #[tokio::test]
    async fn stats_report_counts_per_table() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let stamp = now_stamp();
        let mut tx = store.begin().await.unwrap();
        tx.insert(EntityKind::Character, "/X", &character_attrs("Foo", 100.0), stamp)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats["warframes"].count, 1);
        assert_eq!(stats["warframes"].last_updated, Some(stamp));
        assert_eq!(stats["weapons"].count, 0);
        assert_eq!(stats["mods"].last_updated, None);
    }

    #[test]
    fn export_hashing_is_stable() {
        let hash = ExportWriter::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn export_writes_replace_previous_content() {
        let dir = tempdir().expect("tempdir");
        let writer = ExportWriter::new(dir.path());

        let first = writer.write_file("csv/mods.csv", b"id\n/A\n").await.expect("first write");
        let second = writer
            .write_file("csv/mods.csv", b"id\n/A\n/B\n")
            .await
            .expect("second write");

        assert_eq!(first.absolute_path, second.absolute_path);
        assert_ne!(first.sha256, second.sha256);
        let on_disk = std::fs::read(&second.absolute_path).unwrap();
        assert_eq!(on_disk, b"id\n/A\n/B\n");
        let leftovers = std::fs::read_dir(dir.path().join("csv"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_doubles_and_honours_retry_after_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_before_retry(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay_before_retry(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay_before_retry(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay_before_retry(40, None), Duration::from_millis(350));
        assert_eq!(
            policy.delay_before_retry(0, Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
        assert_eq!(
            policy.delay_before_retry(0, Some(Duration::from_secs(60))),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn retry_after_reads_delay_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test]
    async fn pacer_spaces_request_starts_by_the_interval() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let started = Instant::now();
        pacer.wait_turn().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn upstream_throttle_and_gateway_statuses_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::from_u16(524).unwrap()),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_IMPLEMENTED), RetryDisposition::NonRetryable);
    }
}
