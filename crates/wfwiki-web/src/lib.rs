//! Axum JSON API over the record store, plus the on-demand crawl trigger.

use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use wfwiki_core::{AttrValue, Attributes, EntityKind, ID_COLUMN, LAST_UPDATED_COLUMN};
use wfwiki_storage::{PageQuery, SqliteRecordStore, StoreError};
use wfwiki_sync::{maybe_build_scheduler, validate_patch, SyncConfig, SyncPipeline, SyncRunSummary};

pub const CRATE_NAME: &str = "wfwiki-web";

// ---------------------------------------------------------------------------
// Crawl state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    Idle,
    Running,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlStatus {
    pub is_running: bool,
    pub state: CrawlState,
    pub message: String,
    pub last_run: Option<DateTime<Utc>>,
    pub current_type: Option<String>,
}

impl Default for CrawlStatus {
    fn default() -> Self {
        Self {
            is_running: false,
            state: CrawlState::Idle,
            message: String::new(),
            last_run: None,
            current_type: None,
        }
    }
}

/// Idle -> Running -> Idle | Failed. Only one crawl runs at a time.
#[derive(Debug, Clone, Default)]
pub struct CrawlTracker {
    inner: Arc<Mutex<CrawlStatus>>,
}

impl CrawlTracker {
    pub fn snapshot(&self) -> CrawlStatus {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move to Running, or hand back the current status when a crawl is in flight.
    pub fn try_start(&self, label: &str) -> Result<(), CrawlStatus> {
        let mut status = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if status.state == CrawlState::Running {
            return Err(status.clone());
        }
        status.state = CrawlState::Running;
        status.is_running = true;
        status.current_type = Some(label.to_string());
        status.last_run = Some(Utc::now());
        status.message = format!("crawling {label}");
        Ok(())
    }

    pub fn finish(&self, outcome: Result<&SyncRunSummary, String>) {
        let mut status = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        status.is_running = false;
        status.last_run = Some(Utc::now());
        match outcome {
            Ok(summary) if summary.failed_batches() == 0 => {
                let written = summary.batches.iter().map(|b| b.written()).sum::<usize>();
                status.state = CrawlState::Idle;
                status.message = format!("crawl finished: {written} records written");
            }
            Ok(summary) => {
                let failed = summary
                    .batches
                    .iter()
                    .filter_map(|b| b.error.as_deref())
                    .collect::<Vec<_>>()
                    .join("; ");
                status.state = CrawlState::Failed;
                status.message = format!("crawl finished with failed batches: {failed}");
            }
            Err(err) => {
                status.state = CrawlState::Failed;
                status.message = format!("crawl failed: {err}");
            }
        }
        status.current_type = None;
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteRecordStore,
    pub pipeline: Arc<SyncPipeline>,
    pub crawl: CrawlTracker,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            store: pipeline.store().clone(),
            pipeline,
            crawl: CrawlTracker::default(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/crawler/status", get(crawl_status_handler))
        .route("/api/crawler/start", post(crawl_start_handler))
        .route("/api/{kind}", get(list_handler))
        .route("/api/{kind}/{*id}", put(update_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let addr = format!("{}:{}", config.web_host, config.web_port);
    let pipeline = Arc::new(SyncPipeline::from_config(config).await?);

    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!("sync scheduler started");
    }

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "serving api");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn parse_kind(raw: &str) -> Result<EntityKind, Response> {
    raw.parse::<EntityKind>()
        .map_err(|err| api_error(StatusCode::NOT_FOUND, err.to_string()))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(json!({ "success": true, "data": stats })).into_response(),
        Err(err) => server_error(err),
    }
}

/// Raw listing parameters; malformed numbers fall back to the defaults.
#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    page: Option<String>,
    per_page: Option<String>,
    search: Option<String>,
}

fn lenient_u32(raw: Option<&str>, default: u32) -> u32 {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let defaults = PageQuery::default();
    let page_query = PageQuery {
        page: lenient_u32(query.page.as_deref(), defaults.page),
        per_page: lenient_u32(query.per_page.as_deref(), defaults.per_page),
        search: query.search,
    };

    match state.store.list_page(kind, &page_query).await {
        Ok(page) => {
            let pages = page.total.div_ceil(u64::from(page.per_page));
            let rows = page.rows.into_iter().map(|r| r.values).collect::<Vec<_>>();
            Json(json!({
                "success": true,
                "data": rows,
                "total": page.total,
                "pages": pages,
                "page": page.page,
                "per_page": page.per_page,
            }))
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

/// Convert a client patch into column attributes. Unknown keys are ignored; nulls are skipped.
fn patch_attributes(kind: EntityKind, body: &serde_json::Map<String, JsonValue>) -> Result<Attributes, String> {
    let mut attributes = Attributes::new();
    for (key, value) in body {
        if key == ID_COLUMN || key == LAST_UPDATED_COLUMN {
            continue;
        }
        let Some(column) = kind.data_column(key) else {
            debug!(%kind, key = %key, "ignoring unknown field in update");
            continue;
        };
        let value = AttrValue::from_json(column, value).map_err(|e| e.to_string())?;
        attributes.insert(column.name, value);
    }
    Ok(attributes)
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let id = if id.starts_with('/') { id } else { format!("/{id}") };

    let patch = match serde_json::from_slice::<JsonValue>(&body) {
        Ok(JsonValue::Object(map)) => map,
        Ok(_) => return api_error(StatusCode::BAD_REQUEST, "request body must be a JSON object"),
        Err(err) => return api_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}")),
    };
    let attributes = match patch_attributes(kind, &patch) {
        Ok(attributes) => attributes,
        Err(message) => return api_error(StatusCode::BAD_REQUEST, message),
    };
    if let Err(rejection) = validate_patch(kind, &attributes) {
        return api_error(StatusCode::BAD_REQUEST, rejection.to_string());
    }

    match state.pipeline.engine().patch(kind, &id, &attributes).await {
        Ok(()) => {}
        Err(err @ StoreError::NotFound { .. }) => return api_error(StatusCode::NOT_FOUND, err.to_string()),
        Err(err) => return server_error(err),
    }
    info!(%kind, id = %id, fields = attributes.len(), "record updated via api");

    match state.store.get(kind, &id).await {
        Ok(Some(row)) => Json(json!({ "success": true, "data": row.values })).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("{kind} row `{id}` not found")),
        Err(err) => server_error(err),
    }
}

async fn crawl_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.crawl.snapshot()).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct CrawlStartRequest {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn crawl_start_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CrawlStartRequest::default()
    } else {
        match serde_json::from_slice::<CrawlStartRequest>(&body) {
            Ok(request) => request,
            Err(err) => return api_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}")),
        }
    };

    let kinds = match request.kind.as_deref().map(str::trim) {
        None | Some("") | Some("all") => EntityKind::ALL.to_vec(),
        Some(raw) => match raw.parse::<EntityKind>() {
            Ok(kind) => vec![kind],
            Err(err) => return api_error(StatusCode::BAD_REQUEST, err.to_string()),
        },
    };
    let label = if kinds.len() == 1 {
        kinds[0].table_name().to_string()
    } else {
        "all".to_string()
    };

    if let Err(current) = state.crawl.try_start(&label) {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "message": "a crawl is already running",
                "current_type": current.current_type,
            })),
        )
            .into_response();
    }

    let pipeline = Arc::clone(&state.pipeline);
    let tracker = state.crawl.clone();
    tokio::spawn(async move {
        match pipeline.run_once(&kinds).await {
            Ok(summary) => tracker.finish(Ok(&summary)),
            Err(err) => {
                error!(error = %err, "crawl failed");
                tracker.finish(Err(err.to_string()));
            }
        }
    });

    Json(json!({ "success": true, "message": format!("crawl started: {label}"), "type": label }))
        .into_response()
}
