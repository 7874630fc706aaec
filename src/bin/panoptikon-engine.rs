//! Thin CLI/HTTP entry point: builds an `EngineConfig` from the environment
//! (with CLI overrides), opens the store once to guarantee the schema
//! exists, starts the extraction job consumer, and serves the HTTP surface
//! named in the external interface contract. Handlers are thin wrappers that
//! delegate entirely into the library crate.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use panoptikon_engine::config::{EngineConfig, EngineConfigBuilder};
use panoptikon_engine::error::EngineError;
use panoptikon_engine::extraction::{run_extraction_job, CandidateInput, InputMaterializer, ProgressEvent};
use panoptikon_engine::inference::{HttpInferenceClient, InferenceClient};
use panoptikon_engine::jobs::{CancellationToken, Job, JobKind, JobManager, QueueStatusEntry};
use panoptikon_engine::observability;
use panoptikon_engine::pql::ast::{
    DistanceAggregation, DistanceFunction, FilterTree, LeafFilter, OrderArgs, OrderDirection,
    SearchQuery, SimilarTo,
};
use panoptikon_engine::registry::Registry;
use panoptikon_engine::search;
use panoptikon_engine::store::StoreHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// The severity order used to pick one winning "rating" tag per item when
/// multiple mutually exclusive rating tags are proposed, matching the
/// booru-style namespace (`rating:general` < `rating:sensitive` <
/// `rating:questionable` < `rating:explicit`) the extractor pack assumes.
const DEFAULT_RATING_SEVERITY_ORDER: &[&str] =
    &["general", "sensitive", "questionable", "explicit"];

#[derive(Parser, Debug)]
#[command(name = "panoptikon-engine", about = "Local media-indexing and retrieval engine")]
struct Cli {
    /// Root folder the indexer scans files under.
    #[arg(long, env = "DATA_FOLDER")]
    data_folder: Option<String>,

    /// Base URL of the external inference service.
    #[arg(long, env = "INFERENCE_API_URL")]
    inference_api_url: Option<String>,

    /// HTTP bind host.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// HTTP bind port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Open the store read-only; disables the job consumer.
    #[arg(long, env = "READONLY")]
    readonly: bool,

    #[arg(long)]
    verbose: bool,

    #[arg(long)]
    quiet: bool,
}

#[derive(Clone)]
struct AppState {
    config: EngineConfig,
    jobs: Arc<JobManager>,
    registry: Arc<Registry>,
    inference_client: Arc<dyn InferenceClient>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init_logging_with_level(cli.verbose, cli.quiet)?;

    let mut builder = EngineConfigBuilder::new();
    if let Some(v) = cli.data_folder {
        builder = builder.data_folder(v);
    }
    if let Some(v) = cli.inference_api_url {
        builder = builder.inference_api_url(v);
    }
    if let Some(v) = cli.host {
        builder = builder.host(v);
    }
    if let Some(v) = cli.port {
        builder = builder.port(v);
    }
    builder = builder.readonly(cli.readonly);
    let config = builder.build()?;

    // Open once up front so schema creation failures surface immediately
    // rather than on the first request.
    {
        let _warm = if config.readonly {
            StoreHandle::open_readonly(&config)
        } else {
            StoreHandle::open_write_lock(&config, true)
        }?;
    }

    let inference_client: Arc<dyn InferenceClient> =
        Arc::new(HttpInferenceClient::new(config.inference_api_url.clone())?);
    let registry = Arc::new(Registry::new());
    if let Ok(store) = StoreHandle::open_readonly(&config) {
        if let Err(e) = registry.refresh(inference_client.as_ref(), &store).await {
            warn!(error = %e, "initial registry refresh failed; starting with an empty registry");
        }
    }

    let jobs = JobManager::new();
    let state = AppState {
        config: config.clone(),
        jobs: jobs.clone(),
        registry: registry.clone(),
        inference_client: inference_client.clone(),
    };

    if !config.readonly {
        tokio::spawn(run_job_consumer(state.clone()));
    }

    let app = Router::new()
        .route("/api/search", post(search_handler))
        .route("/api/search/stats", get(stats_handler))
        .route("/api/search/tags", get(tag_autocomplete_handler))
        .route("/api/search/tags/top", get(top_tags_handler))
        .route(
            "/api/search/similar/{sha256}/{setter_name}",
            get(similar_handler),
        )
        .route("/api/jobs/enqueue", post(enqueue_handler))
        .route("/api/jobs/queue", get(queue_handler))
        .route("/api/jobs/{id}", delete(cancel_queued_handler))
        .route("/api/jobs/running", delete(cancel_running_handler))
        .route("/api/open/file/{sha256}", get(open_file_handler))
        .route("/api/open/folder/{sha256}", get(open_folder_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!(%addr, "panoptikon-engine listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Drives [`JobManager::run_consumer`] for the lifetime of the process,
/// dispatching each popped job by kind.
async fn run_job_consumer(state: AppState) {
    state
        .clone()
        .jobs
        .run_consumer(move |job, token| {
            let state = state.clone();
            async move { execute_job(&state, job, token).await }
        })
        .await;
}

async fn execute_job(state: &AppState, job: Job, token: CancellationToken) -> anyhow::Result<()> {
    match job.kind {
        JobKind::DataExtraction => {
            let setter_name = job
                .metadata
                .get("setter_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("job metadata missing 'setter_name'"))?
                .to_string();
            let descriptor = state
                .registry
                .get(&setter_name)
                .ok_or_else(|| anyhow::anyhow!("no registered extractor named '{setter_name}'"))?;

            let mut store = StoreHandle::open_write_lock(&state.config, false)?;
            let materializer = FilesystemMaterializer;
            let severity_order: Vec<String> = DEFAULT_RATING_SEVERITY_ORDER
                .iter()
                .map(|s| s.to_string())
                .collect();
            let job_id = run_extraction_job(
                &mut store,
                &descriptor,
                state.inference_client.as_ref(),
                &materializer,
                &severity_order,
                &token,
                |ev: ProgressEvent| {
                    info!(processed = ev.processed, total = ev.total, "extraction progress");
                },
            )
            .await?;
            info!(job_id, setter_name, "extraction job finished");
            Ok(())
        }
        JobKind::DataDeletion | JobKind::FolderRescan | JobKind::FolderUpdate => {
            // Accepted into the queue uniformly, but filesystem rescanning and
            // cascade deletion are driven by the indexer, not this binary.
            warn!(kind = ?job.kind, "job kind has no handler in this binary, skipping");
            Ok(())
        }
    }
}

/// Reads candidate bytes straight off disk via the file manifestation
/// recorded for the item, per C5's "materialize inputs via the handler the
/// registry's input_spec names" contract.
struct FilesystemMaterializer;

impl InputMaterializer for FilesystemMaterializer {
    fn materialize(
        &self,
        store: &StoreHandle,
        item_id: i64,
    ) -> panoptikon_engine::error::EngineResult<CandidateInput> {
        let path: String = store
            .connection()
            .query_row(
                "SELECT path FROM index.files WHERE item_id = ?1 LIMIT 1",
                rusqlite::params![item_id],
                |row| row.get(0),
            )
            .map_err(EngineError::Store)?;
        let bytes = std::fs::read(&path).map_err(|e| EngineError::Fatal(e.into()))?;
        Ok(CandidateInput {
            item_id,
            path,
            input: panoptikon_engine::inference::PredictInput::Bytes(bytes),
        })
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

fn blocking_store<T: Send + 'static>(
    config: EngineConfig,
    body: impl FnOnce(&StoreHandle) -> Result<T, EngineError> + Send + 'static,
) -> tokio::task::JoinHandle<Result<T, EngineError>> {
    tokio::task::spawn_blocking(move || {
        let store = StoreHandle::open_readonly(&config).map_err(EngineError::Fatal)?;
        body(&store)
    })
}

async fn search_handler(
    State(state): State<AppState>,
    Json(query): Json<SearchQuery>,
) -> Result<Json<search::SearchResults>, ApiError> {
    let result = blocking_store(state.config, move |store| search::search(store, &query))
        .await
        .map_err(|e| EngineError::Fatal(e.into()))??;
    Ok(Json(result))
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<search::SearchStats>, ApiError> {
    let result = blocking_store(state.config, |store| search::search_stats(store))
        .await
        .map_err(|e| EngineError::Fatal(e.into()))??;
    Ok(Json(result))
}

async fn tag_autocomplete_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<String>>, ApiError> {
    let name = params.get("name").cloned().unwrap_or_default();
    let limit: i64 = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(20);
    let result = blocking_store(state.config, move |store| {
        search::tag_autocomplete(store, &name, limit)
    })
    .await
    .map_err(|e| EngineError::Fatal(e.into()))??;
    Ok(Json(result))
}

async fn top_tags_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<(String, i64)>>, ApiError> {
    let namespace = params.get("namespace").cloned();
    let setters: Option<Vec<String>> = params
        .get("setters")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect());
    let confidence_threshold = params.get("confidence_threshold").and_then(|v| v.parse().ok());
    let limit: i64 = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);
    let result = blocking_store(state.config, move |store| {
        search::top_tags(
            store,
            namespace.as_deref(),
            setters.as_deref(),
            confidence_threshold,
            limit,
        )
    })
    .await
    .map_err(|e| EngineError::Fatal(e.into()))??;
    Ok(Json(result))
}

/// `GET /api/search/similar/{sha256}/{setter_name}`: a convenience endpoint
/// that builds a one-leaf [`SearchQuery`] around [`SimilarTo`] and runs it
/// through the same compiler path as `POST /api/search`.
async fn similar_handler(
    State(state): State<AppState>,
    AxumPath((sha256, setter_name)): AxumPath<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<search::SearchResults>, ApiError> {
    let distance_function = match params.get("distance_function").map(String::as_str) {
        Some("cosine") | Some("COSINE") => DistanceFunction::Cosine,
        _ => DistanceFunction::L2,
    };
    let distance_aggregation = match params.get("distance_aggregation").map(String::as_str) {
        Some("min") => DistanceAggregation::Min,
        Some("max") => DistanceAggregation::Max,
        _ => DistanceAggregation::Avg,
    };
    let bool_param = |key: &str, default: bool| {
        params
            .get(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(default)
    };
    let similar = SimilarTo {
        target_sha256: sha256,
        setter_name,
        src_text: None,
        distance_function,
        distance_aggregation,
        clip_xmodal: bool_param("clip_xmodal", false),
        xmodal_t2t: bool_param("xmodal_t2t", true),
        xmodal_i2i: bool_param("xmodal_i2i", false),
    };
    let page: u32 = params.get("page").and_then(|v| v.parse().ok()).unwrap_or(0);
    let page_size: u32 = params
        .get("page_size")
        .and_then(|v| v.parse().ok())
        .unwrap_or(state.config.default_page_size);

    let query = SearchQuery {
        query: FilterTree::Leaf(LeafFilter::SimilarTo { priority: 0, similar }),
        order_args: vec![OrderArgs {
            order_by: "order_rank".into(),
            order: OrderDirection::Default,
            priority: 0,
        }],
        count: false,
        page,
        page_size,
    };

    let result = blocking_store(state.config, move |store| search::search(store, &query))
        .await
        .map_err(|e| EngineError::Fatal(e.into()))??;
    Ok(Json(result))
}

#[derive(serde::Deserialize)]
struct EnqueueRequest {
    kind: JobKind,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Serialize)]
struct EnqueueResponse {
    queue_id: i64,
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Json<EnqueueResponse> {
    let queue_id = state.jobs.enqueue(req.kind, req.metadata);
    Json(EnqueueResponse { queue_id })
}

async fn queue_handler(State(state): State<AppState>) -> Json<Vec<QueueStatusEntry>> {
    Json(state.jobs.queue_status())
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: usize,
}

async fn cancel_queued_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> Json<CancelResponse> {
    let cancelled = state.jobs.cancel_queued(&[id]);
    Json(CancelResponse { cancelled })
}

#[derive(Serialize)]
struct CancelRunningResponse {
    queue_id: Option<i64>,
}

async fn cancel_running_handler(State(state): State<AppState>) -> Json<CancelRunningResponse> {
    Json(CancelRunningResponse {
        queue_id: state.jobs.cancel_running(),
    })
}

#[derive(Serialize)]
struct OpenResponse {
    path: String,
}

/// Resolves `sha256` to its first known file path via a read-only handle and
/// hands off to the host OS's file opener. The server never accepts a path
/// from the client directly — only a content hash it looks up itself.
async fn open_file_handler(
    State(state): State<AppState>,
    AxumPath(sha256): AxumPath<String>,
) -> Result<Json<OpenResponse>, ApiError> {
    let path = blocking_store(state.config, move |store| resolve_path(store, &sha256))
        .await
        .map_err(|e| EngineError::Fatal(e.into()))??;
    spawn_os_opener(&path);
    Ok(Json(OpenResponse { path }))
}

async fn open_folder_handler(
    State(state): State<AppState>,
    AxumPath(sha256): AxumPath<String>,
) -> Result<Json<OpenResponse>, ApiError> {
    let path = blocking_store(state.config, move |store| resolve_path(store, &sha256))
        .await
        .map_err(|e| EngineError::Fatal(e.into()))??;
    let folder = std::path::Path::new(&path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or(path);
    spawn_os_opener(&folder);
    Ok(Json(OpenResponse { path: folder }))
}

fn resolve_path(store: &StoreHandle, sha256: &str) -> Result<String, EngineError> {
    store
        .connection()
        .query_row(
            "SELECT f.path FROM index.files f JOIN index.items i ON i.id = f.item_id \
             WHERE i.sha256 = ?1 LIMIT 1",
            rusqlite::params![sha256],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::not_found(format!("no file for sha256 {sha256}"))
            }
            other => EngineError::Store(other),
        })
}

fn spawn_os_opener(path: &str) {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "explorer"
    } else {
        "xdg-open"
    };
    if let Err(e) = std::process::Command::new(opener).arg(path).spawn() {
        error!(path, error = %e, "failed to spawn OS file opener");
    }
}
