use crate::semantic::{EngineState, SearchEngine, SearchError, SearchResult};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
pub struct SharedState {
    pub engine: Arc<SearchEngine>,
    pub default_top_k: usize,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/search", post(search))
        .route("/docs/count", get(doc_count))
        .route("/rebuild", post(rebuild))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(Arc::new(state))
}

async fn start_app(state: SharedState, listen: &str) -> anyhow::Result<()> {
    let engine = state.engine.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("shutting down");
    engine.close()?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => log::error!("failed to install signal handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

pub fn start_daemon(state: SharedState, listen: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(state, listen).await })
}

#[derive(Debug)]
struct HttpError(SearchError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_unavailable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            log::error!("{self:?}");
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<SearchError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Run a blocking engine call off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, HttpError>
where
    F: FnOnce() -> Result<T, SearchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SearchError::Internal(format!("task failed: {e}")))?
        .map_err(HttpError)
}

async fn root(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "docsearch",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Semantic search over a folder of text documents",
        "endpoints": {
            "health": "/health",
            "search": "/search (POST)",
            "docs_count": "/docs/count",
            "rebuild": "/rebuild (POST)",
        },
        "status": state.engine.status(),
    }))
}

async fn health(State(state): State<Arc<SharedState>>) -> Result<Json<serde_json::Value>, HttpError> {
    let status = state.engine.status();
    match status.state {
        EngineState::Uninitialized => return Err(HttpError(SearchError::NotLoaded)),
        EngineState::Loaded => return Err(HttpError(SearchError::NotIndexed)),
        EngineState::Indexed => {}
    }

    Ok(Json(json!({
        "status": "API running",
        "docs_loaded": status.documents,
        "index_built": true,
        "backend": status.backend,
        "fallback": status.fallback,
    })))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Values below 1 are rejected with 400
    pub top_k: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub top_k: usize,
    pub count: usize,
    pub results: Vec<SearchResult>,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, HttpError> {
    let Json(payload) = payload.map_err(|e| SearchError::InvalidRequest(e.body_text()))?;
    log::debug!("payload: {payload:?}");

    let top_k = match payload.top_k {
        None => state.default_top_k,
        Some(k) => usize::try_from(k)
            .ok()
            .filter(|k| *k >= 1)
            .ok_or(SearchError::InvalidTopK(k))?,
    };
    let engine = state.engine.clone();
    let query = payload.query.clone();
    let results = blocking(move || engine.search(&query, top_k)).await?;

    Ok(Json(SearchResponse {
        query: payload.query,
        top_k,
        count: results.len(),
        results,
    }))
}

async fn doc_count(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    let status = state.engine.status();
    Json(json!({
        "count": status.documents,
        "indexed": status.indexed,
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RebuildParams {
    #[serde(default)]
    pub force_recompute: bool,
}

async fn rebuild(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<RebuildParams>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let engine = state.engine.clone();
    let report = blocking(move || engine.build_index(params.force_recompute)).await?;

    Ok(Json(json!({
        "status": "Index rebuilt successfully",
        "docs_indexed": report.documents,
        "cache_hits": report.cache_hits,
        "computed": report.computed,
        "backend": report.backend,
        "fallback": report.fallback,
    })))
}
