//! HTTP surface: the blocking `/converter` endpoint, the WebSocket
//! `/ws/converter` endpoint (see [`crate::stream`]) and the small
//! informational routes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use gitscape_core::acquire::GitAcquirer;
use gitscape_core::contract::redact_url;
use gitscape_core::progress::{DiscardSink, ProgressSink};
use gitscape_core::{
    Acquirer, Budget, Digest, DigestError, DigestRequest, DigestSummary, ErrorKind, PatternRule,
    Pipeline,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::load_config::AppConfig;
use crate::stream;

/// Listener and admission settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins; `*` allows any.
    pub cors_origins: Vec<String>,
    /// Digestions allowed to run at once; further requests wait.
    pub max_concurrent_digests: usize,
    /// Wall-clock limit per request, after which the operation is cancelled.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["*".to_string()],
            max_concurrent_digests: 4,
            request_timeout_secs: 300,
        }
    }
}

/// Shared state handed to every handler.
pub struct AppState<A> {
    pub pipeline: Arc<Pipeline<A>>,
    permits: Arc<Semaphore>,
    default_token: Option<SecretString>,
    request_timeout: Duration,
}

impl<A> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            permits: Arc::clone(&self.permits),
            default_token: self.default_token.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<A: Acquirer> AppState<A> {
    pub fn new(
        pipeline: Pipeline<A>,
        server: &ServerConfig,
        default_token: Option<SecretString>,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(server.max_concurrent_digests.max(1))),
            default_token,
            request_timeout: Duration::from_secs(server.request_timeout_secs),
        }
    }

    /// Run one digestion under the admission limit and the request deadline.
    /// Admission is awaited after the `queued` event and request validation.
    pub async fn digest(
        &self,
        mut request: DigestRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<Digest, DigestError> {
        if request.token.is_none() {
            request.token = self.default_token.clone();
        }
        let deadline = cancel_after(cancel.clone(), self.request_timeout);
        let (permits, waiting) = (Arc::clone(&self.permits), cancel.clone());
        // Awaited by the pipeline after `queued`; the permit lives until the run ends.
        let admission = async move {
            tokio::select! {
                _ = waiting.cancelled() => Err(DigestError::Cancelled),
                permit = permits.acquire_owned() => permit
                    .map_err(|_| DigestError::InternalError("server is shutting down".into())),
            }
        };
        let result = self
            .pipeline
            .run_admitted(request, sink, cancel, admission)
            .await;
        deadline.abort();
        result
    }
}

fn cancel_after(cancel: CancellationToken, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if !cancel.is_cancelled() {
            warn!(timeout_secs = timeout.as_secs(), "Request deadline reached, cancelling");
            cancel.cancel();
        }
    })
}

/// A [`DigestError`] rendered as a JSON response.
pub struct ApiError(pub DigestError);

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::RefNotFound => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::TransportError => StatusCode::BAD_GATEWAY,
        ErrorKind::AcquisitionTimeout => StatusCode::GATEWAY_TIMEOUT,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = ErrorBody {
            error: kind,
            message: self.0.to_string(),
        };
        (status_for(kind), Json(body)).into_response()
    }
}

/// Body of a successful blocking retrieval.
#[derive(Debug, Serialize)]
pub struct ConverterResponse {
    /// Markdown rendering of the whole digest.
    pub digest: String,
    pub summary: DigestSummary,
    pub tree: String,
}

#[derive(Serialize)]
struct Message {
    message: &'static str,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

/// Query string of the blocking endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConverterQuery {
    pub repo_url: String,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub github_token: Option<String>,
    /// Comma-separated patterns.
    #[serde(default)]
    pub include: Option<String>,
    #[serde(default)]
    pub exclude: Option<String>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub subpath: Option<String>,
}

fn split_patterns(raw: Option<&str>) -> Vec<PatternRule> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PatternRule::parse)
            .collect()
    })
    .unwrap_or_default()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ConverterQuery {
    pub fn into_request(self) -> Result<DigestRequest, DigestError> {
        let budget = match (self.max_bytes, self.max_tokens) {
            (Some(_), Some(_)) => {
                return Err(DigestError::InvalidRequest(
                    "max_bytes and max_tokens are mutually exclusive".into(),
                ))
            }
            (Some(bytes), None) => Some(Budget::Bytes(bytes)),
            (None, Some(tokens)) => Some(Budget::Tokens(tokens)),
            (None, None) => None,
        };
        let mut request = DigestRequest::new(self.repo_url)
            .with_include(split_patterns(self.include.as_deref()))
            .with_exclude(split_patterns(self.exclude.as_deref()));
        request.reference = non_empty(self.reference);
        request.token = non_empty(self.github_token).map(SecretString::from);
        request.budget = budget;
        request.subpath = non_empty(self.subpath);
        Ok(request)
    }
}

/// Build the router with every route.
pub fn build_router<A: Acquirer + 'static>(state: AppState<A>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/converter", get(converter_handler::<A>))
        .route("/ws/converter", get(stream::ws_handler::<A>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn root_handler() -> impl IntoResponse {
    Json(Message {
        message: "GitScape",
    })
}

async fn health_handler() -> impl IntoResponse {
    Json(Health { status: "healthy" })
}

/// Blocking retrieval: progress is discarded and only the outcome is returned.
async fn converter_handler<A: Acquirer + 'static>(
    State(state): State<AppState<A>>,
    query: Result<Query<ConverterQuery>, QueryRejection>,
) -> Result<Json<ConverterResponse>, ApiError> {
    let Query(query) =
        query.map_err(|e| ApiError(DigestError::InvalidRequest(e.body_text())))?;
    let request = query.into_request().map_err(ApiError)?;
    info!(repo_url = %redact_url(&request.url), "Blocking digest requested");

    // Dropping the handler (client gone) cancels the operation.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let digest = state
        .digest(request, Arc::new(DiscardSink), cancel)
        .await
        .map_err(ApiError)?;

    Ok(Json(ConverterResponse {
        digest: digest.to_markdown(),
        summary: digest.summary,
        tree: digest.tree,
    }))
}

/// A running server.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

/// Bind and serve on a background task.
pub async fn start(config: &AppConfig) -> std::io::Result<ServerHandle> {
    let pipeline = Pipeline::git(Arc::new(config.pipeline.clone()));
    let state: AppState<GitAcquirer> =
        AppState::new(pipeline, &config.server, config.default_token.clone());
    start_with(state, &config.server).await
}

/// Bind and serve an already-built state. Port `0` picks a free port.
pub async fn start_with<A: Acquirer + 'static>(
    state: AppState<A>,
    server: &ServerConfig,
) -> std::io::Result<ServerHandle> {
    let router = build_router(state, &server.cors_origins);
    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "GitScape server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
        {
            tracing::error!(error = ?e, "Server terminated with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}
